#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use sqlx::PgPool;
use tower::ServiceExt;

use users_api::config::ServerConfig;
use users_api::router::build_app_router;
use users_api::state::AppState;
use users_events::{BrokerConfig, EventPublisher, MemoryBroker, RetryPolicy, Topology};

/// Queue bound to `user.*` by the default topology.
pub const EVENTS_QUEUE: &str = "task_service_queue";

/// Build a test `ServerConfig` with safe defaults.
///
/// Uses `http://localhost:3000` as CORS origin (matching the dev default),
/// a 30-second request timeout and an in-process broker that retries
/// without sleeping.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:3000".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        broker: BrokerConfig {
            url: "memory://".to_string(),
            retry: RetryPolicy::immediate(2),
            ..Default::default()
        },
    }
}

/// A publisher wired to `broker` with the default topology.
pub fn test_publisher(broker: &MemoryBroker) -> Arc<EventPublisher> {
    Arc::new(EventPublisher::new(
        Arc::new(broker.clone()),
        Topology::default(),
        RetryPolicy::immediate(2),
    ))
}

/// Build the full application router backed by a fresh in-process broker.
pub fn build_test_app(pool: PgPool) -> Router {
    build_test_app_with_broker(pool, &MemoryBroker::new())
}

/// Build the full application router publishing into `broker`, so tests can
/// inspect delivered events or inject broker faults.
pub fn build_test_app_with_broker(pool: PgPool, broker: &MemoryBroker) -> Router {
    let config = test_config();
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        publisher: test_publisher(broker),
    };
    build_app_router(state, &config)
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn send(app: Router, request: Request<Body>) -> Response {
    app.oneshot(request).await.unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn delete(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

async fn send_json(app: Router, method: Method, uri: &str, body: serde_json::Value) -> Response {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response {
    send_json(app, Method::POST, uri, body).await
}

pub async fn put_json(app: Router, uri: &str, body: serde_json::Value) -> Response {
    send_json(app, Method::PUT, uri, body).await
}

pub async fn patch_json(app: Router, uri: &str, body: serde_json::Value) -> Response {
    send_json(app, Method::PATCH, uri, body).await
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
