use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the database is reachable.
    pub db_healthy: bool,
    /// Whether the event publisher holds an open broker session.
    pub broker_connected: bool,
}

/// GET /health -- returns service, database and broker health.
///
/// This reports the publisher's current state and never triggers a
/// reconnect.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_healthy = users_db::health_check(&state.pool).await.is_ok();
    let broker_connected = state.publisher.is_connected().await;

    let status = if db_healthy && broker_connected {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        db_healthy,
        broker_connected,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
