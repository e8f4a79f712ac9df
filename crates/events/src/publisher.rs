//! Long-lived event publisher owning the single broker session.
//!
//! [`EventPublisher`] is created once at startup and shared as
//! `Arc<EventPublisher>`. It holds at most one open [`BrokerSession`].
//!
//! - [`ensure_connected`](EventPublisher::ensure_connected) connects with
//!   exponential backoff when no open session exists.
//! - Every new session declares the [`Topology`] before it is stored.
//! - [`publish`](EventPublisher::publish) retries exactly once through a
//!   fresh session when a publish fails.
//! - Callers that queued behind a connect cycle which then failed get that
//!   cycle's error instead of starting another one.
//!
//! Delivery is at least once: if the broker accepted the first attempt but
//! the outcome was lost, the republish produces a duplicate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::amqp::AmqpConnector;
use crate::broker::{BrokerConnector, BrokerSession, MessageProperties, Topology};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, PublishError};
use crate::event::UserEvent;
use crate::memory::MemoryBroker;
use crate::retry::RetryPolicy;

type Session = Arc<dyn BrokerSession>;

/// State guarded by the publisher's lock.
#[derive(Default)]
struct Link {
    /// `None` while disconnected.
    session: Option<Session>,
    /// Outcome of the most recent connect cycle that gave up.
    last_failure: Option<CycleFailure>,
}

struct CycleFailure {
    attempts: u32,
    error: String,
}

/// Publishes JSON events to a topic exchange.
pub struct EventPublisher {
    connector: Arc<dyn BrokerConnector>,
    topology: Topology,
    retry: RetryPolicy,
    properties: MessageProperties,
    /// The write lock guards (re)connection.
    link: RwLock<Link>,
    /// Number of connect cycles that exhausted every attempt.
    failed_cycles: AtomicU64,
}

impl EventPublisher {
    /// Create a disconnected publisher. No I/O happens until the first
    /// [`ensure_connected`](Self::ensure_connected) or
    /// [`publish`](Self::publish).
    pub fn new(connector: Arc<dyn BrokerConnector>, topology: Topology, retry: RetryPolicy) -> Self {
        Self {
            connector,
            topology,
            retry,
            properties: MessageProperties::persistent_json(),
            link: RwLock::new(Link::default()),
            failed_cycles: AtomicU64::new(0),
        }
    }

    /// Build a publisher from configuration.
    ///
    /// A `memory://` URL selects a fresh [`MemoryBroker`]; anything else is
    /// treated as an AMQP URL.
    pub fn from_config(config: &BrokerConfig) -> Self {
        let connector: Arc<dyn BrokerConnector> = if config.is_memory() {
            tracing::warn!("Using in-process memory broker, events stay inside this process");
            Arc::new(MemoryBroker::new())
        } else {
            Arc::new(AmqpConnector::new(
                config.url.clone(),
                config.publisher_confirms,
            ))
        };
        Self::new(connector, config.topology.clone(), config.retry.clone())
    }

    /// Whether an open session is currently held.
    ///
    /// Reports `false` without waiting while another caller is connecting.
    pub async fn is_connected(&self) -> bool {
        match self.link.try_read() {
            Ok(link) => link.session.as_ref().is_some_and(|s| s.is_open()),
            Err(_) => false,
        }
    }

    /// Connect with retry unless an open session is already held.
    ///
    /// Callers racing on a disconnected publisher are serialized by the
    /// write lock. Only the first one connects and the rest reuse its
    /// session, or its error if the cycle gave up.
    pub async fn ensure_connected(&self) -> Result<(), PublishError> {
        self.current_or_connect().await.map(|_| ())
    }

    /// Serialize `payload` as JSON and publish it under `routing_key`.
    ///
    /// A failed publish discards the session, reconnects and publishes once
    /// more. The second failure is returned to the caller.
    pub async fn publish<T>(&self, routing_key: &str, payload: &T) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload)?;
        let session = self.current_or_connect().await?;

        let first_err = match self.send(&session, routing_key, &body).await {
            Ok(()) => {
                tracing::info!(routing_key, bytes = body.len(), "Published event");
                return Ok(());
            }
            Err(e) => e,
        };

        tracing::warn!(
            routing_key,
            error = %first_err,
            "Failed to publish event, reconnecting and retrying"
        );
        self.discard(&session).await;

        let session = self.current_or_connect().await?;
        match self.send(&session, routing_key, &body).await {
            Ok(()) => {
                tracing::info!(routing_key, "Republished event after reconnection");
                Ok(())
            }
            Err(source) => {
                tracing::error!(
                    routing_key,
                    error = %source,
                    "Failed to republish event after reconnection"
                );
                self.discard(&session).await;
                Err(PublishError::Publish {
                    routing_key: routing_key.to_string(),
                    source,
                })
            }
        }
    }

    /// Publish a [`UserEvent`] under its own routing key.
    pub async fn publish_event(&self, event: &UserEvent) -> Result<(), PublishError> {
        self.publish(event.routing_key(), event).await
    }

    /// Close the session if one is open. Calling this when disconnected is
    /// a no-op.
    pub async fn close(&self) {
        let Some(session) = self.link.write().await.session.take() else {
            return;
        };
        if !session.is_open() {
            return;
        }
        match session.close().await {
            Ok(()) => tracing::info!("Message broker connection closed"),
            Err(e) => tracing::warn!(error = %e, "Error while closing message broker connection"),
        }
    }

    // ---- private helpers ----

    async fn current_or_connect(&self) -> Result<Session, PublishError> {
        let seen_failures = self.failed_cycles.load(Ordering::Acquire);

        if let Some(session) = self.link.read().await.session.as_ref() {
            if session.is_open() {
                return Ok(Arc::clone(session));
            }
        }

        let mut link = self.link.write().await;
        // Another caller may have connected while we waited for the lock.
        if let Some(session) = link.session.as_ref() {
            if session.is_open() {
                return Ok(Arc::clone(session));
            }
            tracing::info!("Message broker session is closed, reconnecting");
        }
        link.session = None;

        // A cycle gave up while we waited: share its outcome.
        if self.failed_cycles.load(Ordering::Acquire) != seen_failures {
            if let Some(failure) = link.last_failure.as_ref() {
                return Err(PublishError::Connection {
                    attempts: failure.attempts,
                    source: BrokerError::Unreachable(failure.error.clone()),
                });
            }
        }

        match self.connect_with_retry().await {
            Ok(session) => {
                link.session = Some(Arc::clone(&session));
                link.last_failure = None;
                Ok(session)
            }
            Err(err) => {
                if let PublishError::Connection { attempts, source } = &err {
                    link.last_failure = Some(CycleFailure {
                        attempts: *attempts,
                        error: source.to_string(),
                    });
                }
                self.failed_cycles.fetch_add(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    async fn connect_with_retry(&self) -> Result<Session, PublishError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.connect().await {
                Ok(session) => {
                    tracing::info!(
                        attempt,
                        exchange = %self.topology.exchange,
                        queue = %self.topology.queue,
                        "Connected to message broker"
                    );
                    return Ok(session);
                }
                Err(source) if attempt >= max_attempts => {
                    tracing::error!(
                        attempts = attempt,
                        error = %source,
                        "Failed to connect to message broker after all retries"
                    );
                    return Err(PublishError::Connection {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to connect to message broker, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.retry.next_delay(delay);
                }
            }
        }
    }

    /// Open a session and declare the topology on it.
    async fn connect(&self) -> Result<Session, BrokerError> {
        let session = self.connector.connect().await?;
        if let Err(e) = self.declare_topology(session.as_ref()).await {
            let _ = session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn declare_topology(&self, session: &dyn BrokerSession) -> Result<(), BrokerError> {
        let Topology {
            exchange,
            queue,
            binding_key,
        } = &self.topology;

        session.declare_topic_exchange(exchange, true).await?;
        session.declare_queue(queue, true).await?;
        session.bind_queue(queue, exchange, binding_key).await
    }

    async fn send(&self, session: &Session, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        session
            .publish(&self.topology.exchange, routing_key, body, &self.properties)
            .await
    }

    /// Drop `failed` if it is still the stored session.
    async fn discard(&self, failed: &Session) {
        let mut link = self.link.write().await;
        if link.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, failed)) {
            link.session = None;
        }
        drop(link);
        let _ = failed.close().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
