//! In-process broker with AMQP topic routing.
//!
//! [`MemoryBroker`] stands in for RabbitMQ in tests and in local runs
//! (`RABBITMQ_URL=memory://`). It keeps declared exchanges, durable queues
//! and bindings, routes published messages with topic-exchange rules, and
//! offers fault injection for connection and publish failures.
//!
//! Like a real channel, a session that hits a protocol error
//! (precondition failure, unknown exchange) is closed afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::broker::{BrokerConnector, BrokerSession, MessageProperties};
use crate::error::BrokerError;

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// A message routed into a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Delivery {
    /// Decode the body as JSON.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    /// Bumped by [`MemoryBroker::drop_connections`]; sessions from an older
    /// generation report themselves closed.
    generation: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    /// Exchange name -> durable.
    exchanges: HashMap<String, bool>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: u64,
    refuse_connects: u32,
    fail_publishes: u32,
}

struct QueueState {
    durable: bool,
    messages: Vec<Delivery>,
}

#[derive(PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: u32) {
        self.state().refuse_connects = n;
    }

    /// Fail the next `n` publishes. Each failure also closes the session
    /// it happened on.
    pub fn fail_publishes(&self, n: u32) {
        self.state().fail_publishes = n;
    }

    /// Close every live session, as a broker restart would.
    pub fn drop_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of successful connections so far.
    pub fn connection_count(&self) -> u64 {
        self.state().connections
    }

    /// Durability of a declared exchange, or `None` if it was never declared.
    pub fn exchange_durable(&self, name: &str) -> Option<bool> {
        self.state().exchanges.get(name).copied()
    }

    /// Durability of a declared queue, or `None` if it was never declared.
    pub fn queue_durable(&self, name: &str) -> Option<bool> {
        self.state().queues.get(name).map(|q| q.durable)
    }

    /// Number of bindings on `queue` (duplicates are never stored).
    pub fn binding_count(&self, queue: &str) -> usize {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .count()
    }

    /// Snapshot of the messages currently in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<Delivery> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.clone())
            .unwrap_or_default()
    }

    /// Remove and return the messages currently in `queue`.
    pub fn take_messages(&self, queue: &str) -> Vec<Delivery> {
        self.state()
            .queues
            .get_mut(queue)
            .map(|q| std::mem::take(&mut q.messages))
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        // Give concurrent callers a chance to interleave, as network I/O would.
        tokio::task::yield_now().await;

        {
            let mut state = self.state();
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(BrokerError::Unreachable("connection refused".into()));
            }
            state.connections += 1;
        }

        Ok(Arc::new(MemorySession {
            broker: self.clone(),
            generation: self.generation(),
            closed: AtomicBool::new(false),
        }))
    }
}

// ---------------------------------------------------------------------------
// MemorySession
// ---------------------------------------------------------------------------

struct MemorySession {
    broker: MemoryBroker,
    generation: u64,
    closed: AtomicBool,
}

impl MemorySession {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Close the session and hand back `err`.
    fn fail(&self, err: BrokerError) -> BrokerError {
        self.closed.store(true, Ordering::SeqCst);
        err
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.broker.generation() == self.generation
    }

    async fn declare_topic_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut state = self.broker.state();
        match state.exchanges.get(name) {
            Some(&existing) if existing != durable => Err(self.fail(
                BrokerError::PreconditionFailed(format!(
                    "exchange '{name}' already declared with durable={existing}"
                )),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), durable);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut state = self.broker.state();
        match state.queues.get(name) {
            Some(queue) if queue.durable != durable => {
                let existing = queue.durable;
                Err(self.fail(BrokerError::PreconditionFailed(format!(
                    "queue '{name}' already declared with durable={existing}"
                ))))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        durable,
                        messages: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut state = self.broker.state();
        if !state.exchanges.contains_key(exchange) {
            return Err(self.fail(BrokerError::UnknownExchange(exchange.to_string())));
        }
        if !state.queues.contains_key(queue) {
            return Err(self.fail(BrokerError::PreconditionFailed(format!(
                "queue '{queue}' not declared"
            ))));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut state = self.broker.state();

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(self.fail(BrokerError::ChannelClosed));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(self.fail(BrokerError::UnknownExchange(exchange.to_string())));
        }

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        // Unroutable messages are dropped (non-mandatory publish).
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.messages.push(Delivery {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    properties: properties.clone(),
                });
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Topic routing
// ---------------------------------------------------------------------------

/// Match a routing key against an AMQP topic binding pattern.
///
/// Words are dot-separated. `*` matches exactly one word, `#` matches zero
/// or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(topic_matches("user.*", "user.created"));
        assert!(!topic_matches("user.*", "user"));
        assert!(!topic_matches("user.*", "user.created.v2"));
        assert!(!topic_matches("user.*", "task.created"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(topic_matches("user.#", "user"));
        assert!(topic_matches("user.#", "user.created.v2"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.deleted", "user.deleted"));
        assert!(!topic_matches("#.deleted", "user.created"));
    }

    #[test]
    fn literal_pattern_requires_exact_key() {
        assert!(topic_matches("user.created", "user.created"));
        assert!(!topic_matches("user.created", "user.updated"));
    }

    async fn declared_session(broker: &MemoryBroker) -> Arc<dyn BrokerSession> {
        let session = broker.connect().await.unwrap();
        session.declare_topic_exchange("ex", true).await.unwrap();
        session.declare_queue("q", true).await.unwrap();
        session.bind_queue("q", "ex", "user.*").await.unwrap();
        session
    }

    #[tokio::test]
    async fn routes_matching_messages_into_bound_queue() {
        let broker = MemoryBroker::new();
        let session = declared_session(&broker).await;
        let props = MessageProperties::persistent_json();

        session.publish("ex", "user.created", b"{}", &props).await.unwrap();
        session.publish("ex", "task.created", b"{}", &props).await.unwrap();

        let messages = broker.messages("q");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].routing_key, "user.created");
        assert_eq!(messages[0].properties, props);
    }

    #[tokio::test]
    async fn redeclaring_same_topology_is_idempotent() {
        let broker = MemoryBroker::new();
        declared_session(&broker).await;
        declared_session(&broker).await;

        assert_eq!(broker.exchange_durable("ex"), Some(true));
        assert_eq!(broker.queue_durable("q"), Some(true));
        assert_eq!(broker.binding_count("q"), 1);
    }

    #[tokio::test]
    async fn conflicting_redeclare_fails_and_closes_session() {
        let broker = MemoryBroker::new();
        declared_session(&broker).await;

        let session = broker.connect().await.unwrap();
        let err = session.declare_topic_exchange("ex", false).await.unwrap_err();
        assert_matches!(err, BrokerError::PreconditionFailed(_));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        let err = session
            .publish("missing", "user.created", b"{}", &MessageProperties::persistent_json())
            .await
            .unwrap_err();
        assert_matches!(err, BrokerError::UnknownExchange(name) if name == "missing");
    }

    #[tokio::test]
    async fn refused_connections_are_counted_down() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(2);

        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn drop_connections_closes_live_sessions() {
        let broker = MemoryBroker::new();
        let session = declared_session(&broker).await;
        assert!(session.is_open());

        broker.drop_connections();

        assert!(!session.is_open());
        let err = session
            .publish("ex", "user.created", b"{}", &MessageProperties::persistent_json())
            .await
            .unwrap_err();
        assert_matches!(err, BrokerError::ChannelClosed);

        let fresh = broker.connect().await.unwrap();
        assert!(fresh.is_open());
    }

    #[tokio::test]
    async fn take_messages_drains_queue() {
        let broker = MemoryBroker::new();
        let session = declared_session(&broker).await;
        session
            .publish("ex", "user.deleted", br#"{"user_id":1}"#, &MessageProperties::persistent_json())
            .await
            .unwrap();

        let taken = broker.take_messages("q");
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].json().unwrap()["user_id"], 1);
        assert!(broker.messages("q").is_empty());
    }
}
