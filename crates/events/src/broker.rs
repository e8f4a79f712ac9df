//! Transport seam between the publisher and a concrete message broker.
//!
//! A [`BrokerConnector`] opens a [`BrokerSession`]: one connection plus one
//! channel. The publisher only ever talks to these traits, so the lapin
//! transport and the in-memory broker are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BrokerError;

/// AMQP `delivery_mode` value marking a message as persistent.
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Content type attached to every published event.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Opens new sessions against a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a connection and a channel on it.
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// A live connection/channel pair.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Whether both the connection and the channel are still usable.
    fn is_open(&self) -> bool;

    async fn declare_topic_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), BrokerError>;

    /// Publish `body` and wait until the transport reports the outcome.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Close the channel and connection. Closing twice is not an error.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Message properties sent alongside the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub delivery_mode: u8,
}

impl MessageProperties {
    /// Persistent delivery with a JSON content type.
    pub fn persistent_json() -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            delivery_mode: DELIVERY_MODE_PERSISTENT,
        }
    }
}

/// Exchange, queue and binding declared on every new session.
///
/// The exchange is always a durable topic exchange and the queue is always
/// durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub binding_key: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: "user_events".to_string(),
            queue: "task_service_queue".to_string(),
            binding_key: "user.*".to_string(),
        }
    }
}
