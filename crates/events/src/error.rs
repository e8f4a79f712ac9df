//! Error types for broker transports and the event publisher.

// ---------------------------------------------------------------------------
// BrokerError
// ---------------------------------------------------------------------------

/// A failure reported by a broker transport.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Protocol or I/O error from the AMQP client.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The broker could not be reached.
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// The session was closed by the broker or locally.
    #[error("Channel is closed")]
    ChannelClosed,

    /// The broker negatively acknowledged a published message.
    #[error("Broker rejected the message: {0}")]
    Rejected(String),

    /// A redeclaration conflicted with the existing entity.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Publish or bind referenced an exchange that was never declared.
    #[error("Exchange not found: {0}")]
    UnknownExchange(String),
}

// ---------------------------------------------------------------------------
// PublishError
// ---------------------------------------------------------------------------

/// A failure surfaced by [`EventPublisher`](crate::EventPublisher).
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Connecting exhausted every attempt of the retry policy.
    #[error("Failed to connect to message broker after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    /// Publishing failed, and so did the single reconnect-and-retry.
    #[error("Failed to publish event '{routing_key}': {source}")]
    Publish {
        routing_key: String,
        #[source]
        source: BrokerError,
    },

    /// The payload could not be encoded as JSON.
    #[error("Failed to serialize event payload: {0}")]
    Serialization(#[from] serde_json::Error),
}
