//! User event publishing over a topic-based message broker.
//!
//! This crate provides the building blocks for notifying other services
//! about changes to users:
//!
//! - [`EventPublisher`]: long-lived service object owning the single broker
//!   session, connect retry with backoff, and reconnect-on-failure.
//! - [`broker`]: the transport seam ([`BrokerConnector`], [`BrokerSession`]).
//! - [`AmqpConnector`]: RabbitMQ transport backed by `lapin`.
//! - [`MemoryBroker`]: in-process broker for tests and local development.
//! - [`UserEvent`]: payloads for `user.created`, `user.updated`, `user.deleted`.

pub mod amqp;
pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod publisher;
pub mod retry;

pub use amqp::AmqpConnector;
pub use broker::{BrokerConnector, BrokerSession, MessageProperties, Topology};
pub use config::BrokerConfig;
pub use error::{BrokerError, PublishError};
pub use event::UserEvent;
pub use memory::MemoryBroker;
pub use publisher::EventPublisher;
pub use retry::RetryPolicy;
