//! RabbitMQ transport backed by `lapin`.
//!
//! [`AmqpConnector`] holds the connection URL. Each call to
//! [`connect`](BrokerConnector::connect) dials a fresh
//! [`lapin::Connection`] and opens a single [`lapin::Channel`] on it.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

use crate::broker::{BrokerConnector, BrokerSession, MessageProperties};
use crate::error::BrokerError;

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Connects to a RabbitMQ broker over AMQP 0-9-1.
pub struct AmqpConnector {
    url: String,
    publisher_confirms: bool,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>, publisher_confirms: bool) -> Self {
        Self {
            url: url.into(),
            publisher_confirms,
        }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel setup failed").await;
                return Err(e.into());
            }
        };

        if self.publisher_confirms {
            if let Err(e) = channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
            {
                let _ = connection.close(REPLY_SUCCESS, "confirm setup failed").await;
                return Err(e.into());
            }
        }

        tracing::debug!(
            channel_id = channel.id(),
            publisher_confirms = self.publisher_confirms,
            "Opened AMQP channel"
        );

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
            publisher_confirms: self.publisher_confirms,
        }))
    }
}

/// A lapin connection with its single channel.
struct AmqpSession {
    connection: Connection,
    channel: Channel,
    publisher_confirms: bool,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_topic_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        let amqp_properties = BasicProperties::default()
            .with_content_type(properties.content_type.clone().into())
            .with_delivery_mode(properties.delivery_mode);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                amqp_properties,
            )
            .await?;

        // Without confirm mode this resolves immediately to `NotRequested`.
        match confirm.await? {
            Confirmation::Nack(_) => Err(BrokerError::Rejected(format!(
                "nack for '{routing_key}' on exchange '{exchange}'"
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => {
                if self.publisher_confirms {
                    tracing::trace!(routing_key, "Broker acknowledged publish");
                }
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "closing").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "closing").await?;
        }
        Ok(())
    }
}
