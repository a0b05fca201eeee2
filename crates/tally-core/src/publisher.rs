//! Downstream publisher for flushed counts.
//!
//! Counts are published as plain-text bodies to a single durable queue with
//! persistent delivery mode. When no queue connection could be made at
//! startup the aggregator falls back to logging the count instead; see
//! [`crate::aggregator`].

use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use crate::{Error, Result};

/// AMQP delivery mode requesting the broker persist the message.
const PERSISTENT: u8 = 2;

/// How long startup waits for the broker before falling back to logging.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sink for flushed window counts.
#[async_trait]
pub trait CountPublisher: Send + Sync {
    /// Deliver one message body downstream.
    async fn publish(&self, message: &[u8]) -> Result<()>;
}

/// Publishes to a durable RabbitMQ queue through the default exchange.
pub struct AmqpPublisher {
    // Held so the channel's connection stays open.
    _connection: Connection,
    channel: Channel,
    queue: String,
}

impl AmqpPublisher {
    /// Connect to the broker and declare `queue` as durable.
    ///
    /// Fails with [`Error::QueueUnavailable`] if the handshake has not
    /// completed within `timeout`.
    pub async fn connect(amqp_url: &str, queue: &str, timeout: Duration) -> Result<Self> {
        let connect = Connection::connect(amqp_url, ConnectionProperties::default());
        let connection = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                Error::QueueUnavailable(format!("connect timed out after {timeout:?}"))
            })??;
        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue = %queue, "connected to queue, counts will be published");

        Ok(Self {
            _connection: connection,
            channel,
            queue: queue.to_string(),
        })
    }

    /// AMQP URL for a host/port pair on the default vhost.
    pub fn url(host: &str, port: u16) -> String {
        format!("amqp://{host}:{port}/%2f")
    }
}

#[async_trait]
impl CountPublisher for AmqpPublisher {
    async fn publish(&self, message: &[u8]) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                message,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;

        tracing::debug!(
            queue = %self.queue,
            body = %String::from_utf8_lossy(message),
            "published count"
        );
        Ok(())
    }
}

/// Attempt the startup connection; absence is not an error.
///
/// Returns `None` (and logs why) when the broker cannot be reached. There is
/// no reconnection: a publisher that is absent at startup stays absent.
pub async fn connect_optional(amqp_url: &str, queue: &str) -> Option<AmqpPublisher> {
    match AmqpPublisher::connect(amqp_url, queue, DEFAULT_CONNECT_TIMEOUT).await {
        Ok(publisher) => Some(publisher),
        Err(e) => {
            tracing::error!(error = %e, "queue connection failed, counts will be logged instead");
            None
        }
    }
}
