//! Fire-and-forget publishing over the shared transport.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::envelope::{Envelope, CONTENT_TYPE_JSON};
use super::{BusError, OutboundMessage, Result, Transport};

/// Publishes messages on a fresh logical channel per send.
///
/// While the transport is reconnecting, publishes fail fast with
/// `BusError::Unavailable` rather than queueing.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<Transport>,
    delay_exchange: String,
}

impl Publisher {
    pub fn new(transport: Arc<Transport>, delay_exchange: impl Into<String>) -> Self {
        Self {
            transport,
            delay_exchange: delay_exchange.into(),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Send to a queue via the default exchange.
    pub async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        self.send("", queue, message).await
    }

    /// Send to an exchange with a routing key.
    pub async fn publish_to(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        self.send(exchange, routing_key, message).await
    }

    /// Send an envelope as JSON to an exchange.
    pub async fn publish_event(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        let payload = envelope
            .to_vec()
            .map_err(|e| BusError::Publish(format!("Failed to encode envelope: {}", e)))?;
        let message = OutboundMessage::new(payload).with_content_type(CONTENT_TYPE_JSON);
        self.send(exchange, routing_key, message).await
    }

    /// Send to a queue after `delay`, via the delayed-message exchange.
    ///
    /// The target queue must be bound to the delay exchange under its own
    /// name.
    pub async fn publish_delayed(
        &self,
        queue: &str,
        message: OutboundMessage,
        delay: Duration,
    ) -> Result<()> {
        let exchange = self.delay_exchange.clone();
        self.send(&exchange, queue, message.with_delay(delay)).await
    }

    async fn send(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<()> {
        let channel = self.transport.channel().await?;
        let result = channel.publish(exchange, routing_key, message).await;
        let _ = channel.close().await;
        result?;

        debug!(exchange, routing_key, "Message published");
        Ok(())
    }
}
