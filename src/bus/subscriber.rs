//! Queue consume loop with explicit shutdown.
//!
//! Deliveries are handled one at a time in arrival order. Connection loss
//! ends the consumer stream; the loop then waits for the transport to
//! reconnect and consumes again. Cancellation stops the loop between
//! deliveries, never in the middle of one.

use std::sync::Arc;

use async_trait::async_trait;
use backon::BackoffBuilder;
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BackoffConfig, BrokerChannel, Delivery, DeliveryStream, Result, Transport};

/// When deliveries are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Broker considers the message delivered on send (at-most-once).
    Auto,
    /// Ack once the handler returns, whatever its outcome (at-least-once).
    #[default]
    AfterHandling,
}

/// Processes one delivery. Failures are the handler's to log; the loop acks
/// regardless.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery);
}

/// Consume loop over one named queue.
#[derive(Clone)]
pub struct Subscriber {
    transport: Arc<Transport>,
    queue: String,
    consumer_tag: String,
    ack_mode: AckMode,
    prefetch: u16,
    retry: BackoffConfig,
}

impl Subscriber {
    pub fn new(transport: Arc<Transport>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            transport,
            consumer_tag: format!("{}-consumer", queue),
            queue,
            ack_mode: AckMode::default(),
            prefetch: 10,
            retry: BackoffConfig::default(),
        }
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run the loop on a background task until `shutdown` is cancelled or
    /// the transport closes.
    pub fn spawn(
        self,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(handler, shutdown).await })
    }

    pub async fn run(self, handler: Arc<dyn DeliveryHandler>, shutdown: CancellationToken) {
        let mut backoff = self.retry.builder().build();

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.transport.wait_connected() => r,
            };
            if connected.is_err() {
                break;
            }

            match self.open().await {
                Ok((channel, stream)) => {
                    info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Consuming");
                    backoff = self.retry.builder().build();
                    self.drain(stream, handler.as_ref(), &shutdown).await;
                    let _ = channel.close().await;
                    if shutdown.is_cancelled() {
                        break;
                    }
                    warn!(queue = %self.queue, "Consumer stream ended, re-consuming");
                }
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Failed to start consumer");
                }
            }

            let delay = backoff.next().unwrap_or(self.retry.max_delay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(queue = %self.queue, "Consume loop stopped");
    }

    async fn open(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream)> {
        let channel = self.transport.channel().await?;
        let auto_ack = self.ack_mode == AckMode::Auto;
        if !auto_ack {
            channel.set_prefetch(self.prefetch).await?;
        }
        let stream = channel
            .consume(&self.queue, &self.consumer_tag, auto_ack)
            .await?;
        Ok((channel, stream))
    }

    async fn drain(
        &self,
        mut stream: DeliveryStream,
        handler: &dyn DeliveryHandler,
        shutdown: &CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    handler.handle(&delivery).await;
                    if self.ack_mode == AckMode::AfterHandling {
                        if let Err(e) = delivery.ack().await {
                            error!(queue = %self.queue, error = %e, "Failed to ack delivery");
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(queue = %self.queue, error = %e, "Consumer error");
                    return;
                }
                None => {
                    debug!(queue = %self.queue, "Consumer stream closed");
                    return;
                }
            }
        }
    }
}
