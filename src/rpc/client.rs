//! RPC client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Request, Response, Result, RpcError};
use crate::bus::envelope::CONTENT_TYPE_JSON;
use crate::bus::{
    BrokerChannel, BusError, DeliveryStream, OutboundMessage, Publisher, QueueSpec, Transport,
};
use crate::metrics::Metrics;

/// Issues requests to remote peers and waits for their correlated reply.
///
/// Each call declares its own exclusive, auto-delete reply queue on its own
/// channel, so concurrent calls never share correlation state.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<Transport>,
    publisher: Publisher,
    service: String,
    default_timeout: Duration,
    metrics: Option<Metrics>,
}

impl RpcClient {
    pub fn new(publisher: Publisher, service: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            transport: Arc::clone(publisher.transport()),
            publisher,
            service: service.into(),
            default_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send `request` to `target` and wait up to `timeout` for the reply.
    pub async fn call(&self, target: &str, request: Request, timeout: Duration) -> Result<Response> {
        self.call_cancellable(target, request, timeout, &CancellationToken::new())
            .await
    }

    /// Like `call`, but also gives up when `cancel` fires.
    pub async fn call_cancellable(
        &self,
        target: &str,
        request: Request,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let request = self.stamp(request);
        let method = request.method;
        let payload = serde_json::to_vec(&request).map_err(RpcError::Encode)?;
        let started = Instant::now();

        let channel = self.transport.channel().await?;
        let guard = ChannelGuard::new(Arc::clone(&channel));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RpcError::Cancelled {
                target: target.to_string(),
            }),
            _ = tokio::time::sleep(timeout) => Err(RpcError::Timeout {
                target: target.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            reply = exchange(channel.as_ref(), target, payload) => reply,
        };
        guard.close().await;

        if let Some(metrics) = &self.metrics {
            metrics
                .rpc_duration_seconds
                .with_label_values(&[target, method.as_str()])
                .observe(started.elapsed().as_secs_f64());
        }

        match &outcome {
            Ok(response) => debug!(
                target,
                uri = %request.uri,
                status_code = response.status_code,
                "RPC reply received"
            ),
            Err(e) => warn!(target, uri = %request.uri, error = %e, "RPC call failed"),
        }
        outcome
    }

    /// Fire-and-forget request; no reply queue is attached.
    pub async fn send(&self, target: &str, request: Request) -> Result<()> {
        let message = self.encode(request)?;
        self.publisher.publish(target, message).await?;
        Ok(())
    }

    /// Fire-and-forget request delivered to `target` after `delay`.
    pub async fn send_delayed(&self, target: &str, request: Request, delay: Duration) -> Result<()> {
        let message = self.encode(request)?;
        self.publisher.publish_delayed(target, message, delay).await?;
        debug!(target, delay_ms = %delay.as_millis(), "Scheduled delayed request");
        Ok(())
    }

    fn stamp(&self, mut request: Request) -> Request {
        if request.publisher.is_empty() {
            request.publisher = self.service.clone();
        }
        request
    }

    fn encode(&self, request: Request) -> Result<OutboundMessage> {
        let payload = serde_json::to_vec(&self.stamp(request)).map_err(RpcError::Encode)?;
        Ok(OutboundMessage::new(payload).with_content_type(CONTENT_TYPE_JSON))
    }
}

/// Declare the reply queue, publish, and wait for the matching reply.
async fn exchange(
    channel: &dyn BrokerChannel,
    target: &str,
    payload: Vec<u8>,
) -> Result<Response> {
    let reply_queue = channel.declare_queue(&QueueSpec::reply()).await?;
    let mut replies = channel.consume(&reply_queue, "", true).await?;

    let correlation_id = Uuid::new_v4().to_string();
    let message = OutboundMessage::new(payload)
        .with_content_type(CONTENT_TYPE_JSON)
        .with_reply_to(reply_queue.as_str())
        .with_correlation_id(correlation_id.as_str());
    channel.publish("", target, message).await?;

    first_reply(&mut replies, &correlation_id).await
}

/// First reply that carries `correlation_id` (or none) and deserializes.
pub(crate) async fn first_reply(
    replies: &mut DeliveryStream,
    correlation_id: &str,
) -> Result<Response> {
    while let Some(delivery) = replies.next().await {
        let delivery = delivery?;
        if let Some(id) = delivery.properties.correlation_id.as_deref() {
            if id != correlation_id {
                debug!(expected = correlation_id, got = id, "Skipping uncorrelated reply");
                continue;
            }
        }
        match serde_json::from_slice::<Response>(&delivery.data) {
            Ok(response) => return Ok(response),
            Err(e) => warn!(error = %e, "Discarding undecodable reply"),
        }
    }
    Err(RpcError::Bus(BusError::Consume(
        "reply stream closed before a reply arrived".to_string(),
    )))
}

/// Closes the per-call channel, also when the call future is dropped.
struct ChannelGuard {
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl ChannelGuard {
    fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    async fn close(mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = channel.close().await;
                });
            }
        }
    }
}
