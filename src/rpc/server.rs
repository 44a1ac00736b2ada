//! RPC server consume loop.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use super::{Request, Response, Result, RpcError};
use crate::bus::envelope::CONTENT_TYPE_JSON;
use crate::bus::{
    AckMode, BackoffConfig, Delivery, DeliveryHandler, MessageProperties, OutboundMessage,
    Subscriber, Transport,
};

/// Handles one request. `Ok(None)` sends no reply.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Option<Response>>;
}

/// Serves requests from a durable queue, acking each after its handler
/// returns.
pub struct RpcServer {
    transport: Arc<Transport>,
    subscriber: Subscriber,
}

impl RpcServer {
    pub fn new(transport: Arc<Transport>, queue: impl Into<String>) -> Self {
        let subscriber =
            Subscriber::new(Arc::clone(&transport), queue).with_ack_mode(AckMode::AfterHandling);
        Self {
            transport,
            subscriber,
        }
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.subscriber = self.subscriber.with_consumer_tag(tag);
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.subscriber = self.subscriber.with_prefetch(prefetch);
        self
    }

    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.subscriber = self.subscriber.with_retry(retry);
        self
    }

    pub fn spawn(
        self,
        handler: Arc<dyn RequestHandler>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let serve = Arc::new(ServeRequests {
            transport: self.transport,
            handler,
        });
        self.subscriber.spawn(serve, shutdown)
    }
}

struct ServeRequests {
    transport: Arc<Transport>,
    handler: Arc<dyn RequestHandler>,
}

impl ServeRequests {
    async fn reply(&self, properties: &MessageProperties, response: &Response) -> Result<()> {
        let reply_to = properties
            .reply_to
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or(RpcError::NoReplyQueue)?;

        let payload = serde_json::to_vec(response).map_err(RpcError::Encode)?;
        let mut message = OutboundMessage::new(payload).with_content_type(CONTENT_TYPE_JSON);
        if let Some(correlation_id) = &properties.correlation_id {
            message = message.with_correlation_id(correlation_id.as_str());
        }

        let channel = self.transport.channel().await?;
        let published = channel.publish("", reply_to, message).await;
        let _ = channel.close().await;
        published?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandler for ServeRequests {
    async fn handle(&self, delivery: &Delivery) {
        let request: Request = match serde_json::from_slice(&delivery.data) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Dropping malformed request");
                return;
            }
        };

        let span = info_span!(
            "rpc.serve",
            uri = %request.uri,
            method = request.method.as_str(),
            publisher = %request.publisher
        );

        async {
            let response = match self.handler.handle(request).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    debug!("Handler returned no reply");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Request handler failed");
                    return;
                }
            };

            match self.reply(&delivery.properties, &response).await {
                Ok(()) => debug!(status_code = response.status_code, "Reply sent"),
                Err(RpcError::NoReplyQueue) => {
                    debug!("Request carried no reply-to, reply discarded")
                }
                Err(e) => warn!(error = %e, "Failed to send reply"),
            }
        }
        .instrument(span)
        .await
    }
}
