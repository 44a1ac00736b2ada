//! Periodic channel health checks.
//!
//! A check is a delayed request the engine sends to its own request queue.
//! Each check asks the switch whether the channel still exists and schedules
//! the next one. Consecutive failures are counted in the request; once they
//! exceed the configured maximum the channel is hung up, or finalized
//! locally when the switch no longer knows it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::channel::finalize;
use super::{EngineContext, Result};
use crate::ari::HangupCause;
use crate::rpc::{self, Method, Request, RequestHandler, Response, RpcClient, RpcError};

const URI_PREFIX: &str = "/v1/channels/";
const URI_SUFFIX: &str = "/health-check";

/// Body of a health-check request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    pub retry_count: u32,
    #[serde(default)]
    pub delay_ms: u64,
}

pub fn health_check_uri(channel_id: &str) -> String {
    format!("{}{}{}", URI_PREFIX, channel_id, URI_SUFFIX)
}

fn channel_id_from_uri(uri: &str) -> Option<&str> {
    uri.strip_prefix(URI_PREFIX)?
        .strip_suffix(URI_SUFFIX)
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

/// Sends delayed health-check requests to the engine's request queue.
#[derive(Clone)]
pub struct HealthScheduler {
    rpc: RpcClient,
    queue: String,
    delay: Duration,
    max_retries: u32,
}

impl HealthScheduler {
    pub fn new(rpc: RpcClient, queue: impl Into<String>, delay: Duration, max_retries: u32) -> Self {
        Self {
            rpc,
            queue: queue.into(),
            delay,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Schedule the next check of `channel_id`.
    pub async fn schedule(&self, channel_id: &str, retry_count: u32) -> rpc::Result<()> {
        let body = HealthCheckRequest {
            retry_count,
            delay_ms: self.delay.as_millis() as u64,
        };
        let request = Request::json(Method::Post, health_check_uri(channel_id), &body)?;
        self.rpc.send_delayed(&self.queue, request, self.delay).await
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Channel gone or ended locally; no further checks.
    Stopped,
    /// Switch confirmed the channel; next check scheduled.
    Healthy,
    /// Switch check failed; rescheduled with this retry count.
    Retrying(u32),
    /// Retries exhausted; channel hung up.
    HungUp,
    /// Retries exhausted and the switch no longer knows the channel; the
    /// local row was finalized.
    Finalized,
}

/// Serves health-check requests.
pub struct HealthCheckHandler {
    ctx: Arc<EngineContext>,
    scheduler: HealthScheduler,
}

impl HealthCheckHandler {
    pub fn new(ctx: Arc<EngineContext>, scheduler: HealthScheduler) -> Self {
        Self { ctx, scheduler }
    }

    pub async fn check(&self, channel_id: &str, retry_count: u32) -> Result<HealthVerdict> {
        let channel = match self.ctx.store.channel_get(channel_id).await {
            Ok(channel) if !channel.is_ended() => channel,
            _ => {
                debug!(channel_id, "Channel gone, health check stopped");
                return Ok(HealthVerdict::Stopped);
            }
        };

        let failure = match self.ctx.switch.channel_get(&channel.peer_id, channel_id).await {
            Ok(_) => {
                self.scheduler.schedule(channel_id, 0).await?;
                return Ok(HealthVerdict::Healthy);
            }
            Err(e) => e,
        };

        let retry = retry_count.saturating_add(1);
        if retry <= self.scheduler.max_retries() {
            warn!(channel_id, retry, error = %failure, "Health check failed, retrying");
            self.scheduler.schedule(channel_id, retry).await?;
            return Ok(HealthVerdict::Retrying(retry));
        }

        if failure.is_not_found() {
            info!(channel_id, "Switch lost the channel, finalizing locally");
            finalize(&self.ctx, channel_id, HangupCause::INTERWORKING, Utc::now()).await?;
            return Ok(HealthVerdict::Finalized);
        }

        self.ctx
            .defensive_hangup(&channel.peer_id, channel_id, "health_check")
            .await;
        Ok(HealthVerdict::HungUp)
    }
}

#[async_trait]
impl RequestHandler for HealthCheckHandler {
    async fn handle(&self, request: Request) -> rpc::Result<Option<Response>> {
        let channel_id = match channel_id_from_uri(&request.uri) {
            Some(id) if request.method == Method::Post => id,
            _ => {
                warn!(uri = %request.uri, method = request.method.as_str(), "No route for request");
                return Ok(Some(Response::status(404)));
            }
        };
        let body: HealthCheckRequest = request.body()?;

        let verdict = self
            .check(channel_id, body.retry_count)
            .await
            .map_err(|e| RpcError::Handler(e.to_string()))?;
        debug!(channel_id, ?verdict, "Health check done");
        Ok(Some(Response::status(200)))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use prometheus::Registry;

    use super::*;
    use crate::ari::AriChannel;
    use crate::bus::{BackoffConfig, MemoryBroker, Publisher, Transport};
    use crate::call_control::{CallControlRouter, Notification, RecordingCallControl};
    use crate::engine::{declare_topology, EngineConfig};
    use crate::metrics::Metrics;
    use crate::models::Channel;
    use crate::store::{MemoryStore, StateStore};
    use crate::switch::RecordingSwitch;

    struct Setup {
        transport: Arc<Transport>,
        store: Arc<MemoryStore>,
        switch: Arc<RecordingSwitch>,
        calls: Arc<RecordingCallControl>,
        handler: HealthCheckHandler,
        config: EngineConfig,
    }

    async fn setup() -> Setup {
        let broker = MemoryBroker::new();
        let backoff = BackoffConfig {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let transport = Transport::new(broker.connector(), backoff);
        transport.connect().await.unwrap();
        let config = EngineConfig::default();
        declare_topology(&transport, &config, "delay").await.unwrap();

        let rpc = RpcClient::new(
            Publisher::new(Arc::clone(&transport), "delay"),
            "callcore",
            Duration::from_secs(1),
        );
        let scheduler = HealthScheduler::new(rpc, config.request_queue.as_str(), Duration::ZERO, 2);

        let store = Arc::new(MemoryStore::new());
        let switch = Arc::new(RecordingSwitch::new());
        let calls = Arc::new(RecordingCallControl::new());
        let ctx = EngineContext::new(
            store.clone(),
            switch.clone(),
            CallControlRouter::new("context", calls.clone()),
            Duration::from_millis(10),
        )
        .with_metrics(Metrics::register(&Registry::new()).unwrap());
        let handler = HealthCheckHandler::new(Arc::new(ctx), scheduler);

        store
            .channel_create(Channel {
                id: "c1".to_string(),
                peer_id: "pbx1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        Setup {
            transport,
            store,
            switch,
            calls,
            handler,
            config,
        }
    }

    /// Next scheduled request on the engine's request queue.
    async fn next_scheduled(s: &Setup) -> (Request, HealthCheckRequest) {
        let channel = s.transport.channel().await.unwrap();
        let mut stream = channel
            .consume(&s.config.request_queue, "probe", true)
            .await
            .unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let request: Request = serde_json::from_slice(&delivery.data).unwrap();
        let body = request.body().unwrap();
        (request, body)
    }

    #[test]
    fn test_uri_parsing() {
        assert_eq!(
            channel_id_from_uri(&health_check_uri("1588549537.157")),
            Some("1588549537.157")
        );
        assert_eq!(channel_id_from_uri("/v1/channels//health-check"), None);
        assert_eq!(channel_id_from_uri("/v1/calls/c1/health-check"), None);
        assert_eq!(channel_id_from_uri("/v1/channels/a/b/health-check"), None);
    }

    #[tokio::test]
    async fn test_healthy_channel_resets_retries() {
        let s = setup().await;
        s.switch
            .set_channel(AriChannel {
                id: "c1".to_string(),
                ..Default::default()
            })
            .await;

        let verdict = s.handler.check("c1", 1).await.unwrap();

        assert_eq!(verdict, HealthVerdict::Healthy);
        let (request, body) = next_scheduled(&s).await;
        assert_eq!(request.uri, "/v1/channels/c1/health-check");
        assert_eq!(request.method, Method::Post);
        assert_eq!(body.retry_count, 0);
    }

    #[tokio::test]
    async fn test_failure_increments_retry() {
        let s = setup().await;
        s.switch.set_error("c1", 500).await;

        let verdict = s.handler.check("c1", 0).await.unwrap();

        assert_eq!(verdict, HealthVerdict::Retrying(1));
        assert_eq!(next_scheduled(&s).await.1.retry_count, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_hang_up() {
        let s = setup().await;
        s.switch.set_error("c1", 500).await;

        let verdict = s.handler.check("c1", 2).await.unwrap();

        assert_eq!(verdict, HealthVerdict::HungUp);
        assert_eq!(
            s.switch.hangups().await,
            vec![("c1".to_string(), HangupCause::INTERWORKING)]
        );
        assert!(s.store.channel_get("c1").await.is_ok());
    }

    #[tokio::test]
    async fn test_out_of_range_retry_count_is_exhausted() {
        let s = setup().await;
        s.switch.set_error("c1", 500).await;
        let request = Request::json(
            Method::Post,
            health_check_uri("c1"),
            &HealthCheckRequest {
                retry_count: u32::MAX,
                delay_ms: 0,
            },
        )
        .unwrap();

        let response = s.handler.handle(request).await.unwrap().unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(
            s.switch.hangups().await,
            vec![("c1".to_string(), HangupCause::INTERWORKING)]
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_on_missing_switch_channel_finalizes() {
        let s = setup().await;
        s.switch.set_not_found("c1").await;

        let verdict = s.handler.check("c1", 2).await.unwrap();

        assert_eq!(verdict, HealthVerdict::Finalized);
        assert!(s.store.channel_get("c1").await.is_err());
        assert!(s.switch.hangups().await.is_empty());
        assert!(matches!(
            &s.calls.notifications().await[..],
            [Notification::Destroyed(c)] if c.hangup_cause == Some(HangupCause::INTERWORKING)
        ));
    }

    #[tokio::test]
    async fn test_gone_channel_stops() {
        let s = setup().await;
        s.store.channel_delete("c1").await.unwrap();

        assert_eq!(s.handler.check("c1", 0).await.unwrap(), HealthVerdict::Stopped);
        assert!(s.switch.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_unrouted_request_gets_404() {
        let s = setup().await;

        let response = s
            .handler
            .handle(Request::new(Method::Get, "/v1/channels/c1/health-check"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.status_code, 404);
    }
}
