//! Commands sent to a switch instance over RPC.
//!
//! Each switch consumes its own request queue (`<prefix>-<peer_id>`) and
//! executes the command against its local ARI. Only commands the engine
//! issues itself live here.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::ari::{AriChannel, HangupCause};
use crate::rpc::{peer_target, Method, Request, Response, RpcClient, RpcError};

pub mod mock;

pub use mock::{RecordingSwitch, SwitchCommand};

/// Result type for switch commands.
pub type Result<T> = std::result::Result<T, SwitchError>;

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("RPC failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Switch answered with status {status_code}")]
    Status { status_code: u16 },

    #[error("Channel not found on switch: {0}")]
    NotFound(String),

    #[error("Malformed switch reply: {0}")]
    Decode(#[source] serde_json::Error),
}

impl SwitchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SwitchError::NotFound(_))
    }
}

/// Switch-control seam used by the lifecycle handlers.
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Hang up `channel_id` on switch `peer_id` with `cause`.
    async fn channel_hangup(&self, peer_id: &str, channel_id: &str, cause: HangupCause)
        -> Result<()>;

    /// Fetch the switch's current view of `channel_id`.
    async fn channel_get(&self, peer_id: &str, channel_id: &str) -> Result<AriChannel>;
}

/// `SwitchControl` over the RPC client.
#[derive(Clone)]
pub struct SwitchClient {
    rpc: RpcClient,
    target_prefix: String,
    timeout: Duration,
}

impl SwitchClient {
    pub fn new(rpc: RpcClient, target_prefix: impl Into<String>) -> Self {
        let timeout = rpc.default_timeout();
        Self {
            rpc,
            target_prefix: target_prefix.into(),
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, peer_id: &str, channel_id: &str, request: Request) -> Result<Response> {
        let target = peer_target(&self.target_prefix, peer_id);
        let response = self.rpc.call(&target, request, self.timeout).await?;
        match response.status_code {
            404 => Err(SwitchError::NotFound(channel_id.to_string())),
            code if code > 299 => Err(SwitchError::Status { status_code: code }),
            _ => Ok(response),
        }
    }
}

fn channel_uri(channel_id: &str) -> String {
    format!("/ari/channels/{}", channel_id)
}

#[async_trait]
impl SwitchControl for SwitchClient {
    async fn channel_hangup(
        &self,
        peer_id: &str,
        channel_id: &str,
        cause: HangupCause,
    ) -> Result<()> {
        let body = json!({ "reason_code": cause.0.to_string() });
        let request = Request::json(Method::Delete, channel_uri(channel_id), &body)?;
        self.request(peer_id, channel_id, request).await?;
        debug!(peer_id, channel_id, cause = cause.0, "Hangup sent");
        Ok(())
    }

    async fn channel_get(&self, peer_id: &str, channel_id: &str) -> Result<AriChannel> {
        let request = Request::new(Method::Get, channel_uri(channel_id));
        let response = self.request(peer_id, channel_id, request).await?;
        decode_channel(response.data)
    }
}

/// The reply body is the ARI channel JSON, inline or as a JSON string.
fn decode_channel(data: Value) -> Result<AriChannel> {
    match data {
        Value::String(raw) => serde_json::from_str(&raw).map_err(SwitchError::Decode),
        other => serde_json::from_value(other).map_err(SwitchError::Decode),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::bus::{BackoffConfig, MemoryBroker, Publisher, QueueSpec, Transport};
    use crate::rpc::{RequestHandler, RpcServer};

    /// Stands in for the switch-side RPC server of peer `pbx1`.
    struct FakeSwitch {
        seen: Mutex<Vec<Request>>,
        status: u16,
    }

    #[async_trait]
    impl RequestHandler for FakeSwitch {
        async fn handle(&self, request: Request) -> crate::rpc::Result<Option<Response>> {
            self.seen.lock().await.push(request.clone());
            if self.status != 200 {
                return Ok(Some(Response::status(self.status)));
            }
            let body = json!({"id": "c1", "name": "PJSIP/x-1", "state": "Up"});
            Ok(Some(Response::json(200, &body.to_string())?))
        }
    }

    async fn setup(status: u16) -> (SwitchClient, Arc<FakeSwitch>, CancellationToken) {
        let broker = MemoryBroker::new();
        let backoff = BackoffConfig {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let transport = Transport::new(broker.connector(), backoff.clone());
        transport.connect().await.unwrap();
        transport
            .declare_queue(QueueSpec::durable("asterisk-request-pbx1"))
            .await
            .unwrap();

        let fake = Arc::new(FakeSwitch {
            seen: Mutex::new(Vec::new()),
            status,
        });
        let shutdown = CancellationToken::new();
        RpcServer::new(Arc::clone(&transport), "asterisk-request-pbx1")
            .with_retry(backoff)
            .spawn(fake.clone(), shutdown.clone());

        let rpc = RpcClient::new(
            Publisher::new(transport, "delay"),
            "callcore",
            Duration::from_secs(1),
        );
        (SwitchClient::new(rpc, "asterisk-request"), fake, shutdown)
    }

    #[tokio::test]
    async fn test_hangup_request_shape() {
        let (client, fake, shutdown) = setup(200).await;

        client
            .channel_hangup("pbx1", "c1", HangupCause::INTERWORKING)
            .await
            .unwrap();

        let seen = fake.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::Delete);
        assert_eq!(seen[0].uri, "/ari/channels/c1");
        assert_eq!(seen[0].publisher, "callcore");
        assert_eq!(seen[0].data, json!({"reason_code": "127"}));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_get_decodes_string_body() {
        let (client, _fake, shutdown) = setup(200).await;

        let channel = client.channel_get("pbx1", "c1").await.unwrap();

        assert_eq!(channel.id, "c1");
        assert_eq!(channel.name, "PJSIP/x-1");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_not_found_status() {
        let (client, _fake, shutdown) = setup(404).await;

        let err = client.channel_get("pbx1", "c1").await.unwrap_err();

        assert!(err.is_not_found());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_error_status() {
        let (client, _fake, shutdown) = setup(500).await;

        let err = client
            .channel_hangup("pbx1", "c1", HangupCause::NORMAL_CLEARING)
            .await
            .unwrap_err();

        assert!(matches!(err, SwitchError::Status { status_code: 500 }));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_peer_times_out() {
        let (client, _fake, shutdown) = setup(200).await;
        let client = client.with_timeout(Duration::from_millis(50));

        let err = client.channel_get("pbx9", "c1").await.unwrap_err();

        assert!(matches!(err, SwitchError::Rpc(RpcError::Timeout { .. })));
        shutdown.cancel();
    }

    #[test]
    fn test_decode_inline_body() {
        let channel = decode_channel(json!({"id": "c2", "state": "Ring"})).unwrap();
        assert_eq!(channel.id, "c2");
    }
}
