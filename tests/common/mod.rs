//! Shared utilities for integration tests.
//!
//! Builds the full engine over the in-memory broker with a fake switch
//! serving `asterisk-request-pbx1`, plus builders for switch event JSON.

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use callcore::ari::decode::encode;
use callcore::bus::envelope::CONTENT_TYPE_JSON;
use callcore::bus::{
    BackoffConfig, MemoryBroker, OutboundMessage, Publisher, QueueSpec, Transport,
};
use callcore::call_control::{CallControl, CallControlRouter, RecordingCallControl};
use callcore::engine::{declare_topology, Engine, EngineConfig, EngineContext, HealthScheduler};
use callcore::rpc::{self, Method, Request, RequestHandler, Response, RpcClient, RpcServer};
use callcore::store::{MemoryStore, StateStore};
use callcore::switch::SwitchClient;

pub const PEER: &str = "pbx1";
pub const SWITCH_QUEUE: &str = "asterisk-request-pbx1";
pub const DELAY_EXCHANGE: &str = "callcore.delay";

pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
    }
}

/// Switch-side RPC server: hangups succeed, gets answer for live channels
/// and 404 otherwise.
#[derive(Default)]
pub struct FakeSwitch {
    requests: Mutex<Vec<Request>>,
    live: Mutex<HashSet<String>>,
}

impl FakeSwitch {
    pub async fn set_live(&self, channel_id: &str) {
        self.live.lock().await.insert(channel_id.to_string());
    }

    pub async fn requests(&self) -> Vec<Request> {
        self.requests.lock().await.clone()
    }

    pub async fn hangups(&self) -> Vec<Request> {
        self.requests()
            .await
            .into_iter()
            .filter(|r| r.method == Method::Delete)
            .collect()
    }
}

#[async_trait]
impl RequestHandler for FakeSwitch {
    async fn handle(&self, request: Request) -> rpc::Result<Option<Response>> {
        self.requests.lock().await.push(request.clone());
        let id = request
            .uri
            .strip_prefix("/ari/channels/")
            .unwrap_or_default()
            .to_string();
        let live = self.live.lock().await.contains(&id);
        match request.method {
            Method::Delete => Ok(Some(Response::status(200))),
            Method::Get if live => {
                Ok(Some(Response::json(200, &json!({"id": id, "state": "Up"}))?))
            }
            _ => Ok(Some(Response::status(404))),
        }
    }
}

/// A running engine over the in-memory broker.
pub struct Stack {
    pub broker: MemoryBroker,
    pub transport: Arc<Transport>,
    pub publisher: Publisher,
    pub store: Arc<MemoryStore>,
    pub calls: Arc<RecordingCallControl>,
    pub switch: Arc<FakeSwitch>,
    pub config: EngineConfig,
    pub shutdown: CancellationToken,
    probes: AtomicUsize,
}

impl Stack {
    pub async fn start(config: EngineConfig) -> Self {
        Self::start_with_owners(config, Vec::new()).await
    }

    pub async fn start_with_owners(
        config: EngineConfig,
        owners: Vec<(&str, Arc<dyn CallControl>)>,
    ) -> Self {
        let broker = MemoryBroker::new();
        let transport = Transport::new(broker.connector(), fast_backoff());
        transport.connect().await.unwrap();
        declare_topology(&transport, &config, DELAY_EXCHANGE)
            .await
            .unwrap();
        transport
            .declare_queue(QueueSpec::durable(SWITCH_QUEUE))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let switch = Arc::new(FakeSwitch::default());
        RpcServer::new(Arc::clone(&transport), SWITCH_QUEUE)
            .with_retry(fast_backoff())
            .spawn(switch.clone(), shutdown.clone());

        let publisher = Publisher::new(Arc::clone(&transport), DELAY_EXCHANGE);
        let rpc = RpcClient::new(publisher.clone(), "callcore", Duration::from_millis(500));
        let health = HealthScheduler::new(
            rpc.clone(),
            config.request_queue.as_str(),
            config.health_check_delay(),
            config.health_check_max_retries,
        );

        let calls = Arc::new(RecordingCallControl::new());
        let mut router = CallControlRouter::new(config.stasis_routing_key.as_str(), calls.clone());
        for (name, owner) in owners {
            router = router.with_owner(name, owner);
        }

        let store = Arc::new(MemoryStore::new());
        let ctx = EngineContext::new(
            store.clone(),
            Arc::new(SwitchClient::new(rpc, "asterisk-request")),
            router,
            config.exist_timeout(),
        )
        .with_health(health);
        Engine::new(ctx, config.clone()).spawn(&transport, 10, fast_backoff(), shutdown.clone());

        Self {
            broker,
            transport,
            publisher,
            store,
            calls,
            switch,
            config,
            shutdown,
            probes: AtomicUsize::new(0),
        }
    }

    /// Publish a switch event to the event queue.
    pub async fn emit(&self, event: Value) {
        let message =
            OutboundMessage::new(encode(&event).unwrap()).with_content_type(CONTENT_TYPE_JSON);
        self.publisher
            .publish(&self.config.event_queue, message)
            .await
            .unwrap();
    }

    /// Wait until every event emitted so far has been handled.
    ///
    /// Events are handled in queue order, so once a probe bridge has come
    /// and gone everything before it is done.
    pub async fn settle(&self) {
        let probe = format!("settle-probe-{}", self.probes.fetch_add(1, Ordering::SeqCst));

        self.emit(bridge_created(&probe)).await;
        self.wait_bridge(&probe, true).await;
        self.emit(bridge_destroyed(&probe)).await;
        self.wait_bridge(&probe, false).await;
    }

    async fn wait_bridge(&self, id: &str, present: bool) {
        eventually(|| {
            let store = Arc::clone(&self.store);
            let id = id.to_string();
            async move { store.bridge_exists(&id, Duration::ZERO).await == present }
        })
        .await;
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Poll `check` until it holds, failing after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Engine config with fast timeouts and no health checks firing during a
/// test.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        exist_timeout_ms: 50,
        health_check_delay_ms: 60_000,
        ..Default::default()
    }
}

// ============================================================================
// Event builders
// ============================================================================

pub fn channel(id: &str) -> Value {
    json!({"id": id, "name": format!("PJSIP/in-voipbin-{}", id), "state": "Ring",
           "caller": {"name": "tttt", "number": "pchero"},
           "dialplan": {"context": "in-voipbin", "exten": "3312", "priority": 2,
                        "app_name": "Stasis", "app_data": "voipbin"},
           "creationtime": "2020-05-03T23:45:37.083+0000", "language": "en"})
}

pub fn bridge(id: &str) -> Value {
    json!({"id": id, "technology": "simple_bridge", "bridge_type": "mixing",
           "bridge_class": "stasis", "creator": "Stasis", "name": "test",
           "channels": [], "creationtime": "2020-05-03T23:37:49.233+0000",
           "video_mode": "talker"})
}

pub fn event(kind: &str, body: Value) -> Value {
    let mut event = json!({
        "type": kind,
        "timestamp": "2020-05-03T23:46:27.547+0000",
        "asterisk_id": PEER,
        "application": "voipbin"
    });
    if let (Some(fields), Some(body)) = (event.as_object_mut(), body.as_object()) {
        fields.extend(body.clone());
    }
    event
}

pub fn channel_created(id: &str) -> Value {
    event("ChannelCreated", json!({"channel": channel(id)}))
}

pub fn bridge_created(id: &str) -> Value {
    event("BridgeCreated", json!({"bridge": bridge(id)}))
}

pub fn entered_bridge(channel_id: &str, bridge_id: &str) -> Value {
    event(
        "ChannelEnteredBridge",
        json!({"channel": channel(channel_id), "bridge": bridge(bridge_id)}),
    )
}

pub fn left_bridge(channel_id: &str, bridge_id: &str) -> Value {
    event(
        "ChannelLeftBridge",
        json!({"channel": channel(channel_id), "bridge": bridge(bridge_id)}),
    )
}

pub fn destroyed(id: &str, cause: u16) -> Value {
    event(
        "ChannelDestroyed",
        json!({"channel": channel(id), "cause": cause, "cause_txt": "Normal Clearing"}),
    )
}

pub fn stasis_start(id: &str, args: &[&str]) -> Value {
    event("StasisStart", json!({"channel": channel(id), "args": args}))
}

pub fn bridge_destroyed(id: &str) -> Value {
    event("BridgeDestroyed", json!({"bridge": bridge(id)}))
}
