//! Shared fixtures for engine unit tests.

use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use serde_json::{json, Value};

use super::{dispatcher, DispatchResult, Dispatcher, EngineContext, Result};
use crate::ari::decode_event;
use crate::call_control::{CallControlRouter, RecordingCallControl};
use crate::metrics::Metrics;
use crate::store::MemoryStore;
use crate::switch::RecordingSwitch;

pub(crate) const PEER: &str = "42:01:0a:a4:00:03";

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub switch: Arc<RecordingSwitch>,
    pub calls: Arc<RecordingCallControl>,
    pub metrics: Metrics,
    pub ctx: Arc<EngineContext>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_router(|calls| CallControlRouter::new("context", calls))
    }

    /// Build with a custom router; the closure receives the recorder to use
    /// as fallback.
    pub fn with_router(
        router: impl FnOnce(Arc<RecordingCallControl>) -> CallControlRouter,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let switch = Arc::new(RecordingSwitch::new());
        let calls = Arc::new(RecordingCallControl::new());
        let metrics = Metrics::register(&Registry::new()).unwrap();

        let ctx = Arc::new(
            EngineContext::new(
                store.clone(),
                switch.clone(),
                router(calls.clone()),
                Duration::from_millis(30),
            )
            .with_metrics(metrics.clone()),
        );
        Self {
            store,
            switch,
            calls,
            metrics,
            dispatcher: dispatcher(Arc::clone(&ctx)),
            ctx,
        }
    }

    pub async fn send(&self, event: Value) -> Result<DispatchResult> {
        let event = decode_event(&event.to_string()).unwrap();
        self.dispatcher.dispatch(&event).await
    }
}

pub(crate) fn channel(id: &str) -> Value {
    json!({"id": id, "name": format!("PJSIP/in-voipbin-{}", id), "state": "Ring",
           "caller": {"name": "tttt", "number": "1001"},
           "dialplan": {"context": "in-voipbin", "exten": "3312", "priority": 1},
           "creationtime": "2020-04-19T14:38:00.363+0000"})
}

pub(crate) fn bridge(id: &str) -> Value {
    json!({"id": id, "technology": "simple_bridge", "bridge_type": "mixing",
           "creator": "Stasis", "name": "test", "channels": []})
}

fn event(kind: &str, body: Value) -> Value {
    let mut event = json!({
        "type": kind,
        "timestamp": "2020-04-19T14:38:01.000+0000",
        "asterisk_id": PEER,
        "application": "voipbin"
    });
    if let (Some(fields), Some(body)) = (event.as_object_mut(), body.as_object()) {
        fields.extend(body.clone());
    }
    event
}

pub(crate) fn channel_created(id: &str) -> Value {
    event("ChannelCreated", json!({"channel": channel(id)}))
}

pub(crate) fn state_change(id: &str, state: &str) -> Value {
    let mut ch = channel(id);
    ch["state"] = json!(state);
    event("ChannelStateChange", json!({"channel": ch}))
}

pub(crate) fn entered_bridge(channel_id: &str, bridge_id: &str) -> Value {
    event(
        "ChannelEnteredBridge",
        json!({"channel": channel(channel_id), "bridge": bridge(bridge_id)}),
    )
}

pub(crate) fn left_bridge(channel_id: &str, bridge_id: &str) -> Value {
    event(
        "ChannelLeftBridge",
        json!({"channel": channel(channel_id), "bridge": bridge(bridge_id)}),
    )
}

pub(crate) fn destroyed(id: &str, cause: u16) -> Value {
    event(
        "ChannelDestroyed",
        json!({"channel": channel(id), "cause": cause, "cause_txt": "Normal Clearing"}),
    )
}

pub(crate) fn bridge_created(id: &str) -> Value {
    event("BridgeCreated", json!({"bridge": bridge(id)}))
}

pub(crate) fn bridge_destroyed(id: &str) -> Value {
    event("BridgeDestroyed", json!({"bridge": bridge(id)}))
}

pub(crate) fn stasis_start(id: &str, args: &[&str]) -> Value {
    event("StasisStart", json!({"channel": channel(id), "args": args}))
}

pub(crate) fn stasis_end(id: &str) -> Value {
    event("StasisEnd", json!({"channel": channel(id)}))
}

pub(crate) fn varset(id: &str, variable: &str, value: &str) -> Value {
    event(
        "ChannelVarset",
        json!({"channel": channel(id), "variable": variable, "value": value}),
    )
}

pub(crate) fn dtmf(id: &str, digit: &str) -> Value {
    event(
        "ChannelDtmfReceived",
        json!({"channel": channel(id), "digit": digit, "duration_ms": 100}),
    )
}
