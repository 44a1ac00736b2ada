//! Switch event engine.
//!
//! Events arrive on the event queue, are decoded, and are dispatched by kind
//! to the lifecycle handlers. Handlers mutate the state store, notify the
//! owning call control, and send corrective commands to the switch. The
//! engine's request queue serves its own scheduled channel health checks.
//!
//! ## Defensive hangup
//!
//! When an event references a channel or bridge the store does not hold,
//! the channel is hung up with cause 127 (interworking) before the handler
//! returns its error. A channel whose local state is inconsistent must not
//! stay connected to live media.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ari::{EventKind, HangupCause};
use crate::bus::{
    AckMode, BackoffConfig, BusError, ExchangeKind, ExchangeSpec, QueueSpec, Subscriber, Transport,
};
use crate::call_control::{CallControlError, CallControlRouter};
use crate::metrics::Metrics;
use crate::rpc::{RpcError, RpcServer};
use crate::store::{StateStore, StoreError};
use crate::switch::{SwitchControl, SwitchError};

pub mod bridge;
pub mod channel;
pub mod consumer;
pub mod dispatch;
pub mod health;
pub mod stasis;

pub use consumer::EventConsumer;
pub use dispatch::{DispatchResult, Dispatcher, EventHandler};
pub use health::{HealthCheckHandler, HealthCheckRequest, HealthScheduler};

/// Result type for lifecycle handlers.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Switch command failed: {0}")]
    Switch(#[from] SwitchError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Call control failed: {0}")]
    CallControl(#[from] CallControlError),

    #[error("Channel {channel_id} is not known locally")]
    MissingChannel { channel_id: String },

    #[error("Bridge {bridge_id} is not known locally (channel {channel_id})")]
    MissingBridge {
        bridge_id: String,
        channel_id: String,
    },

    #[error("Handler for {handler} received a {actual} event")]
    KindMismatch {
        handler: &'static str,
        actual: EventKind,
    },
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Queue the switches publish events to.
    pub event_queue: String,
    /// Queue serving this engine's own requests (health checks).
    pub request_queue: String,
    pub consumer_tag: String,
    /// Bounded wait for a referenced row to appear.
    pub exist_timeout_ms: u64,
    /// Interval between health checks of one channel.
    pub health_check_delay_ms: u64,
    /// Consecutive failed checks tolerated before acting.
    pub health_check_max_retries: u32,
    /// Stasis argument selecting the channel's call-control owner.
    pub stasis_routing_key: String,
    /// Ack mode of the event consume loop.
    pub ack_mode: AckMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_queue: "callcore.events".to_string(),
            request_queue: "callcore.requests".to_string(),
            consumer_tag: "callcore".to_string(),
            exist_timeout_ms: 3000,
            health_check_delay_ms: 10_000,
            health_check_max_retries: 2,
            stasis_routing_key: "context".to_string(),
            ack_mode: AckMode::AfterHandling,
        }
    }
}

impl EngineConfig {
    pub fn exist_timeout(&self) -> Duration {
        Duration::from_millis(self.exist_timeout_ms)
    }

    pub fn health_check_delay(&self) -> Duration {
        Duration::from_millis(self.health_check_delay_ms)
    }
}

/// Collaborators shared by every lifecycle handler.
pub struct EngineContext {
    pub store: Arc<dyn StateStore>,
    pub switch: Arc<dyn SwitchControl>,
    pub call_control: CallControlRouter,
    /// Health checks are not scheduled when absent.
    pub health: Option<HealthScheduler>,
    pub metrics: Option<Metrics>,
    pub exist_timeout: Duration,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn StateStore>,
        switch: Arc<dyn SwitchControl>,
        call_control: CallControlRouter,
        exist_timeout: Duration,
    ) -> Self {
        Self {
            store,
            switch,
            call_control,
            health: None,
            metrics: None,
            exist_timeout,
        }
    }

    pub fn with_health(mut self, health: HealthScheduler) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Hang up `channel_id` because local state disagrees with the switch.
    /// A failed hangup is logged; the caller's error is what propagates.
    pub(crate) async fn defensive_hangup(&self, peer_id: &str, channel_id: &str, reason: &str) {
        warn!(peer_id, channel_id, reason, "Defensive hangup");
        if let Some(metrics) = &self.metrics {
            metrics
                .defensive_hangups_total
                .with_label_values(&[reason])
                .inc();
        }
        if let Err(e) = self
            .switch
            .channel_hangup(peer_id, channel_id, HangupCause::INTERWORKING)
            .await
        {
            error!(peer_id, channel_id, error = %e, "Defensive hangup failed");
        }
    }

    /// Wait for the channel row, hanging the channel up when it never
    /// appears.
    pub(crate) async fn require_channel(&self, peer_id: &str, channel_id: &str) -> Result<()> {
        if self.store.channel_exists(channel_id, self.exist_timeout).await {
            return Ok(());
        }
        self.defensive_hangup(peer_id, channel_id, "missing_channel")
            .await;
        Err(EngineError::MissingChannel {
            channel_id: channel_id.to_string(),
        })
    }

    /// Wait for the bridge row, hanging `channel_id` up when it never
    /// appears.
    pub(crate) async fn require_bridge(
        &self,
        peer_id: &str,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<()> {
        if self.store.bridge_exists(bridge_id, self.exist_timeout).await {
            return Ok(());
        }
        self.defensive_hangup(peer_id, channel_id, "missing_bridge")
            .await;
        Err(EngineError::MissingBridge {
            bridge_id: bridge_id.to_string(),
            channel_id: channel_id.to_string(),
        })
    }
}

/// Map a store miss on `channel_id` to `MissingChannel`.
pub(crate) fn missing_channel(channel_id: &str) -> impl FnOnce(StoreError) -> EngineError + '_ {
    move |e| match e {
        StoreError::ChannelNotFound(_) => EngineError::MissingChannel {
            channel_id: channel_id.to_string(),
        },
        other => EngineError::Store(other),
    }
}

/// The standard handler table: every kind the engine acts on.
pub fn dispatcher(ctx: Arc<EngineContext>) -> Dispatcher {
    let channels: Arc<dyn EventHandler> = Arc::new(channel::ChannelLifecycle::new(Arc::clone(&ctx)));
    let bridges: Arc<dyn EventHandler> = Arc::new(bridge::BridgeLifecycle::new(Arc::clone(&ctx)));
    let stasis: Arc<dyn EventHandler> = Arc::new(stasis::StasisLifecycle::new(ctx));

    Dispatcher::new()
        .register(EventKind::ChannelCreated, Arc::clone(&channels))
        .register(EventKind::ChannelStateChange, Arc::clone(&channels))
        .register(EventKind::ChannelDestroyed, Arc::clone(&channels))
        .register(EventKind::ChannelHangupRequest, Arc::clone(&channels))
        .register(EventKind::ChannelDtmfReceived, Arc::clone(&channels))
        .register(EventKind::ChannelVarset, channels)
        .register(EventKind::ChannelEnteredBridge, Arc::clone(&bridges))
        .register(EventKind::ChannelLeftBridge, Arc::clone(&bridges))
        .register(EventKind::BridgeCreated, Arc::clone(&bridges))
        .register(EventKind::BridgeDestroyed, bridges)
        .register(EventKind::StasisStart, Arc::clone(&stasis))
        .register(EventKind::StasisEnd, stasis)
}

/// Declare the engine's queues and the delay exchange. The request queue is
/// bound to the delay exchange under its own name so scheduled requests
/// reach it.
pub async fn declare_topology(
    transport: &Transport,
    config: &EngineConfig,
    delay_exchange: &str,
) -> std::result::Result<(), BusError> {
    transport
        .declare_exchange(ExchangeSpec::durable(delay_exchange, ExchangeKind::Delayed))
        .await?;
    transport
        .declare_queue(QueueSpec::durable(config.event_queue.as_str()))
        .await?;
    transport
        .declare_queue(QueueSpec::durable(config.request_queue.as_str()))
        .await?;
    transport
        .bind_queue(&config.request_queue, delay_exchange, &config.request_queue)
        .await?;
    Ok(())
}

/// Running engine: the event consume loop and the request server.
pub struct Engine {
    ctx: Arc<EngineContext>,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(ctx: EngineContext, config: EngineConfig) -> Self {
        let ctx = Arc::new(ctx);
        let dispatcher = Arc::new(dispatcher(Arc::clone(&ctx)));
        Self {
            ctx,
            dispatcher,
            config,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Spawn both loops. They stop when `shutdown` is cancelled or the
    /// transport closes.
    pub fn spawn(
        &self,
        transport: &Arc<Transport>,
        prefetch: u16,
        retry: BackoffConfig,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut consumer = EventConsumer::new(Arc::clone(&self.dispatcher));
        if let Some(metrics) = &self.ctx.metrics {
            consumer = consumer.with_metrics(metrics.clone());
        }

        let events = Subscriber::new(Arc::clone(transport), self.config.event_queue.as_str())
            .with_consumer_tag(format!("{}-events", self.config.consumer_tag))
            .with_ack_mode(self.config.ack_mode)
            .with_prefetch(prefetch)
            .with_retry(retry)
            .spawn(Arc::new(consumer), shutdown.clone());

        let mut handles = vec![events];
        match &self.ctx.health {
            Some(scheduler) => {
                let handler = HealthCheckHandler::new(Arc::clone(&self.ctx), scheduler.clone());
                let requests =
                    RpcServer::new(Arc::clone(transport), self.config.request_queue.as_str())
                        .with_consumer_tag(format!("{}-requests", self.config.consumer_tag))
                        .with_prefetch(prefetch)
                        .with_retry(retry)
                        .spawn(Arc::new(handler), shutdown);
                handles.push(requests);
            }
            None => warn!("Health checks disabled, request queue not served"),
        }

        info!(
            event_queue = %self.config.event_queue,
            request_queue = %self.config.request_queue,
            "Engine started"
        );
        handles
    }
}

#[cfg(test)]
pub(crate) mod testing;
