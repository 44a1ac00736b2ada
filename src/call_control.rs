//! Call-control notifications.
//!
//! The engine tells the component owning a channel about lifecycle changes,
//! always with the entity snapshots taken right after the store mutation.
//! Owners are chosen at stasis start from one of the stasis arguments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::{Bridge, Channel};

/// Failure reported by a call-control component.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CallControlError(pub String);

pub type Result<T> = std::result::Result<T, CallControlError>;

/// Receives channel lifecycle notifications. Every method defaults to a
/// no-op.
#[async_trait]
pub trait CallControl: Send + Sync {
    async fn on_stasis_start(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    async fn on_channel_destroyed(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    async fn on_channel_entered_bridge(&self, _channel: &Channel, _bridge: &Bridge) -> Result<()> {
        Ok(())
    }

    async fn on_channel_left_bridge(&self, _channel: &Channel, _bridge: &Bridge) -> Result<()> {
        Ok(())
    }

    async fn on_channel_state_changed(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    async fn on_channel_dtmf_received(
        &self,
        _channel: &Channel,
        _digit: &str,
        _duration_ms: u32,
    ) -> Result<()> {
        Ok(())
    }
}

/// Logs every notification. Channels without an owner land here and stay
/// idle under application control.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallControl;

#[async_trait]
impl CallControl for LoggingCallControl {
    async fn on_stasis_start(&self, channel: &Channel) -> Result<()> {
        info!(
            channel_id = %channel.id,
            context = channel.stasis_args.get("context").map(String::as_str).unwrap_or(""),
            "Channel has no owner, leaving it idle"
        );
        Ok(())
    }

    async fn on_channel_destroyed(&self, channel: &Channel) -> Result<()> {
        info!(
            channel_id = %channel.id,
            cause = channel.hangup_cause.map(|c| c.0).unwrap_or_default(),
            "Channel destroyed"
        );
        Ok(())
    }

    async fn on_channel_entered_bridge(&self, channel: &Channel, bridge: &Bridge) -> Result<()> {
        debug!(channel_id = %channel.id, bridge_id = %bridge.id, "Channel entered bridge");
        Ok(())
    }

    async fn on_channel_left_bridge(&self, channel: &Channel, bridge: &Bridge) -> Result<()> {
        debug!(channel_id = %channel.id, bridge_id = %bridge.id, "Channel left bridge");
        Ok(())
    }

    async fn on_channel_state_changed(&self, channel: &Channel) -> Result<()> {
        debug!(channel_id = %channel.id, state = ?channel.state, "Channel state changed");
        Ok(())
    }

    async fn on_channel_dtmf_received(
        &self,
        channel: &Channel,
        digit: &str,
        duration_ms: u32,
    ) -> Result<()> {
        debug!(channel_id = %channel.id, digit, duration_ms, "DTMF received");
        Ok(())
    }
}

/// Maps channels to the call control that owns them.
#[derive(Clone)]
pub struct CallControlRouter {
    routing_key: String,
    owners: HashMap<String, Arc<dyn CallControl>>,
    fallback: Arc<dyn CallControl>,
}

impl CallControlRouter {
    /// Route on the stasis argument named `routing_key` (lower-case).
    pub fn new(routing_key: impl Into<String>, fallback: Arc<dyn CallControl>) -> Self {
        Self {
            routing_key: routing_key.into().to_lowercase(),
            owners: HashMap::new(),
            fallback,
        }
    }

    /// Register `owner` for channels whose routing argument equals `name`.
    pub fn with_owner(mut self, name: impl Into<String>, owner: Arc<dyn CallControl>) -> Self {
        self.owners.insert(name.into(), owner);
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Owner name for a channel with these stasis arguments, if registered.
    pub fn select_owner(&self, args: &BTreeMap<String, String>) -> Option<String> {
        args.get(&self.routing_key)
            .filter(|value| self.owners.contains_key(value.as_str()))
            .cloned()
    }

    /// Call control for `channel`, falling back when it has no known owner.
    pub fn for_channel(&self, channel: &Channel) -> &Arc<dyn CallControl> {
        channel
            .owner
            .as_deref()
            .and_then(|name| self.owners.get(name))
            .unwrap_or(&self.fallback)
    }
}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    StasisStart(Channel),
    Destroyed(Channel),
    EnteredBridge(Channel, Bridge),
    LeftBridge(Channel, Bridge),
    StateChanged(Channel),
    Dtmf(Channel, String),
}

/// Call control recording every notification.
#[derive(Default)]
pub struct RecordingCallControl {
    seen: RwLock<Vec<Notification>>,
}

impl RecordingCallControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.seen.read().await.clone()
    }

    async fn record(&self, notification: Notification) -> Result<()> {
        self.seen.write().await.push(notification);
        Ok(())
    }
}

#[async_trait]
impl CallControl for RecordingCallControl {
    async fn on_stasis_start(&self, channel: &Channel) -> Result<()> {
        self.record(Notification::StasisStart(channel.clone())).await
    }

    async fn on_channel_destroyed(&self, channel: &Channel) -> Result<()> {
        self.record(Notification::Destroyed(channel.clone())).await
    }

    async fn on_channel_entered_bridge(&self, channel: &Channel, bridge: &Bridge) -> Result<()> {
        self.record(Notification::EnteredBridge(channel.clone(), bridge.clone()))
            .await
    }

    async fn on_channel_left_bridge(&self, channel: &Channel, bridge: &Bridge) -> Result<()> {
        self.record(Notification::LeftBridge(channel.clone(), bridge.clone()))
            .await
    }

    async fn on_channel_state_changed(&self, channel: &Channel) -> Result<()> {
        self.record(Notification::StateChanged(channel.clone())).await
    }

    async fn on_channel_dtmf_received(
        &self,
        channel: &Channel,
        digit: &str,
        _duration_ms: u32,
    ) -> Result<()> {
        self.record(Notification::Dtmf(channel.clone(), digit.to_string()))
            .await
    }
}
