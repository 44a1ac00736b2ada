//! Authoritative local mirror of switch channels and bridges.
//!
//! Rows are created only from confirmed switch events. Membership is kept
//! bidirectional: `channel.bridge_id == Some(b)` exactly when
//! `bridge(b).channel_ids` contains the channel. Every operation that touches
//! both sides runs under one lock.

use std::time::Duration;

use async_trait::async_trait;

use crate::models::{Bridge, Channel};

pub mod memory;

pub use memory::MemoryStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Bridge not found: {0}")]
    BridgeNotFound(String),

    #[error("Channel already exists: {0}")]
    ChannelExists(String),

    #[error("Bridge already exists: {0}")]
    BridgeExists(String),
}

/// In-place channel mutation. `id` and `bridge_id` are restored afterwards;
/// membership changes go through the bridge operations.
pub type ChannelUpdate = Box<dyn FnOnce(&mut Channel) + Send>;

/// In-place bridge mutation. `id` and `channel_ids` are restored afterwards.
pub type BridgeUpdate = Box<dyn FnOnce(&mut Bridge) + Send>;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn channel_create(&self, channel: Channel) -> Result<()>;

    async fn channel_get(&self, id: &str) -> Result<Channel>;

    /// Wait up to `timeout` for the channel row to appear.
    async fn channel_exists(&self, id: &str, timeout: Duration) -> bool;

    async fn channel_update(&self, id: &str, update: ChannelUpdate) -> Result<Channel>;

    /// Remove the row, dropping it from its bridge. Returns the final row.
    async fn channel_delete(&self, id: &str) -> Result<Channel>;

    async fn bridge_create(&self, bridge: Bridge) -> Result<()>;

    async fn bridge_get(&self, id: &str) -> Result<Bridge>;

    /// Wait up to `timeout` for the bridge row to appear.
    async fn bridge_exists(&self, id: &str, timeout: Duration) -> bool;

    async fn bridge_update(&self, id: &str, update: BridgeUpdate) -> Result<Bridge>;

    /// Remove the row, clearing `bridge_id` on remaining members. Returns the
    /// final row.
    async fn bridge_delete(&self, id: &str) -> Result<Bridge>;

    /// Point the channel at `bridge_id` (or at no bridge), updating
    /// membership on both sides.
    async fn set_channel_bridge(&self, channel_id: &str, bridge_id: Option<&str>) -> Result<()>;

    /// Add the channel to the bridge, leaving any previous bridge first.
    async fn bridge_add_channel(&self, bridge_id: &str, channel_id: &str)
        -> Result<(Channel, Bridge)>;

    /// Remove the channel from the bridge.
    async fn bridge_remove_channel(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(Channel, Bridge)>;

    /// Consistent copy of every row.
    async fn snapshot(&self) -> (Vec<Channel>, Vec<Bridge>);
}
