//! In-process state store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use super::{BridgeUpdate, ChannelUpdate, Result, StateStore, StoreError};
use crate::models::{Bridge, Channel};

#[derive(Default)]
struct Tables {
    channels: HashMap<String, Channel>,
    bridges: HashMap<String, Bridge>,
}

impl Tables {
    /// Drop `channel_id` from whichever bridge it currently belongs to.
    fn detach(&mut self, channel_id: &str) {
        let current = self
            .channels
            .get(channel_id)
            .and_then(|c| c.bridge_id.clone());
        if let Some(bridge_id) = current {
            if let Some(bridge) = self.bridges.get_mut(&bridge_id) {
                bridge.channel_ids.remove(channel_id);
            }
        }
        if let Some(channel) = self.channels.get_mut(channel_id) {
            channel.bridge_id = None;
        }
    }

    fn attach(&mut self, bridge_id: &str, channel_id: &str) -> Result<(Channel, Bridge)> {
        if !self.bridges.contains_key(bridge_id) {
            return Err(StoreError::BridgeNotFound(bridge_id.to_string()));
        }
        if !self.channels.contains_key(channel_id) {
            return Err(StoreError::ChannelNotFound(channel_id.to_string()));
        }

        self.detach(channel_id);

        let bridge = self
            .bridges
            .get_mut(bridge_id)
            .ok_or_else(|| StoreError::BridgeNotFound(bridge_id.to_string()))?;
        bridge.channel_ids.insert(channel_id.to_string());
        let bridge = bridge.clone();

        let channel = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| StoreError::ChannelNotFound(channel_id.to_string()))?;
        channel.bridge_id = Some(bridge_id.to_string());

        Ok((channel.clone(), bridge))
    }
}

/// State store backed by one lock over both tables.
///
/// Writers are serialized, so compound membership changes are atomic with
/// respect to each other and to readers.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    created: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn wait_for(&self, timeout: Duration, present: impl Fn(&Tables) -> bool + Send) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.created.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if present(&*self.tables.read().await) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn channel_create(&self, channel: Channel) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.channels.contains_key(&channel.id) {
            return Err(StoreError::ChannelExists(channel.id));
        }
        let mut channel = channel;
        channel.bridge_id = None;
        tables.channels.insert(channel.id.clone(), channel);
        drop(tables);
        self.created.notify_waiters();
        Ok(())
    }

    async fn channel_get(&self, id: &str) -> Result<Channel> {
        self.tables
            .read()
            .await
            .channels
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ChannelNotFound(id.to_string()))
    }

    async fn channel_exists(&self, id: &str, timeout: Duration) -> bool {
        self.wait_for(timeout, |t| t.channels.contains_key(id)).await
    }

    async fn channel_update(&self, id: &str, update: ChannelUpdate) -> Result<Channel> {
        let mut tables = self.tables.write().await;
        let channel = tables
            .channels
            .get_mut(id)
            .ok_or_else(|| StoreError::ChannelNotFound(id.to_string()))?;

        let bridge_id = channel.bridge_id.clone();
        update(&mut *channel);
        channel.id = id.to_string();
        channel.bridge_id = bridge_id;

        Ok(channel.clone())
    }

    async fn channel_delete(&self, id: &str) -> Result<Channel> {
        let mut tables = self.tables.write().await;
        if !tables.channels.contains_key(id) {
            return Err(StoreError::ChannelNotFound(id.to_string()));
        }
        tables.detach(id);
        tables
            .channels
            .remove(id)
            .ok_or_else(|| StoreError::ChannelNotFound(id.to_string()))
    }

    async fn bridge_create(&self, bridge: Bridge) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.bridges.contains_key(&bridge.id) {
            return Err(StoreError::BridgeExists(bridge.id));
        }
        let mut bridge = bridge;
        bridge.channel_ids.clear();
        tables.bridges.insert(bridge.id.clone(), bridge);
        drop(tables);
        self.created.notify_waiters();
        Ok(())
    }

    async fn bridge_get(&self, id: &str) -> Result<Bridge> {
        self.tables
            .read()
            .await
            .bridges
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::BridgeNotFound(id.to_string()))
    }

    async fn bridge_exists(&self, id: &str, timeout: Duration) -> bool {
        self.wait_for(timeout, |t| t.bridges.contains_key(id)).await
    }

    async fn bridge_update(&self, id: &str, update: BridgeUpdate) -> Result<Bridge> {
        let mut tables = self.tables.write().await;
        let bridge = tables
            .bridges
            .get_mut(id)
            .ok_or_else(|| StoreError::BridgeNotFound(id.to_string()))?;

        let members = std::mem::take(&mut bridge.channel_ids);
        update(&mut *bridge);
        bridge.id = id.to_string();
        bridge.channel_ids = members;

        Ok(bridge.clone())
    }

    async fn bridge_delete(&self, id: &str) -> Result<Bridge> {
        let mut tables = self.tables.write().await;
        let bridge = tables
            .bridges
            .remove(id)
            .ok_or_else(|| StoreError::BridgeNotFound(id.to_string()))?;

        for channel_id in &bridge.channel_ids {
            if let Some(channel) = tables.channels.get_mut(channel_id) {
                if channel.bridge_id.as_deref() == Some(id) {
                    channel.bridge_id = None;
                }
            }
        }
        Ok(bridge)
    }

    async fn set_channel_bridge(&self, channel_id: &str, bridge_id: Option<&str>) -> Result<()> {
        let mut tables = self.tables.write().await;
        match bridge_id {
            Some(bridge_id) => tables.attach(bridge_id, channel_id).map(|_| ()),
            None => {
                if !tables.channels.contains_key(channel_id) {
                    return Err(StoreError::ChannelNotFound(channel_id.to_string()));
                }
                tables.detach(channel_id);
                Ok(())
            }
        }
    }

    async fn bridge_add_channel(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(Channel, Bridge)> {
        self.tables.write().await.attach(bridge_id, channel_id)
    }

    async fn bridge_remove_channel(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(Channel, Bridge)> {
        let mut tables = self.tables.write().await;
        if !tables.channels.contains_key(channel_id) {
            return Err(StoreError::ChannelNotFound(channel_id.to_string()));
        }

        let bridge = tables
            .bridges
            .get_mut(bridge_id)
            .ok_or_else(|| StoreError::BridgeNotFound(bridge_id.to_string()))?;
        bridge.channel_ids.remove(channel_id);
        let bridge = bridge.clone();

        let channel = tables
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| StoreError::ChannelNotFound(channel_id.to_string()))?;
        if channel.bridge_id.as_deref() == Some(bridge_id) {
            channel.bridge_id = None;
        }

        Ok((channel.clone(), bridge))
    }

    async fn snapshot(&self) -> (Vec<Channel>, Vec<Bridge>) {
        let tables = self.tables.read().await;
        let mut channels: Vec<Channel> = tables.channels.values().cloned().collect();
        let mut bridges: Vec<Bridge> = tables.bridges.values().cloned().collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        bridges.sort_by(|a, b| a.id.cmp(&b.id));
        (channels, bridges)
    }
}
