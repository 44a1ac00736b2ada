//! Bridge membership: enter/leave, and bridge rows.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{EngineContext, EngineError, EventHandler, Result};
use crate::ari::event::{BridgeCreated, BridgeDestroyed, ChannelEnteredBridge, ChannelLeftBridge};
use crate::ari::{Event, Payload};
use crate::models::Bridge;
use crate::store::StoreError;

pub struct BridgeLifecycle {
    ctx: Arc<EngineContext>,
}

impl BridgeLifecycle {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    async fn entered(&self, event: &Event, e: &ChannelEnteredBridge) -> Result<()> {
        let peer_id = event.peer_id();
        let (channel_id, bridge_id) = (e.channel.id.as_str(), e.bridge.id.as_str());
        self.ctx.require_channel(peer_id, channel_id).await?;
        self.ctx
            .require_bridge(peer_id, bridge_id, channel_id)
            .await?;

        let (channel, bridge) = self
            .ctx
            .store
            .bridge_add_channel(bridge_id, channel_id)
            .await?;
        debug!(
            channel_id,
            bridge_id,
            members = bridge.channel_ids.len(),
            "Channel entered bridge"
        );

        self.ctx
            .call_control
            .for_channel(&channel)
            .on_channel_entered_bridge(&channel, &bridge)
            .await?;
        Ok(())
    }

    async fn left(&self, event: &Event, e: &ChannelLeftBridge) -> Result<()> {
        let peer_id = event.peer_id();
        let (channel_id, bridge_id) = (e.channel.id.as_str(), e.bridge.id.as_str());
        self.ctx.require_channel(peer_id, channel_id).await?;
        self.ctx
            .require_bridge(peer_id, bridge_id, channel_id)
            .await?;

        let (channel, bridge) = self
            .ctx
            .store
            .bridge_remove_channel(bridge_id, channel_id)
            .await?;
        debug!(
            channel_id,
            bridge_id,
            members = bridge.channel_ids.len(),
            "Channel left bridge"
        );

        self.ctx
            .call_control
            .for_channel(&channel)
            .on_channel_left_bridge(&channel, &bridge)
            .await?;
        Ok(())
    }

    async fn created(&self, event: &Event, e: &BridgeCreated) -> Result<()> {
        let mut bridge = Bridge::from_ari(event.peer_id(), &e.bridge);
        bridge.tm_update = Some(event.timestamp());
        if bridge.creation_time.is_none() {
            bridge.creation_time = Some(event.timestamp());
        }

        match self.ctx.store.bridge_create(bridge).await {
            Ok(()) => {
                info!(bridge_id = %e.bridge.id, technology = %e.bridge.technology, "Bridge created");
                Ok(())
            }
            Err(StoreError::BridgeExists(id)) => {
                debug!(bridge_id = %id, "Bridge already known");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn destroyed(&self, e: &BridgeDestroyed) -> Result<()> {
        match self.ctx.store.bridge_delete(&e.bridge.id).await {
            Ok(bridge) => {
                info!(
                    bridge_id = %bridge.id,
                    remaining = bridge.channel_ids.len(),
                    "Bridge destroyed"
                );
                Ok(())
            }
            Err(StoreError::BridgeNotFound(id)) => {
                debug!(bridge_id = %id, "Destroyed bridge was not known");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EventHandler for BridgeLifecycle {
    async fn handle(&self, event: &Event) -> Result<()> {
        match &event.payload {
            Payload::ChannelEnteredBridge(e) => self.entered(event, e).await,
            Payload::ChannelLeftBridge(e) => self.left(event, e).await,
            Payload::BridgeCreated(e) => self.created(event, e).await,
            Payload::BridgeDestroyed(e) => self.destroyed(e).await,
            _ => Err(EngineError::KindMismatch {
                handler: "bridge",
                actual: event.kind(),
            }),
        }
    }
}
