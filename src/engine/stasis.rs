//! Entry into and exit from application control.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{missing_channel, EngineContext, EngineError, EventHandler, Result};
use crate::ari::event::{StasisEnd, StasisStart};
use crate::ari::{Event, Payload};

pub struct StasisLifecycle {
    ctx: Arc<EngineContext>,
}

impl StasisLifecycle {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    async fn started(&self, event: &Event, e: &StasisStart) -> Result<()> {
        let peer_id = event.peer_id();
        let channel_id = e.channel.id.as_str();
        self.ctx.require_channel(peer_id, channel_id).await?;

        let args: BTreeMap<String, String> = e.parsed_args().into_iter().collect();
        let owner = self.ctx.call_control.select_owner(&args);
        if owner.is_none() {
            info!(
                channel_id,
                routing_key = %self.ctx.call_control.routing_key(),
                "No call control registered for channel"
            );
        }

        let application = event.header.application.clone();
        let ari = e.channel.clone();
        let at = event.timestamp();
        let channel = self
            .ctx
            .store
            .channel_update(
                channel_id,
                Box::new(move |channel| {
                    channel.refresh(&ari);
                    channel.stasis_application = application;
                    channel.stasis_args = args;
                    channel.owner = owner;
                    channel.tm_update = Some(at);
                }),
            )
            .await
            .map_err(missing_channel(channel_id))?;
        debug!(
            channel_id,
            application = %channel.stasis_application,
            owner = channel.owner.as_deref().unwrap_or(""),
            "Channel entered application"
        );

        self.ctx
            .call_control
            .for_channel(&channel)
            .on_stasis_start(&channel)
            .await?;
        Ok(())
    }

    async fn ended(&self, event: &Event, e: &StasisEnd) -> Result<()> {
        let channel_id = e.channel.id.as_str();
        let at = event.timestamp();
        self.ctx
            .store
            .channel_update(
                channel_id,
                Box::new(move |channel| {
                    channel.stasis_application.clear();
                    channel.tm_update = Some(at);
                }),
            )
            .await
            .map_err(missing_channel(channel_id))?;
        debug!(channel_id, "Channel left application");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for StasisLifecycle {
    async fn handle(&self, event: &Event) -> Result<()> {
        match &event.payload {
            Payload::StasisStart(e) => self.started(event, e).await,
            Payload::StasisEnd(e) => self.ended(event, e).await,
            _ => Err(EngineError::KindMismatch {
                handler: "stasis",
                actual: event.kind(),
            }),
        }
    }
}
