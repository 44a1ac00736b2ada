//! Channel lifecycle: created, state changes, variables, DTMF, destroyed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{missing_channel, EngineContext, EngineError, EventHandler, Result};
use crate::ari::event::{
    ChannelCreated, ChannelDestroyed, ChannelDtmfReceived, ChannelHangupRequest,
    ChannelStateChange, ChannelVarset,
};
use crate::ari::{ChannelState, Event, HangupCause, Payload};
use crate::models::Channel;
use crate::store::StoreError;

pub struct ChannelLifecycle {
    ctx: Arc<EngineContext>,
}

impl ChannelLifecycle {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    async fn created(&self, event: &Event, e: &ChannelCreated) -> Result<()> {
        let peer_id = event.peer_id();
        let mut channel = Channel::from_ari(peer_id, &e.channel);
        channel.tm_update = Some(event.timestamp());
        if channel.creation_time.is_none() {
            channel.creation_time = Some(event.timestamp());
        }
        if channel.state.is_ringing() {
            channel.tm_ringing = Some(event.timestamp());
        }

        match self.ctx.store.channel_create(channel).await {
            Ok(()) => {}
            Err(StoreError::ChannelExists(id)) => {
                debug!(channel_id = %id, "Channel already known");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(metrics) = &self.ctx.metrics {
            metrics.channels_created_total.inc();
        }
        info!(channel_id = %e.channel.id, name = %e.channel.name, "Channel created");

        if let Some(health) = &self.ctx.health {
            if let Err(err) = health.schedule(&e.channel.id, 0).await {
                warn!(channel_id = %e.channel.id, error = %err, "Failed to start health check");
            }
        }
        Ok(())
    }

    async fn state_changed(&self, event: &Event, e: &ChannelStateChange) -> Result<()> {
        let id = e.channel.id.as_str();
        if !self.ctx.store.channel_exists(id, self.ctx.exist_timeout).await {
            return Err(EngineError::MissingChannel {
                channel_id: id.to_string(),
            });
        }

        let ari = e.channel.clone();
        let at = event.timestamp();
        let channel = self
            .ctx
            .store
            .channel_update(
                id,
                Box::new(move |channel| {
                    channel.refresh(&ari);
                    channel.tm_update = Some(at);
                    if ari.state.is_ringing() && channel.tm_ringing.is_none() {
                        channel.tm_ringing = Some(at);
                    }
                    if ari.state == ChannelState::Up && channel.tm_answer.is_none() {
                        channel.tm_answer = Some(at);
                    }
                }),
            )
            .await
            .map_err(missing_channel(id))?;
        debug!(channel_id = id, state = ?channel.state, "Channel state updated");

        self.ctx
            .call_control
            .for_channel(&channel)
            .on_channel_state_changed(&channel)
            .await?;
        Ok(())
    }

    async fn destroyed(&self, event: &Event, e: &ChannelDestroyed) -> Result<()> {
        finalize(&self.ctx, &e.channel.id, e.cause, event.timestamp()).await?;
        Ok(())
    }

    async fn hangup_requested(&self, e: &ChannelHangupRequest) -> Result<()> {
        info!(
            channel_id = %e.channel.id,
            cause = e.cause.0,
            soft = e.soft,
            "Hangup requested"
        );
        Ok(())
    }

    async fn dtmf_received(&self, e: &ChannelDtmfReceived) -> Result<()> {
        let id = e.channel.id.as_str();
        let channel = self
            .ctx
            .store
            .channel_get(id)
            .await
            .map_err(missing_channel(id))?;

        self.ctx
            .call_control
            .for_channel(&channel)
            .on_channel_dtmf_received(&channel, &e.digit, e.duration_ms)
            .await?;
        Ok(())
    }

    async fn varset(&self, event: &Event, e: &ChannelVarset) -> Result<()> {
        let Some(ari) = &e.channel else {
            debug!(variable = %e.variable, "Global variable set");
            return Ok(());
        };

        let variable = e.variable.clone();
        let value = e.value.clone();
        let at = event.timestamp();
        self.ctx
            .store
            .channel_update(
                &ari.id,
                Box::new(move |channel| {
                    channel.set_variable(&variable, &value);
                    channel.tm_update = Some(at);
                }),
            )
            .await
            .map_err(missing_channel(&ari.id))?;
        Ok(())
    }
}

/// Record the end of a channel, notify its owner with the final row, then
/// drop the row. The channel leaves its bridge; other members are untouched.
pub(crate) async fn finalize(
    ctx: &EngineContext,
    channel_id: &str,
    cause: HangupCause,
    at: DateTime<Utc>,
) -> Result<Channel> {
    let channel = ctx
        .store
        .channel_update(
            channel_id,
            Box::new(move |channel| {
                channel.hangup_cause = Some(cause);
                channel.tm_end = Some(at);
                channel.tm_update = Some(at);
            }),
        )
        .await
        .map_err(missing_channel(channel_id))?;

    if let Some(metrics) = &ctx.metrics {
        metrics
            .channels_destroyed_total
            .with_label_values(&[cause.name()])
            .inc();
    }

    let notified = ctx
        .call_control
        .for_channel(&channel)
        .on_channel_destroyed(&channel)
        .await;
    ctx.store
        .channel_delete(channel_id)
        .await
        .map_err(missing_channel(channel_id))?;
    info!(channel_id, cause = %cause, "Channel destroyed");

    notified?;
    Ok(channel)
}

#[async_trait]
impl EventHandler for ChannelLifecycle {
    async fn handle(&self, event: &Event) -> Result<()> {
        match &event.payload {
            Payload::ChannelCreated(e) => self.created(event, e).await,
            Payload::ChannelStateChange(e) => self.state_changed(event, e).await,
            Payload::ChannelDestroyed(e) => self.destroyed(event, e).await,
            Payload::ChannelHangupRequest(e) => self.hangup_requested(e).await,
            Payload::ChannelDtmfReceived(e) => self.dtmf_received(e).await,
            Payload::ChannelVarset(e) => self.varset(event, e).await,
            _ => Err(EngineError::KindMismatch {
                handler: "channel",
                actual: event.kind(),
            }),
        }
    }
}
