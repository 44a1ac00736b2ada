//! In-memory switch recording every command it receives.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Result, SwitchControl, SwitchError};
use crate::ari::{AriChannel, HangupCause};

/// A command received by `RecordingSwitch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchCommand {
    Hangup {
        peer_id: String,
        channel_id: String,
        cause: HangupCause,
    },
    Get {
        peer_id: String,
        channel_id: String,
    },
}

/// Canned reply for `channel_get`.
#[derive(Debug, Clone)]
enum GetReply {
    Found(AriChannel),
    NotFound,
    Status(u16),
}

/// Records commands; `channel_get` answers from canned replies, 404 by
/// default.
#[derive(Default)]
pub struct RecordingSwitch {
    commands: RwLock<Vec<SwitchCommand>>,
    replies: RwLock<HashMap<String, GetReply>>,
    fail_hangups: RwLock<bool>,
}

impl RecordingSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `channel_get` for this channel with `channel`.
    pub async fn set_channel(&self, channel: AriChannel) {
        self.replies.write().await.insert(channel.id.clone(), GetReply::Found(channel));
    }

    /// Answer `channel_get` for this channel with a non-404 error status.
    pub async fn set_error(&self, channel_id: &str, status_code: u16) {
        self.replies.write().await.insert(channel_id.to_string(), GetReply::Status(status_code));
    }

    pub async fn set_not_found(&self, channel_id: &str) {
        self.replies.write().await.insert(channel_id.to_string(), GetReply::NotFound);
    }

    /// Make every hangup fail with status 500.
    pub async fn set_fail_hangups(&self, fail: bool) {
        *self.fail_hangups.write().await = fail;
    }

    pub async fn commands(&self) -> Vec<SwitchCommand> {
        self.commands.read().await.clone()
    }

    /// Channels hung up, in order.
    pub async fn hangups(&self) -> Vec<(String, HangupCause)> {
        self.commands
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                SwitchCommand::Hangup {
                    channel_id, cause, ..
                } => Some((channel_id.clone(), *cause)),
                SwitchCommand::Get { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl SwitchControl for RecordingSwitch {
    async fn channel_hangup(
        &self,
        peer_id: &str,
        channel_id: &str,
        cause: HangupCause,
    ) -> Result<()> {
        self.commands.write().await.push(SwitchCommand::Hangup {
            peer_id: peer_id.to_string(),
            channel_id: channel_id.to_string(),
            cause,
        });
        if *self.fail_hangups.read().await {
            return Err(SwitchError::Status { status_code: 500 });
        }
        Ok(())
    }

    async fn channel_get(&self, peer_id: &str, channel_id: &str) -> Result<AriChannel> {
        self.commands.write().await.push(SwitchCommand::Get {
            peer_id: peer_id.to_string(),
            channel_id: channel_id.to_string(),
        });
        let reply = self.replies.read().await.get(channel_id).cloned();
        match reply {
            Some(GetReply::Found(channel)) => Ok(channel),
            Some(GetReply::Status(status_code)) => Err(SwitchError::Status { status_code }),
            Some(GetReply::NotFound) | None => Err(SwitchError::NotFound(channel_id.to_string())),
        }
    }
}
