//! Typed switch events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{time, AriBridge, AriChannel, HangupCause};

/// Event kinds the engine understands. Anything else is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChannelCreated,
    ChannelStateChange,
    ChannelEnteredBridge,
    ChannelLeftBridge,
    ChannelDestroyed,
    ChannelHangupRequest,
    ChannelDtmfReceived,
    ChannelVarset,
    StasisStart,
    StasisEnd,
    BridgeCreated,
    BridgeDestroyed,
    Unknown,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::ChannelCreated,
        EventKind::ChannelStateChange,
        EventKind::ChannelEnteredBridge,
        EventKind::ChannelLeftBridge,
        EventKind::ChannelDestroyed,
        EventKind::ChannelHangupRequest,
        EventKind::ChannelDtmfReceived,
        EventKind::ChannelVarset,
        EventKind::StasisStart,
        EventKind::StasisEnd,
        EventKind::BridgeCreated,
        EventKind::BridgeDestroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChannelCreated => "ChannelCreated",
            EventKind::ChannelStateChange => "ChannelStateChange",
            EventKind::ChannelEnteredBridge => "ChannelEnteredBridge",
            EventKind::ChannelLeftBridge => "ChannelLeftBridge",
            EventKind::ChannelDestroyed => "ChannelDestroyed",
            EventKind::ChannelHangupRequest => "ChannelHangupRequest",
            EventKind::ChannelDtmfReceived => "ChannelDtmfReceived",
            EventKind::ChannelVarset => "ChannelVarset",
            EventKind::StasisStart => "StasisStart",
            EventKind::StasisEnd => "StasisEnd",
            EventKind::BridgeCreated => "BridgeCreated",
            EventKind::BridgeDestroyed => "BridgeDestroyed",
            EventKind::Unknown => "Unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .unwrap_or(EventKind::Unknown)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields common to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventHeader {
    /// Event type as sent, including kinds this build does not know.
    #[serde(rename = "type")]
    pub kind: String,
    /// Switch instance that emitted the event.
    pub asterisk_id: String,
    pub application: String,
    #[serde(with = "time")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCreated {
    pub channel: AriChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStateChange {
    pub channel: AriChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEnteredBridge {
    pub channel: AriChannel,
    pub bridge: AriBridge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLeftBridge {
    pub channel: AriChannel,
    pub bridge: AriBridge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDestroyed {
    pub channel: AriChannel,
    #[serde(default)]
    pub cause: HangupCause,
    #[serde(default)]
    pub cause_txt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHangupRequest {
    pub channel: AriChannel,
    #[serde(default)]
    pub cause: HangupCause,
    #[serde(default)]
    pub soft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDtmfReceived {
    pub channel: AriChannel,
    pub digit: String,
    #[serde(default)]
    pub duration_ms: u32,
}

/// Variable set on a channel; global variables carry no channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelVarset {
    #[serde(default)]
    pub channel: Option<AriChannel>,
    pub variable: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StasisStart {
    pub channel: AriChannel,
    /// `KEY=value` strings.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub replace_channel: Option<AriChannel>,
}

impl StasisStart {
    /// Parse `KEY=value` arguments; keys are lower-cased, bare words map to
    /// an empty value.
    pub fn parsed_args(&self) -> Vec<(String, String)> {
        self.args
            .iter()
            .filter(|arg| !arg.is_empty())
            .map(|arg| match arg.split_once('=') {
                Some((key, value)) => (key.trim().to_lowercase(), value.trim().to_string()),
                None => (arg.trim().to_lowercase(), String::new()),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StasisEnd {
    pub channel: AriChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeCreated {
    pub bridge: AriBridge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeDestroyed {
    pub bridge: AriBridge,
}

/// Typed event body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    ChannelCreated(ChannelCreated),
    ChannelStateChange(ChannelStateChange),
    ChannelEnteredBridge(ChannelEnteredBridge),
    ChannelLeftBridge(ChannelLeftBridge),
    ChannelDestroyed(ChannelDestroyed),
    ChannelHangupRequest(ChannelHangupRequest),
    ChannelDtmfReceived(ChannelDtmfReceived),
    ChannelVarset(ChannelVarset),
    StasisStart(StasisStart),
    StasisEnd(StasisEnd),
    BridgeCreated(BridgeCreated),
    BridgeDestroyed(BridgeDestroyed),
    /// Kind this build does not know; the header still names it.
    Unknown,
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::ChannelCreated(_) => EventKind::ChannelCreated,
            Payload::ChannelStateChange(_) => EventKind::ChannelStateChange,
            Payload::ChannelEnteredBridge(_) => EventKind::ChannelEnteredBridge,
            Payload::ChannelLeftBridge(_) => EventKind::ChannelLeftBridge,
            Payload::ChannelDestroyed(_) => EventKind::ChannelDestroyed,
            Payload::ChannelHangupRequest(_) => EventKind::ChannelHangupRequest,
            Payload::ChannelDtmfReceived(_) => EventKind::ChannelDtmfReceived,
            Payload::ChannelVarset(_) => EventKind::ChannelVarset,
            Payload::StasisStart(_) => EventKind::StasisStart,
            Payload::StasisEnd(_) => EventKind::StasisEnd,
            Payload::BridgeCreated(_) => EventKind::BridgeCreated,
            Payload::BridgeDestroyed(_) => EventKind::BridgeDestroyed,
            Payload::Unknown => EventKind::Unknown,
        }
    }
}

/// A decoded event: header plus typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub header: EventHeader,
    pub payload: Payload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn peer_id(&self) -> &str {
        &self.header.asterisk_id
    }

    /// Timestamp of the event, or now when the switch sent none.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.header.timestamp.unwrap_or_else(Utc::now)
    }

    /// Channel the event refers to, if any.
    pub fn channel_id(&self) -> Option<&str> {
        let channel = match &self.payload {
            Payload::ChannelCreated(e) => &e.channel,
            Payload::ChannelStateChange(e) => &e.channel,
            Payload::ChannelEnteredBridge(e) => &e.channel,
            Payload::ChannelLeftBridge(e) => &e.channel,
            Payload::ChannelDestroyed(e) => &e.channel,
            Payload::ChannelHangupRequest(e) => &e.channel,
            Payload::ChannelDtmfReceived(e) => &e.channel,
            Payload::ChannelVarset(e) => e.channel.as_ref()?,
            Payload::StasisStart(e) => &e.channel,
            Payload::StasisEnd(e) => &e.channel,
            Payload::BridgeCreated(_) | Payload::BridgeDestroyed(_) | Payload::Unknown => {
                return None
            }
        };
        Some(channel.id.as_str())
    }
}
