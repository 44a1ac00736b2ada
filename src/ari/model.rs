//! Switch entities as they appear inside events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamps in the switch's format, e.g. `2020-04-19T14:38:00.363+0000`.
///
/// RFC 3339 is accepted as well; empty strings decode to `None`.
pub mod time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z")
            .or_else(|_| DateTime::parse_from_rfc3339(raw))
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn format(t: &DateTime<Utc>) -> String {
        t.format(FORMAT).to_string()
    }

    pub fn serialize<S: Serializer>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_str(&format(t)),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?.unwrap_or_default();
        if raw.is_empty() {
            return Ok(None);
        }
        parse(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }
}

/// Channel state reported by the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChannelState {
    Down,
    Rsrved,
    OffHook,
    Dialing,
    Ring,
    Ringing,
    Up,
    Busy,
    #[serde(rename = "Dialing Offhook")]
    DialingOffhook,
    #[serde(rename = "Pre-ring")]
    PreRing,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ChannelState {
    pub fn is_ringing(&self) -> bool {
        matches!(self, ChannelState::Ring | ChannelState::Ringing)
    }
}

/// Q.850 hangup cause code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HangupCause(pub u16);

impl HangupCause {
    pub const UNKNOWN: Self = Self(0);
    pub const NORMAL_CLEARING: Self = Self(16);
    pub const USER_BUSY: Self = Self(17);
    pub const NO_USER_RESPONSE: Self = Self(18);
    pub const NO_ANSWER: Self = Self(19);
    pub const CALL_REJECTED: Self = Self(21);
    pub const SWITCH_CONGESTION: Self = Self(42);
    pub const INTERWORKING: Self = Self(127);

    /// Short name for logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "unknown",
            16 => "normal_clearing",
            17 => "user_busy",
            18 => "no_user_response",
            19 => "no_answer",
            21 => "call_rejected",
            42 => "switch_congestion",
            127 => "interworking",
            _ => "other",
        }
    }
}

impl fmt::Display for HangupCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerId {
    pub name: String,
    pub number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dialplan {
    pub context: String,
    pub exten: String,
    pub priority: i64,
    pub app_name: String,
    pub app_data: String,
}

/// Channel as embedded in events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AriChannel {
    pub id: String,
    pub name: String,
    pub state: ChannelState,
    pub caller: CallerId,
    pub connected: CallerId,
    pub accountcode: String,
    pub dialplan: Dialplan,
    #[serde(with = "time")]
    pub creationtime: Option<DateTime<Utc>>,
    pub language: String,
}

/// Bridge as embedded in events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AriBridge {
    pub id: String,
    pub technology: String,
    pub bridge_type: String,
    pub bridge_class: String,
    pub creator: String,
    pub name: String,
    pub channels: Vec<String>,
    #[serde(with = "time")]
    pub creationtime: Option<DateTime<Utc>>,
    pub video_mode: String,
}
