//! Event envelope: `{type, publisher, data_type, data}`.
//!
//! The envelope `type` names the notification; `data` carries the body,
//! either as a JSON string holding the serialized body or as inline JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content type for JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type for plain text payloads.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Wire envelope shared by fire-and-forget events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub publisher: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Build a JSON envelope around an already-serialized body.
    pub fn json(kind: impl Into<String>, body: &impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.into(),
            publisher: String::new(),
            data_type: CONTENT_TYPE_JSON.to_string(),
            data: serde_json::to_value(body)?,
        })
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = publisher.into();
        self
    }

    /// Raw payload text.
    ///
    /// A string `data` is returned verbatim (it holds serialized JSON or text);
    /// any other JSON value is re-serialized.
    pub fn payload(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// True when the payload is declared (or defaulted) as JSON.
    pub fn is_json(&self) -> bool {
        self.data_type.is_empty() || self.data_type.starts_with(CONTENT_TYPE_JSON)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}
