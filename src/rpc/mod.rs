//! Request/reply over the broker.
//!
//! - `RpcClient`: one transient, broker-named reply queue per call; the
//!   request carries `reply_to` + `correlation_id` and the call races the
//!   reply against its deadline.
//! - `RpcServer`: consume loop over a durable request queue; replies go to
//!   the request's `reply_to` on a channel opened for that reply alone.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::envelope::CONTENT_TYPE_JSON;
use crate::bus::BusError;

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::{RequestHandler, RpcServer};

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors that can occur during RPC calls.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Request to {target} timed out after {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("Request to {target} cancelled")]
    Cancelled { target: String },

    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Request has no reply-to address")]
    NoReplyQueue,

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// RPC request: `{uri, method, publisher, data_type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub uri: String,
    pub method: Method,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub publisher: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method,
            publisher: String::new(),
            data_type: String::new(),
            data: Value::Null,
        }
    }

    /// Request with a JSON body.
    pub fn json(method: Method, uri: impl Into<String>, body: &impl Serialize) -> Result<Self> {
        let data = serde_json::to_value(body).map_err(RpcError::Encode)?;
        Ok(Self {
            data_type: CONTENT_TYPE_JSON.to_string(),
            data,
            ..Self::new(method, uri)
        })
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = publisher.into();
        self
    }

    /// Deserialize the JSON body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(RpcError::Decode)
    }
}

/// RPC response: `{status_code, data_type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status_code: u16,
    #[serde(default)]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Response {
    /// Status-only response.
    pub fn status(status_code: u16) -> Self {
        Self {
            status_code,
            data_type: String::new(),
            data: Value::Null,
        }
    }

    pub fn json(status_code: u16, body: &impl Serialize) -> Result<Self> {
        Ok(Self {
            status_code,
            data_type: CONTENT_TYPE_JSON.to_string(),
            data: serde_json::to_value(body).map_err(RpcError::Encode)?,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(RpcError::Decode)
    }
}

/// Inbox of one remote peer: `<prefix>-<peer_id>`.
pub fn peer_target(prefix: &str, peer_id: &str) -> String {
    format!("{}-{}", prefix, peer_id)
}

/// RPC configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Default deadline for `call()`.
    pub request_timeout_ms: u64,
    /// Prefix of per-switch request queues.
    pub switch_target_prefix: String,
    /// Service name stamped on outgoing requests.
    pub publisher: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3000,
            switch_target_prefix: "asterisk-request".to_string(),
            publisher: "callcore".to_string(),
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }
}
