//! Two-stage event decoding.
//!
//! The broker message is an envelope whose `data` holds the event JSON. The
//! event's `type` is read first; the full JSON is then decoded into the
//! payload struct for that kind. Unknown kinds are not errors: they decode
//! to `Payload::Unknown` so newer switches never break older consumers.

use serde::de::DeserializeOwned;

use super::event::{Event, EventHeader, EventKind, Payload};
use crate::bus::envelope::Envelope;

/// Envelope `type` carrying switch events.
pub const ARI_EVENT: &str = "ari_event";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("Unsupported content type: {0}")]
    ContentType(String),

    #[error("Malformed {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a raw broker message into an event.
///
/// Envelopes of another `type` decode to an `Unknown` event named after the
/// envelope type.
pub fn decode(raw: &[u8]) -> Result<Event, DecodeError> {
    let envelope = Envelope::from_slice(raw).map_err(DecodeError::Envelope)?;
    if !envelope.is_json() {
        return Err(DecodeError::ContentType(envelope.data_type));
    }
    if envelope.kind != ARI_EVENT {
        return Ok(Event {
            header: EventHeader {
                kind: envelope.kind,
                ..Default::default()
            },
            payload: Payload::Unknown,
        });
    }
    decode_event(&envelope.payload())
}

/// Decode the event JSON itself.
pub fn decode_event(json: &str) -> Result<Event, DecodeError> {
    let header: EventHeader = serde_json::from_str(json).map_err(|source| DecodeError::Payload {
        kind: "event header".to_string(),
        source,
    })?;

    let kind = EventKind::from_name(&header.kind);
    let payload = match kind {
        EventKind::ChannelCreated => Payload::ChannelCreated(typed(&header, json)?),
        EventKind::ChannelStateChange => Payload::ChannelStateChange(typed(&header, json)?),
        EventKind::ChannelEnteredBridge => Payload::ChannelEnteredBridge(typed(&header, json)?),
        EventKind::ChannelLeftBridge => Payload::ChannelLeftBridge(typed(&header, json)?),
        EventKind::ChannelDestroyed => Payload::ChannelDestroyed(typed(&header, json)?),
        EventKind::ChannelHangupRequest => Payload::ChannelHangupRequest(typed(&header, json)?),
        EventKind::ChannelDtmfReceived => Payload::ChannelDtmfReceived(typed(&header, json)?),
        EventKind::ChannelVarset => Payload::ChannelVarset(typed(&header, json)?),
        EventKind::StasisStart => Payload::StasisStart(typed(&header, json)?),
        EventKind::StasisEnd => Payload::StasisEnd(typed(&header, json)?),
        EventKind::BridgeCreated => Payload::BridgeCreated(typed(&header, json)?),
        EventKind::BridgeDestroyed => Payload::BridgeDestroyed(typed(&header, json)?),
        EventKind::Unknown => Payload::Unknown,
    };

    Ok(Event { header, payload })
}

fn typed<T: DeserializeOwned>(header: &EventHeader, json: &str) -> Result<T, DecodeError> {
    serde_json::from_str(json).map_err(|source| DecodeError::Payload {
        kind: header.kind.clone(),
        source,
    })
}

/// Wrap event JSON in an `ari_event` envelope.
pub fn encode(event_json: &serde_json::Value) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_string(event_json)?;
    let envelope = Envelope {
        kind: ARI_EVENT.to_string(),
        publisher: String::new(),
        data_type: crate::bus::envelope::CONTENT_TYPE_JSON.to_string(),
        data: serde_json::Value::String(body),
    };
    envelope.to_vec()
}
