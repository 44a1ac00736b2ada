//! Switch (ARI) event protocol: wire model, typed events, decoder.

pub mod decode;
pub mod event;
pub mod model;

pub use decode::{decode, decode_event, DecodeError, ARI_EVENT};
pub use event::{Event, EventHeader, EventKind, Payload};
pub use model::{AriBridge, AriChannel, ChannelState, HangupCause};
