//! Event dispatch by kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::Result;
use crate::ari::{Event, EventKind};

/// Handles events of the kinds it is registered for.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Result of processing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// A handler ran and succeeded.
    Handled,
    /// No handler is registered for the kind.
    Ignored,
    /// The handler returned an error.
    HandlerFailed,
    /// The message could not be decoded.
    DecodeError,
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Handled | Self::Ignored)
    }
}

/// Static table from event kind to handler, built once at startup.
#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Run the handler for the event's kind. Kinds without a handler succeed
    /// without side effects.
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchResult> {
        let Some(handler) = self.handlers.get(&event.kind()) else {
            return Ok(DispatchResult::Ignored);
        };
        handler.handle(event).await?;
        Ok(DispatchResult::Handled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ari::{decode_event, EventHeader, Payload};
    use crate::engine::EngineError;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _event: &Event) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::MissingChannel {
                    channel_id: "c1".to_string(),
                });
            }
            Ok(())
        }
    }

    fn stasis_end() -> Event {
        decode_event(r#"{"type":"StasisEnd","channel":{"id":"c1"},"asterisk_id":"p1"}"#).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler() {
        let handler = Arc::new(Counting::default());
        let dispatcher = Dispatcher::new().register(EventKind::StasisEnd, handler.clone());

        let result = dispatcher.dispatch(&stasis_end()).await.unwrap();

        assert_eq!(result, DispatchResult::Handled);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_ignored() {
        let handler = Arc::new(Counting::default());
        let dispatcher = Dispatcher::new().register(EventKind::StasisStart, handler.clone());

        let result = dispatcher.dispatch(&stasis_end()).await.unwrap();

        assert_eq!(result, DispatchResult::Ignored);
        assert!(result.is_success());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_ignored() {
        let dispatcher = Dispatcher::new();
        let event = Event {
            header: EventHeader {
                kind: "PlaybackStarted".to_string(),
                ..Default::default()
            },
            payload: Payload::Unknown,
        };

        assert_eq!(
            dispatcher.dispatch(&event).await.unwrap(),
            DispatchResult::Ignored
        );
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let handler = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let dispatcher = Dispatcher::new().register(EventKind::StasisEnd, handler);

        let err = dispatcher.dispatch(&stasis_end()).await.unwrap_err();

        assert!(matches!(err, EngineError::MissingChannel { .. }));
    }
}
