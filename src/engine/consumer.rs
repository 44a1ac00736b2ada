//! Event queue consumer: decode, dispatch, log.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info_span, warn, Instrument};

use super::{DispatchResult, Dispatcher};
use crate::ari::decode;
use crate::bus::{Delivery, DeliveryHandler};
use crate::metrics::Metrics;

/// Feeds raw event messages through the decoder and dispatcher. A bad event
/// is logged and dropped; it never stops the consume loop.
pub struct EventConsumer {
    dispatcher: Arc<Dispatcher>,
    metrics: Option<Metrics>,
}

impl EventConsumer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Process one raw message.
    pub async fn process(&self, raw: &[u8]) -> DispatchResult {
        let event = match decode(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable event");
                self.count_error("undecodable");
                return DispatchResult::DecodeError;
            }
        };

        let kind = event.kind();
        let span = info_span!(
            "ari.event",
            kind = %event.header.kind,
            peer_id = %event.peer_id(),
            channel_id = event.channel_id().unwrap_or("")
        );

        async {
            if let Some(metrics) = &self.metrics {
                metrics.events_total.with_label_values(&[kind.as_str()]).inc();
            }
            match self.dispatcher.dispatch(&event).await {
                Ok(DispatchResult::Ignored) => {
                    debug!("No handler for event");
                    DispatchResult::Ignored
                }
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Event handling failed");
                    self.count_error(kind.as_str());
                    DispatchResult::HandlerFailed
                }
            }
        }
        .instrument(span)
        .await
    }

    fn count_error(&self, label: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.event_errors_total.with_label_values(&[label]).inc();
        }
    }
}

#[async_trait]
impl DeliveryHandler for EventConsumer {
    async fn handle(&self, delivery: &Delivery) {
        self.process(&delivery.data).await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ari::decode::encode;
    use crate::engine::testing::*;
    use crate::store::StateStore;

    fn consumer(h: &Harness) -> EventConsumer {
        EventConsumer::new(Arc::new(h.dispatcher.clone())).with_metrics(h.metrics.clone())
    }

    #[tokio::test]
    async fn test_process_handles_event() {
        let h = Harness::new();
        let consumer = consumer(&h);

        let result = consumer.process(&encode(&channel_created("c1")).unwrap()).await;

        assert_eq!(result, DispatchResult::Handled);
        assert!(h.store.channel_get("c1").await.is_ok());
        assert_eq!(
            h.metrics
                .events_total
                .with_label_values(&["ChannelCreated"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_garbage_is_counted_and_dropped() {
        let h = Harness::new();
        let consumer = consumer(&h);

        assert_eq!(consumer.process(b"not json").await, DispatchResult::DecodeError);
        assert_eq!(
            h.metrics
                .event_errors_total
                .with_label_values(&["undecodable"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_kind_has_no_side_effects() {
        let h = Harness::new();
        let consumer = consumer(&h);
        let raw = encode(&json!({"type": "PlaybackStarted", "asterisk_id": PEER})).unwrap();

        assert_eq!(consumer.process(&raw).await, DispatchResult::Ignored);
        let (channels, bridges) = h.store.snapshot().await;
        assert!(channels.is_empty() && bridges.is_empty());
        assert!(h.switch.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_next_event() {
        let h = Harness::new();
        let consumer = consumer(&h);

        let failed = consumer.process(&encode(&state_change("ghost", "Up")).unwrap()).await;
        let next = consumer.process(&encode(&channel_created("c2")).unwrap()).await;

        assert_eq!(failed, DispatchResult::HandlerFailed);
        assert_eq!(next, DispatchResult::Handled);
        assert_eq!(
            h.metrics
                .event_errors_total
                .with_label_values(&["ChannelStateChange"])
                .get(),
            1
        );
    }
}
