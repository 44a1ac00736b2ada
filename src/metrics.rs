//! Prometheus metrics.
//!
//! Metrics are created per `Metrics` value and registered on a caller-owned
//! `Registry`; nothing is registered globally.
//!
//! ## Metrics Exported
//!
//! - `callcore_events_total{kind}` - events consumed
//! - `callcore_event_errors_total{kind}` - events whose handling failed
//! - `callcore_rpc_duration_seconds{target,method}` - RPC round trip time
//! - `callcore_channels_created_total` - channel rows created
//! - `callcore_channels_destroyed_total{cause}` - channels destroyed by cause
//! - `callcore_defensive_hangups_total{reason}` - corrective hangups issued

use prometheus::{
    core::Collector, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

/// Handles to every metric the engine updates. Cloning shares the series.
#[derive(Clone)]
pub struct Metrics {
    pub events_total: IntCounterVec,
    pub event_errors_total: IntCounterVec,
    pub rpc_duration_seconds: HistogramVec,
    pub channels_created_total: IntCounter,
    pub channels_destroyed_total: IntCounterVec,
    pub defensive_hangups_total: IntCounterVec,
}

impl Metrics {
    /// Create the metrics and register them on `registry`.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            events_total: IntCounterVec::new(
                Opts::new("callcore_events_total", "Switch events consumed"),
                &["kind"],
            )?,
            event_errors_total: IntCounterVec::new(
                Opts::new("callcore_event_errors_total", "Switch events whose handling failed"),
                &["kind"],
            )?,
            rpc_duration_seconds: HistogramVec::new(
                HistogramOpts::new("callcore_rpc_duration_seconds", "RPC round trip time")
                    .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
                &["target", "method"],
            )?,
            channels_created_total: IntCounter::new(
                "callcore_channels_created_total",
                "Channel rows created",
            )?,
            channels_destroyed_total: IntCounterVec::new(
                Opts::new("callcore_channels_destroyed_total", "Channels destroyed"),
                &["cause"],
            )?,
            defensive_hangups_total: IntCounterVec::new(
                Opts::new(
                    "callcore_defensive_hangups_total",
                    "Hangups issued because local state disagreed with the switch",
                ),
                &["reason"],
            )?,
        };

        let collectors: Vec<Box<dyn Collector>> = vec![
            Box::new(metrics.events_total.clone()),
            Box::new(metrics.event_errors_total.clone()),
            Box::new(metrics.rpc_duration_seconds.clone()),
            Box::new(metrics.channels_created_total.clone()),
            Box::new(metrics.channels_destroyed_total.clone()),
            Box::new(metrics.defensive_hangups_total.clone()),
        ];
        for collector in collectors {
            registry.register(collector)?;
        }

        Ok(metrics)
    }
}

/// Render `registry` in the Prometheus text format.
pub fn encode(registry: &Registry) -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
