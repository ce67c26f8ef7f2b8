//! Observability port for ingestion handlers.
//!
//! Handlers receive an `Arc<dyn Monitor>` at construction instead of touching
//! a global metrics registry.
//!
//! ## Built-in metrics ([`OtelMonitor`])
//! - `beaconindex.epochs_processed` — counter, tagged with handler
//! - `beaconindex.latest_epoch`     — gauge, tagged with handler

use opentelemetry::{
    metrics::{Counter, Gauge, Meter},
    KeyValue,
};

use crate::types::Epoch;

/// Receives events emitted by ingestion handlers.
pub trait Monitor: Send + Sync {
    /// An epoch was fully ingested by `handler`.
    fn epoch_processed(&self, handler: &str, epoch: Epoch);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn epoch_processed(&self, _handler: &str, _epoch: Epoch) {}
}

/// OpenTelemetry-backed monitor.
#[derive(Clone)]
pub struct OtelMonitor {
    pub epochs_processed: Counter<u64>,
    pub latest_epoch: Gauge<u64>,
}

impl OtelMonitor {
    pub fn new(meter: &Meter) -> Self {
        Self {
            epochs_processed: meter
                .u64_counter("beaconindex.epochs_processed")
                .with_description("Epochs fully ingested")
                .build(),
            latest_epoch: meter
                .u64_gauge("beaconindex.latest_epoch")
                .with_description("Most recent epoch fully ingested")
                .build(),
        }
    }
}

impl Monitor for OtelMonitor {
    fn epoch_processed(&self, handler: &str, epoch: Epoch) {
        let attrs = [KeyValue::new("handler", handler.to_string())];
        self.epochs_processed.add(1, &attrs);
        self.latest_epoch.record(epoch, &attrs);
    }
}
