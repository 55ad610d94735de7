//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`;
//! without one the instruments are no-ops. All instruments come from the
//! `"batchrun"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("batchrun")
}

/// Counter: work items settled.
/// Labels: `status` (outcome status tag).
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("batchrun.items.processed")
        .with_description("Number of work items settled, by outcome")
        .build()
}

/// Counter: batches fully settled.
pub fn batches_completed() -> Counter<u64> {
    meter()
        .u64_counter("batchrun.batches.completed")
        .with_description("Number of batches fully settled")
        .build()
}

/// Counter: checkpoint file writes.
/// Labels: `result` ("ok" | "error").
pub fn checkpoint_writes() -> Counter<u64> {
    meter()
        .u64_counter("batchrun.checkpoint.writes")
        .with_description("Number of checkpoint writes")
        .build()
}

/// Histogram: handler duration per item in milliseconds.
/// Labels: `status`.
pub fn item_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchrun.item.duration_ms")
        .with_description("Handler duration per work item")
        .with_unit("ms")
        .build()
}
