//! Work item span helpers.

use tracing::Span;
use uuid::Uuid;

use crate::model::Outcome;

/// Start the span covering one item's handler invocation.
///
/// `item.status` is declared empty and filled by [`record_outcome`].
pub fn start_item_span(run_id: &Uuid, item_id: &str, batch_index: usize) -> Span {
    tracing::info_span!(
        "item.process",
        "item.id" = item_id,
        "run.id" = %run_id,
        "batch.index" = batch_index,
        "item.status" = tracing::field::Empty,
    )
}

/// Record the settled outcome on the item's span.
pub fn record_outcome(span: &Span, outcome: &Outcome) {
    span.record("item.status", outcome.status());
}
