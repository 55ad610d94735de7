//! Core data model.
//!
//! A work item is an opaque record identified by a stable string id. The
//! runner never looks inside it; handlers do. Every item settles to exactly
//! one [`Outcome`] per run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work supplied by the caller.
///
/// Serialized flat: `{"id": "...", ...fields}`. Equality and hashing use
/// `id` only, so two records with the same id are the same item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique, stable identifier.
    pub id: String,

    /// Arbitrary caller fields (target URL, company name, ...).
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a caller field.
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WorkItem {}

impl std::hash::Hash for WorkItem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of processing one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Handler finished the item.
    Success,
    /// Already checkpointed; handler side effects were not run.
    Skipped,
    /// Excluded by policy before any work was attempted.
    Excluded,
    /// Handler failed or panicked. The item will be retried on a later run.
    Error { error: String },
    /// A human has to look at this item before it can proceed.
    ManualInterventionRequired { reason: String },
    /// Never dispatched because the run was stopped early.
    Cancelled,
}

impl Outcome {
    pub fn error(message: impl Into<String>) -> Self {
        Outcome::Error {
            error: message.into(),
        }
    }

    pub fn manual_intervention(reason: impl Into<String>) -> Self {
        Outcome::ManualInterventionRequired {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Error message or manual-intervention reason, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Outcome::Error { error } => Some(error),
            Outcome::ManualInterventionRequired { reason } => Some(reason),
            _ => None,
        }
    }

    /// The wire name of this outcome's `status` tag.
    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Skipped => "skipped",
            Outcome::Excluded => "excluded",
            Outcome::Error { .. } => "error",
            Outcome::ManualInterventionRequired { .. } => "manual_intervention_required",
            Outcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Error { error } => write!(f, "error: {error}"),
            Outcome::ManualInterventionRequired { reason } => {
                write!(f, "manual intervention required: {reason}")
            }
            other => write!(f, "{}", other.status()),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch Config
// ---------------------------------------------------------------------------

/// Pacing and concurrency settings for a [`TaskRunner`](crate::runner::TaskRunner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Items per batch. A batch fully settles before the next one starts.
    pub batch_size: usize,
    /// Upper bound on handler invocations in flight at once.
    pub max_concurrent: usize,
    /// Stagger between consecutive dispatches inside a batch.
    pub delay_between_items: Duration,
    /// Pause after a batch settles, before the next one dispatches.
    pub delay_between_batches: Duration,
    /// Await outstanding follow-ups at the end of a run instead of aborting them.
    pub wait_for_followups: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_concurrent: 5,
            delay_between_items: Duration::from_secs(5),
            delay_between_batches: Duration::from_secs(30),
            wait_for_followups: true,
        }
    }
}

impl BatchConfig {
    /// Full-batch fan-out: `max_concurrent` follows `batch_size`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self.max_concurrent = batch_size;
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn delay_between_items(mut self, delay: Duration) -> Self {
        self.delay_between_items = delay;
        self
    }

    pub fn delay_between_batches(mut self, delay: Duration) -> Self {
        self.delay_between_batches = delay;
        self
    }

    pub fn wait_for_followups(mut self, wait: bool) -> Self {
        self.wait_for_followups = wait;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent > self.batch_size {
            return Err(Error::Config(format!(
                "max_concurrent ({}) cannot exceed batch_size ({})",
                self.max_concurrent, self.batch_size
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Per-status counts over a set of outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub success: usize,
    pub skipped: usize,
    pub excluded: usize,
    pub error: usize,
    pub manual_intervention: usize,
    pub cancelled: usize,
}

impl RunSummary {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a Outcome>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            summary.add(outcome);
        }
        summary
    }

    pub fn add(&mut self, outcome: &Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Excluded => self.excluded += 1,
            Outcome::Error { .. } => self.error += 1,
            Outcome::ManualInterventionRequired { .. } => self.manual_intervention += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} item(s): {} success, {} skipped, {} excluded, {} error, {} manual, {} cancelled",
            self.total,
            self.success,
            self.skipped,
            self.excluded,
            self.error,
            self.manual_intervention,
            self.cancelled
        )
    }
}
