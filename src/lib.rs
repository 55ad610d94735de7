//! # batchrun
//!
//! Bounded batch-and-checkpoint task runner.
//!
//! Drains a queue of work items through a caller-supplied async handler in
//! fixed-size batches, with bounded concurrency, fixed pacing between items
//! and batches, per-item failure isolation, and a durable checkpoint so an
//! interrupted run resumes without redoing completed items.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod followup;
pub mod handler;
pub mod input;
pub mod model;
pub mod phase;
pub mod runner;
pub mod telemetry;

pub use checkpoint::CheckpointStore;
pub use error::{Error, Result};
pub use followup::FollowUps;
pub use handler::{CheckpointHandler, CommandHandler};
pub use model::{BatchConfig, Outcome, RunSummary, WorkItem};
pub use phase::{ResultRecord, ResultsLog};
pub use runner::{Handler, RunResults, TaskRunner};
