//! Batch runner. Drains a queue of work items through a caller-supplied
//! handler in fixed-size batches with bounded concurrency and fixed pacing.
//!
//! Guarantees:
//! - every distinct id in the input appears exactly once in the results;
//! - batches are strictly sequential, and a batch starts only after the
//!   previous one fully settled and `delay_between_batches` elapsed;
//! - a failing or panicking handler only affects its own item.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::followup::FollowUps;
use crate::input::dedup_items;
use crate::model::{BatchConfig, Outcome, RunSummary, WorkItem};
use crate::telemetry::item::{record_outcome, start_item_span};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Per-item work. Opaque to the runner.
///
/// An `Err` is recorded as [`Outcome::Error`]. Timeouts belong here too:
/// a handler that may hang should race its own deadline.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        item: WorkItem,
        followups: FollowUps,
    ) -> impl Future<Output = anyhow::Result<Outcome>> + Send;
}

impl<F, Fut> Handler for F
where
    F: Fn(WorkItem, FollowUps) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Outcome>> + Send,
{
    fn handle(
        &self,
        item: WorkItem,
        followups: FollowUps,
    ) -> impl Future<Output = anyhow::Result<Outcome>> + Send {
        (self)(item, followups)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome per work item id. Iteration order is unspecified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunResults {
    outcomes: HashMap<String, Outcome>,
}

impl RunResults {
    pub fn get(&self, id: &str) -> Option<&Outcome> {
        self.outcomes.get(id)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome)> {
        self.outcomes.iter().map(|(id, o)| (id.as_str(), o))
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_outcomes(self.outcomes.values())
    }

    /// Ids whose outcome is `Success`, sorted.
    pub fn successful_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .outcomes
            .iter()
            .filter(|(_, o)| o.is_success())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn into_map(self) -> HashMap<String, Outcome> {
        self.outcomes
    }
}

impl From<HashMap<String, Outcome>> for RunResults {
    fn from(outcomes: HashMap<String, Outcome>) -> Self {
        Self { outcomes }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Processes one queue at a time. Cloning shares state, so a clone can
/// [`stop`](TaskRunner::stop) a run in progress.
#[derive(Clone)]
pub struct TaskRunner {
    config: BatchConfig,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    results: Arc<Mutex<HashMap<String, Outcome>>>,
}

/// Clears the running flag even if the run future is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A spawned handler task that is aborted if its owner is dropped first.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Every follow-up handle of the current run. Whatever is still pending when
/// the run ends, or when its future is dropped, is aborted.
#[derive(Default)]
struct RunFollowUps(Vec<FollowUps>);

impl Drop for RunFollowUps {
    fn drop(&mut self) {
        let cancelled: usize = self.0.iter().map(FollowUps::cancel_all).sum();
        if cancelled > 0 {
            debug!(cancelled, "run ended, outstanding follow-ups aborted");
        }
    }
}

struct InFlight {
    id: String,
    followups: FollowUps,
    span: tracing::Span,
    handle: AbortOnDrop<(Outcome, Duration)>,
}

impl TaskRunner {
    pub fn new(config: BatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            results: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the current (or last) run's results.
    pub fn results(&self) -> RunResults {
        RunResults::from(self.results.lock().clone())
    }

    /// Ask the active run to end after the current batch. Items not yet
    /// dispatched settle as `Cancelled`, pending follow-ups are aborted.
    pub fn stop(&self) {
        if self.is_running() {
            info!("stop requested, no further batches will start");
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Resolves once [`stop`](TaskRunner::stop) has been called.
    pub(crate) async fn stopped(&self) {
        let notified = self.stop_notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent stop is not missed.
        notified.as_mut().enable();
        if self.stop_requested() {
            return;
        }
        notified.await;
    }

    /// Drain `items` through `handler`.
    ///
    /// Duplicate ids are dropped (first occurrence wins). If a run is
    /// already active on this runner, the call is rejected and returns a
    /// snapshot of the in-progress results.
    pub async fn run<H: Handler>(&self, items: Vec<WorkItem>, handler: H) -> RunResults {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("run already in progress, returning in-progress results");
            return self.results();
        }
        let _running = RunningGuard(&self.running);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.results.lock().clear();

        let run_id = Uuid::new_v4();
        let items = dedup_items(items);
        let total = items.len();
        let batch_count = total.div_ceil(self.config.batch_size);
        let span = tracing::info_span!("run", "run.id" = %run_id, items = total);

        async {
            info!(
                items = total,
                batches = batch_count,
                batch_size = self.config.batch_size,
                max_concurrent = self.config.max_concurrent,
                "starting queue processing"
            );

            let handler = Arc::new(handler);
            let permits = Arc::new(Semaphore::new(self.config.max_concurrent));
            let mut followups = RunFollowUps::default();
            let mut queue = items.into_iter().peekable();
            let mut batch_index = 0;

            while queue.peek().is_some() {
                if self.stop_requested() {
                    break;
                }
                let batch: Vec<WorkItem> = queue.by_ref().take(self.config.batch_size).collect();
                batch_index += 1;

                self.run_batch(
                    &run_id,
                    batch_index,
                    batch_count,
                    batch,
                    &handler,
                    &permits,
                    &mut followups,
                )
                .await;

                if queue.peek().is_some() && !self.pause_between_batches().await {
                    break;
                }
            }

            let stopped = self.stop_requested();
            if stopped {
                let mut results = self.results.lock();
                let mut cancelled = 0;
                for item in queue {
                    results.insert(item.id, Outcome::Cancelled);
                    cancelled += 1;
                }
                warn!(cancelled, "run stopped early");
            }

            self.settle_followups(&followups.0, stopped).await;

            let results = self.results();
            info!(summary = %results.summary(), "queue processing finished");
            results
        }
        .instrument(span)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_batch<H: Handler>(
        &self,
        run_id: &Uuid,
        batch_index: usize,
        batch_count: usize,
        batch: Vec<WorkItem>,
        handler: &Arc<H>,
        permits: &Arc<Semaphore>,
        run_followups: &mut RunFollowUps,
    ) {
        let started = Instant::now();
        info!(batch = batch_index, of = batch_count, size = batch.len(), "processing batch");

        let mut in_flight = Vec::with_capacity(batch.len());
        for (pos, item) in batch.into_iter().enumerate() {
            if pos > 0 && !self.config.delay_between_items.is_zero() {
                debug!(
                    delay_ms = self.config.delay_between_items.as_millis() as u64,
                    "waiting before next dispatch"
                );
                tokio::time::sleep(self.config.delay_between_items).await;
            }

            let id = item.id.clone();
            let permit = match Arc::clone(permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(id = %id, error = %e, "dispatch semaphore closed");
                    self.record(&id, Outcome::error(format!("not dispatched: {e}")));
                    continue;
                }
            };

            let followups = FollowUps::new(&id);
            let span = start_item_span(run_id, &id, batch_index);
            let task_handler = Arc::clone(handler);
            let task_followups = followups.clone();
            debug!(id = %id, "dispatching item");
            let handle = AbortOnDrop(tokio::spawn(
                async move {
                    let _permit = permit;
                    let started = Instant::now();
                    let outcome = match task_handler.handle(item, task_followups).await {
                        Ok(outcome) => outcome,
                        Err(e) => Outcome::error(format!("{e:#}")),
                    };
                    (outcome, started.elapsed())
                }
                .instrument(span.clone()),
            ));
            run_followups.0.push(followups.clone());

            in_flight.push(InFlight {
                id,
                followups,
                span,
                handle,
            });
        }

        let mut summary = RunSummary::default();
        for task in in_flight {
            let outcome = match task.handle.await {
                Ok((outcome, elapsed)) => {
                    metrics::item_duration_ms().record(
                        elapsed.as_secs_f64() * 1000.0,
                        &[KeyValue::new("status", outcome.status())],
                    );
                    outcome
                }
                Err(e) if e.is_panic() => Outcome::error("handler panicked"),
                Err(e) => Outcome::error(format!("handler task failed: {e}")),
            };

            if !outcome.is_success() {
                let cancelled = task.followups.cancel_all();
                if cancelled > 0 {
                    debug!(id = %task.id, cancelled, "abandoned item's follow-ups cancelled");
                }
            }

            record_outcome(&task.span, &outcome);
            summary.add(&outcome);
            self.record(&task.id, outcome);
        }

        metrics::batches_completed().add(1, &[]);
        info!(
            batch = batch_index,
            of = batch_count,
            success = summary.success,
            skipped = summary.skipped + summary.excluded,
            error = summary.error,
            manual = summary.manual_intervention,
            duration_ms = started.elapsed().as_millis() as u64,
            "batch settled"
        );
    }

    fn record(&self, id: &str, outcome: Outcome) {
        metrics::items_processed().add(1, &[KeyValue::new("status", outcome.status())]);
        match &outcome {
            Outcome::Error { error } => warn!(id, %error, "item failed"),
            Outcome::ManualInterventionRequired { reason } => {
                warn!(id, %reason, "item needs manual intervention")
            }
            other => info!(id, status = other.status(), "item settled"),
        }
        self.results.lock().insert(id.to_string(), outcome);
    }

    /// Sleep between batches. Returns false if a stop arrived meanwhile.
    async fn pause_between_batches(&self) -> bool {
        let delay = self.config.delay_between_batches;
        if delay.is_zero() {
            return !self.stop_requested();
        }
        info!(delay_ms = delay.as_millis() as u64, "waiting before next batch");
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.stop_requested(),
            _ = self.stopped() => false,
        }
    }

    async fn settle_followups(&self, followups: &[FollowUps], stopped: bool) {
        let pending: usize = followups.iter().map(FollowUps::pending).sum();
        if pending == 0 {
            return;
        }
        if stopped || !self.config.wait_for_followups {
            let cancelled: usize = followups.iter().map(FollowUps::cancel_all).sum();
            info!(cancelled, "pending follow-ups cancelled");
            return;
        }

        info!(pending, "waiting for follow-ups");
        let wait = async {
            for f in followups {
                f.wait_all().await;
            }
        };
        tokio::select! {
            _ = wait => debug!("follow-ups finished"),
            _ = self.stopped() => {
                let cancelled: usize = followups.iter().map(FollowUps::cancel_all).sum();
                warn!(cancelled, "stopped while waiting, follow-ups cancelled");
            }
        }
    }
}
