//! Deferred follow-up actions owned by a work item's processing context.
//!
//! A handler schedules follow-ups (e.g. a second prompt several minutes
//! after the first) through the [`FollowUps`] handle it receives. The task
//! handles stay in the shared list until the runner aborts them (item
//! abandoned, run stopped or dropped) or has seen them finish.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

struct Scheduled {
    name: String,
    done: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Scheduled {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Moved into every follow-up task. Marks it done and wakes waiters when the
/// task body ends, whether it returned, panicked or was aborted.
struct Settled {
    done: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Drop for Settled {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Cancellable deferred tasks scheduled on behalf of one work item.
///
/// Cloning shares the same task list.
#[derive(Clone)]
pub struct FollowUps {
    item_id: Arc<str>,
    tasks: Arc<Mutex<Vec<Scheduled>>>,
    settled: Arc<Notify>,
}

impl FollowUps {
    pub fn new(item_id: &str) -> Self {
        Self {
            item_id: Arc::from(item_id),
            tasks: Arc::new(Mutex::new(Vec::new())),
            settled: Arc::new(Notify::new()),
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    /// Run `task` after `delay`. Errors from the task are logged, never raised.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, name: impl Into<String>, delay: Duration, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let span = tracing::info_span!(
            "item.followup",
            "item.id" = %self.item_id,
            followup = %name
        );
        let done = Arc::new(AtomicBool::new(false));
        let settled = Settled {
            done: Arc::clone(&done),
            notify: Arc::clone(&self.settled),
        };
        let task_name = name.clone();
        let handle = tokio::spawn(
            async move {
                let _settled = settled;
                tokio::time::sleep(delay).await;
                match task.await {
                    Ok(()) => info!(followup = %task_name, "follow-up completed"),
                    Err(e) => warn!(followup = %task_name, error = %e, "follow-up failed"),
                }
            }
            .instrument(span),
        );
        debug!(
            item = %self.item_id,
            followup = %name,
            delay_ms = delay.as_millis() as u64,
            "follow-up scheduled"
        );
        self.tasks.lock().push(Scheduled { name, done, handle });
    }

    /// Number of follow-ups that have not finished yet.
    pub fn pending(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_done()).count()
    }

    /// Abort every unfinished follow-up. Returns how many were aborted.
    pub fn cancel_all(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut cancelled = 0;
        for task in tasks {
            if !task.is_done() {
                task.handle.abort();
                cancelled += 1;
                debug!(item = %self.item_id, followup = %task.name, "follow-up cancelled");
            }
        }
        cancelled
    }

    /// Wait for every scheduled follow-up to finish, including ones scheduled
    /// while waiting.
    ///
    /// Unfinished tasks stay in the list, so dropping this future leaves them
    /// reachable by [`cancel_all`](Self::cancel_all).
    pub async fn wait_all(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            for task in self.take_done() {
                if let Err(e) = task.handle.await {
                    if e.is_panic() {
                        warn!(item = %self.item_id, followup = %task.name, "follow-up panicked");
                    }
                }
            }
            if self.tasks.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn take_done(&self) -> Vec<Scheduled> {
        let mut tasks = self.tasks.lock();
        let (done, pending) = std::mem::take(&mut *tasks)
            .into_iter()
            .partition(Scheduled::is_done);
        *tasks = pending;
        done
    }
}

impl std::fmt::Debug for FollowUps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowUps")
            .field("item_id", &self.item_id)
            .field("scheduled", &self.tasks.lock().len())
            .finish()
    }
}
