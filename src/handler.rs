//! Reusable handlers for the orchestrator side of the runner.
//!
//! [`CheckpointHandler`] applies the skip/exclude/mark convention around any
//! inner handler. [`CommandHandler`] delegates each item to an external
//! program, which is where site-specific automation lives.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::checkpoint::CheckpointStore;
use crate::followup::FollowUps;
use crate::model::{Outcome, WorkItem};
use crate::runner::Handler;

// ---------------------------------------------------------------------------
// Checkpoint wrapper
// ---------------------------------------------------------------------------

/// Skips checkpointed items, skips excluded ids, and keeps the store in step
/// with the inner handler's results.
///
/// After an item settles the store holds its id iff the outcome was
/// `Success`. `Err`, `Error`, and `ManualInterventionRequired` remove it.
pub struct CheckpointHandler<H> {
    inner: H,
    store: Arc<CheckpointStore>,
    excluded: HashSet<String>,
}

impl<H> CheckpointHandler<H> {
    pub fn new(inner: H, store: Arc<CheckpointStore>) -> Self {
        Self {
            inner,
            store,
            excluded: HashSet::new(),
        }
    }

    /// Ids to report as `Excluded` without running the inner handler.
    pub fn exclude<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }
}

impl<H: Handler> Handler for CheckpointHandler<H> {
    fn handle(
        &self,
        item: WorkItem,
        followups: FollowUps,
    ) -> impl Future<Output = anyhow::Result<Outcome>> + Send {
        async move {
            if self.store.is_processed(&item.id) {
                info!(id = %item.id, "skipping already processed item");
                return Ok(Outcome::Skipped);
            }
            if self.excluded.contains(&item.id) {
                info!(id = %item.id, "skipping excluded item");
                return Ok(Outcome::Excluded);
            }

            let id = item.id.clone();
            match self.inner.handle(item, followups).await {
                Ok(Outcome::Success) => {
                    self.store.mark_processed(&id);
                    Ok(Outcome::Success)
                }
                Ok(
                    outcome @ (Outcome::Error { .. } | Outcome::ManualInterventionRequired { .. }),
                ) => {
                    self.store.mark_failed(&id);
                    Ok(outcome)
                }
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    self.store.mark_failed(&id);
                    Err(e)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// External command
// ---------------------------------------------------------------------------

/// Exit code a command uses to ask for a human (`EX_TEMPFAIL`).
pub const MANUAL_INTERVENTION_EXIT_CODE: i32 = 75;

/// Longest stderr excerpt carried into an outcome message.
const STDERR_TAIL_BYTES: usize = 2048;

/// Runs an external program once per item.
///
/// The program gets `BATCHRUN_ITEM_ID` and `BATCHRUN_ITEM` (the item as
/// JSON) in its environment. Exit 0 is `Success`, exit 75 is
/// `ManualInterventionRequired`, anything else is `Error`.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandHandler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Kill the program and report an error if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn execute(&self, item: &WorkItem) -> anyhow::Result<Outcome> {
        let payload = serde_json::to_string(item)?;

        debug!(
            id = %item.id,
            program = %self.program.display(),
            "running item command"
        );

        let child = Command::new(&self.program)
            .args(&self.args)
            .env("BATCHRUN_ITEM_ID", &item.id)
            .env("BATCHRUN_ITEM", payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("cannot start {}: {e}", self.program.display()))?;

        let output = match self.timeout {
            // Dropping the wait future drops the child, which kills it.
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    return Ok(Outcome::error(format!(
                        "timed out after {}s",
                        limit.as_secs_f64()
                    )));
                }
            },
            None => child.wait_with_output().await?,
        };

        if !output.stdout.is_empty() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            debug!(id = %item.id, stdout = %stdout.trim(), "command output");
        }

        let stderr = stderr_tail(&output.stderr);
        Ok(match output.status.code() {
            Some(0) => Outcome::Success,
            Some(MANUAL_INTERVENTION_EXIT_CODE) if stderr.is_empty() => {
                Outcome::manual_intervention("command requested manual intervention")
            }
            Some(MANUAL_INTERVENTION_EXIT_CODE) => Outcome::manual_intervention(stderr),
            Some(code) if stderr.is_empty() => Outcome::error(format!("exited with status {code}")),
            Some(code) => Outcome::error(format!("exited with status {code}: {stderr}")),
            None => Outcome::error("terminated by signal"),
        })
    }
}

impl Handler for CommandHandler {
    fn handle(
        &self,
        item: WorkItem,
        _followups: FollowUps,
    ) -> impl Future<Output = anyhow::Result<Outcome>> + Send {
        async move { self.execute(&item).await }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
