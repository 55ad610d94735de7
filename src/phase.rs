//! What happens after a run: an append-only log of every settled item, and
//! a downstream phase fed only with the items that succeeded.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::WorkItem;
use crate::runner::{Handler, RunResults, TaskRunner};

/// One line of the results log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub timestamp: DateTime<Utc>,
    /// Which phase produced the outcome, e.g. "run" or "downstream".
    pub phase: String,
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// JSON-lines file that every run appends to. Earlier lines are never
/// rewritten, so the file doubles as a history across restarts.
#[derive(Debug, Clone)]
pub struct ResultsLog {
    path: PathBuf,
}

impl ResultsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record per outcome, ordered by id. Returns how many
    /// records were written.
    pub fn append(&self, phase: &str, results: &RunResults) -> Result<usize> {
        let timestamp = Utc::now();
        let mut rows: Vec<_> = results.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));

        let mut buf = String::new();
        for (id, outcome) in &rows {
            let record = ResultRecord {
                timestamp,
                phase: phase.to_string(),
                id: id.to_string(),
                status: outcome.status().to_string(),
                error: outcome.detail().map(str::to_string),
            };
            buf.push_str(&serde_json::to_string(&record)?);
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        debug!(path = %self.path.display(), phase, records = rows.len(), "results logged");
        Ok(rows.len())
    }

    /// Every record written so far. Unparseable lines are skipped.
    pub fn read(&self) -> Result<Vec<ResultRecord>> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "skipping bad results line");
                    None
                }
            })
            .collect())
    }
}

/// Items whose outcome in `results` is `Success`, in input order.
pub fn successful_items(items: &[WorkItem], results: &RunResults) -> Vec<WorkItem> {
    items
        .iter()
        .filter(|item| results.get(&item.id).is_some_and(|o| o.is_success()))
        .cloned()
        .collect()
}

impl TaskRunner {
    /// Run `handler` over the items that succeeded upstream, after `delay`.
    ///
    /// Returns `None` without dispatching anything if nothing succeeded or a
    /// stop was requested before or during the delay.
    pub async fn run_downstream<H: Handler>(
        &self,
        items: &[WorkItem],
        upstream: &RunResults,
        delay: Duration,
        handler: H,
    ) -> Option<RunResults> {
        let successful = successful_items(items, upstream);
        if successful.is_empty() {
            info!("no successful items, downstream phase skipped");
            return None;
        }
        if self.stop_requested() {
            warn!("stop requested, downstream phase skipped");
            return None;
        }
        if !delay.is_zero() {
            info!(
                delay_ms = delay.as_millis() as u64,
                items = successful.len(),
                "waiting before downstream phase"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stopped() => {
                    warn!("stopped during the wait, downstream phase skipped");
                    return None;
                }
            }
        }

        info!(items = successful.len(), "starting downstream phase");
        Some(self.run(successful, handler).await)
    }
}
