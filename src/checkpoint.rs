//! Durable record of completed work item ids.
//!
//! The store is a JSON file rewritten on every mutation. Loading never
//! fails: a missing, unreadable, or corrupt file means nothing is done yet.
//! Writing is best effort; a failed write is logged and the in-memory set
//! stays authoritative for the rest of the process.

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Default checkpoint file name inside the checkpoint directory.
pub const DEFAULT_CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointSnapshot<'a> {
    processed_items: Vec<&'a str>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCheckpoint {
    processed_items: Vec<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Set of work item ids that have durably completed.
///
/// Shared between concurrently running handlers through an `Arc`; all
/// methods take `&self`.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    processed: Mutex<BTreeSet<String>>,
}

impl CheckpointStore {
    /// Open the store at `dir/file_name`, loading whatever is there.
    pub fn open(dir: impl AsRef<Path>, file_name: &str) -> Self {
        let dir = dir.as_ref();
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "cannot create checkpoint directory");
        }
        let path = dir.join(file_name);
        let processed = load(&path);
        Self {
            path,
            processed: Mutex::new(processed),
        }
    }

    /// Open `dir/checkpoint.json`.
    pub fn open_default(dir: impl AsRef<Path>) -> Self {
        Self::open(dir, DEFAULT_CHECKPOINT_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.processed.lock().contains(id)
    }

    /// Record `id` as done and flush before returning.
    pub fn mark_processed(&self, id: &str) {
        let mut processed = self.processed.lock();
        processed.insert(id.to_string());
        self.persist_logged(&processed);
    }

    /// Forget `id` so the next run retries it. Idempotent.
    pub fn mark_failed(&self, id: &str) {
        let mut processed = self.processed.lock();
        processed.remove(id);
        self.persist_logged(&processed);
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().len()
    }

    /// All processed ids, sorted.
    pub fn processed_ids(&self) -> Vec<String> {
        self.processed.lock().iter().cloned().collect()
    }

    /// Drop every id and flush the empty set.
    pub fn clear(&self) {
        let mut processed = self.processed.lock();
        processed.clear();
        self.persist_logged(&processed);
    }

    /// Write the current set, surfacing any I/O error.
    pub fn flush(&self) -> Result<()> {
        let processed = self.processed.lock();
        self.persist(&processed)
    }

    fn persist_logged(&self, processed: &BTreeSet<String>) {
        match self.persist(processed) {
            Ok(()) => {
                metrics::checkpoint_writes()
                    .add(1, &[opentelemetry::KeyValue::new("result", "ok")]);
                debug!(count = processed.len(), path = %self.path.display(), "checkpoint saved");
            }
            Err(e) => {
                metrics::checkpoint_writes()
                    .add(1, &[opentelemetry::KeyValue::new("result", "error")]);
                warn!(path = %self.path.display(), error = %e, "checkpoint write failed");
            }
        }
    }

    /// Write to a sibling temp file, sync it, then rename over the target.
    fn persist(&self, processed: &BTreeSet<String>) -> Result<()> {
        let snapshot = CheckpointSnapshot {
            processed_items: processed.iter().map(String::as_str).collect(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| Error::Checkpoint(format!("write {}: {e}", self.path.display())))
    }
}

fn load(path: &Path) -> BTreeSet<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no checkpoint found, starting fresh");
            return BTreeSet::new();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read checkpoint, starting fresh");
            return BTreeSet::new();
        }
    };

    match serde_json::from_str::<StoredCheckpoint>(&content) {
        Ok(stored) => {
            let processed: BTreeSet<String> = stored.processed_items.into_iter().collect();
            info!(
                path = %path.display(),
                count = processed.len(),
                saved_at = ?stored.timestamp,
                "loaded checkpoint"
            );
            processed
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt checkpoint, starting fresh");
            BTreeSet::new()
        }
    }
}
