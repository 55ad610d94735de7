//! Typed configuration.
//!
//! Built from defaults, an optional TOML file, then environment variables,
//! in that order. The binary applies command-line flags last. The result
//! is passed explicitly to the runner and the checkpoint store.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::checkpoint::DEFAULT_CHECKPOINT_FILE;
use crate::error::{Error, Result};
use crate::model::BatchConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub batch: BatchConfig,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_file: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_file: DEFAULT_CHECKPOINT_FILE.to_string(),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// On-disk layout:
///
/// ```toml
/// [batch]
/// batch_size = 5
/// max_concurrent = 5
/// item_delay_ms = 5000
/// batch_delay_ms = 30000
/// wait_for_followups = true
///
/// [checkpoint]
/// dir = "checkpoints"
/// file = "checkpoint.json"
///
/// [telemetry]
/// otel_endpoint = "http://localhost:4317"
/// log_level = "info"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    batch: BatchSection,
    checkpoint: CheckpointSection,
    telemetry: TelemetrySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BatchSection {
    batch_size: Option<usize>,
    max_concurrent: Option<usize>,
    item_delay_ms: Option<u64>,
    batch_delay_ms: Option<u64>,
    wait_for_followups: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CheckpointSection {
    dir: Option<PathBuf>,
    file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TelemetrySection {
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Defaults overridden by environment variables, validated.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by a TOML file. Environment is not consulted.
    ///
    /// Batch bounds are not checked here, since later layers may still fix
    /// them. Call [`validate`](Self::validate) after the last override.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let file: FileConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))?;

        let mut config = Self::default();
        let batch = file.batch;
        apply_batch(
            &mut config.batch,
            batch.batch_size,
            batch.max_concurrent,
            batch.item_delay_ms,
            batch.batch_delay_ms,
        );
        if let Some(wait) = batch.wait_for_followups {
            config.batch.wait_for_followups = wait;
        }
        if let Some(dir) = file.checkpoint.dir {
            config.checkpoint_dir = dir;
        }
        if let Some(name) = file.checkpoint.file {
            config.checkpoint_file = name;
        }
        config.otel_endpoint = file.telemetry.otel_endpoint;
        if let Some(level) = file.telemetry.log_level {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Override fields from `BATCHRUN_*`, `OTEL_ENDPOINT`, and `LOG_LEVEL`.
    ///
    /// Fails only on unparseable values.
    pub fn apply_env(&mut self) -> Result<()> {
        apply_batch(
            &mut self.batch,
            parse_var("BATCHRUN_BATCH_SIZE")?,
            parse_var("BATCHRUN_MAX_CONCURRENT")?,
            parse_var("BATCHRUN_ITEM_DELAY_MS")?,
            parse_var("BATCHRUN_BATCH_DELAY_MS")?,
        );
        if let Ok(dir) = std::env::var("BATCHRUN_CHECKPOINT_DIR") {
            self.checkpoint_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var("BATCHRUN_CHECKPOINT_FILE") {
            self.checkpoint_file = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(endpoint);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Override batch settings, e.g. from command-line flags.
    pub fn override_batch(
        &mut self,
        batch_size: Option<usize>,
        max_concurrent: Option<usize>,
        item_delay_ms: Option<u64>,
        batch_delay_ms: Option<u64>,
    ) {
        apply_batch(
            &mut self.batch,
            batch_size,
            max_concurrent,
            item_delay_ms,
            batch_delay_ms,
        );
    }

    /// Check the merged settings.
    pub fn validate(&self) -> Result<()> {
        self.batch.validate()
    }
}

/// A new batch size resets `max_concurrent` to match unless one is given too.
fn apply_batch(
    batch: &mut BatchConfig,
    batch_size: Option<usize>,
    max_concurrent: Option<usize>,
    item_delay_ms: Option<u64>,
    batch_delay_ms: Option<u64>,
) {
    if let Some(size) = batch_size {
        *batch = batch.clone().with_batch_size(size);
    }
    if let Some(n) = max_concurrent {
        batch.max_concurrent = n;
    }
    if let Some(ms) = item_delay_ms {
        batch.delay_between_items = Duration::from_millis(ms);
    }
    if let Some(ms) = batch_delay_ms {
        batch.delay_between_batches = Duration::from_millis(ms);
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(None),
    }
}
