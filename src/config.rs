use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the pending-operation journal.
    pub data_dir: PathBuf,
    pub sync_interval_ms: u64,
    pub probe_interval_ms: u64,
    /// Journal records written before the log is compacted.
    pub compact_after: usize,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            sync_interval_ms: 5_000,
            probe_interval_ms: 30_000,
            compact_after: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Reads a JSON config file. A missing file means defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&text).map_err(|err| Error::Config {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Spacing of retries after transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub factor: u32,
    pub max_delay_ms: u64,
    /// `None` keeps retrying forever. When set, an operation that reaches the
    /// cap is dropped and reported as failed.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            factor: 2,
            max_delay_ms: 60_000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Wait required after the given number of failed attempts.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(32);
        let multiplier = u64::from(self.factor.max(1)).saturating_pow(exponent);
        let delay = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}
