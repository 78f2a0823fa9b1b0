//! Task worker configuration.

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Settings of the task workers consuming reconciliation tasks.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Number of task workers run by this process.
    ///
    /// Default: 4
    #[serde(default = "default_concurrency")]
    pub concurrency: u16,

    /// Minimum pause in milliseconds after a task was requeued.
    ///
    /// Default: 1000 (1 second)
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    /// Maximum pause in milliseconds after repeated requeues.
    ///
    /// Default: 60000 (60 seconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Jitter percentage applied to the backoff (0-100).
    ///
    /// Default: 25
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: u8,
}

impl WorkerConfig {
    pub const DEFAULT_CONCURRENCY: u16 = 4;

    pub const DEFAULT_MIN_BACKOFF_MS: u64 = 1_000;

    pub const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;

    pub const DEFAULT_JITTER_PERCENT: u8 = 25;

    /// Ensures `concurrency > 0`, `jitter_percent <= 100` and `min_backoff_ms <= max_backoff_ms`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.concurrency == 0 {
            return Err(ValidationError::field("worker.concurrency", "must be > 0"));
        }

        if self.jitter_percent > 100 {
            return Err(ValidationError::field(
                "worker.jitter_percent",
                "must be <= 100",
            ));
        }

        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(ValidationError::field(
                "worker.min_backoff_ms",
                "must be <= max_backoff_ms",
            ));
        }

        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: Self::DEFAULT_CONCURRENCY,
            min_backoff_ms: Self::DEFAULT_MIN_BACKOFF_MS,
            max_backoff_ms: Self::DEFAULT_MAX_BACKOFF_MS,
            jitter_percent: Self::DEFAULT_JITTER_PERCENT,
        }
    }
}

fn default_concurrency() -> u16 {
    WorkerConfig::DEFAULT_CONCURRENCY
}

fn default_min_backoff_ms() -> u64 {
    WorkerConfig::DEFAULT_MIN_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    WorkerConfig::DEFAULT_MAX_BACKOFF_MS
}

fn default_jitter_percent() -> u8 {
    WorkerConfig::DEFAULT_JITTER_PERCENT
}
