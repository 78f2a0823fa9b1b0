//! Scheduler configuration.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Settings of the daily reconciliation dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// UTC time of day (`HH:MM`) at which all audiences are dispatched.
    ///
    /// Default: `01:00`
    #[serde(default = "default_run_at")]
    pub run_at: String,

    /// Dispatches once immediately after start-up, before the first scheduled run.
    ///
    /// Default: false
    #[serde(default)]
    pub run_on_start: bool,
}

impl SchedulerConfig {
    pub const DEFAULT_RUN_AT: &'static str = "01:00";

    /// Returns the parsed UTC time of day of the daily run.
    pub fn run_at_time(&self) -> Result<NaiveTime, ValidationError> {
        NaiveTime::parse_from_str(self.run_at.trim(), "%H:%M")
            .map_err(|_| ValidationError::InvalidRunAt(self.run_at.clone()))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.run_at_time().map(|_| ())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_at: Self::DEFAULT_RUN_AT.to_string(),
            run_on_start: false,
        }
    }
}

fn default_run_at() -> String {
    SchedulerConfig::DEFAULT_RUN_AT.to_string()
}
