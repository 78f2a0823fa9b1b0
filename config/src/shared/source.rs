//! Analytical source configuration.

use serde::{Deserialize, Serialize};

use crate::shared::{MySqlConnectionConfig, ValidationError};

/// Settings for the read-only MySQL analytical source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub connection: MySqlConnectionConfig,

    /// Maximum duration of a single candidate query in milliseconds.
    ///
    /// Default: 30000 (30 seconds)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Largest exclusion set pushed into the query as bound parameters. Larger sets are
    /// filtered after the query returns.
    ///
    /// Default: 10000
    #[serde(default = "default_max_pushed_exclusions")]
    pub max_pushed_exclusions: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Number of connection attempts made at start-up before giving up.
    ///
    /// Default: 5
    #[serde(default = "default_connect_max_retries")]
    pub connect_max_retries: u32,

    /// Delay between start-up connection attempts in milliseconds.
    ///
    /// Default: 2000
    #[serde(default = "default_connect_retry_interval_ms")]
    pub connect_retry_interval_ms: u64,
}

impl SourceConfig {
    pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;

    pub const DEFAULT_MAX_PUSHED_EXCLUSIONS: usize = 10_000;

    /// Upper bound of `max_pushed_exclusions`.
    ///
    /// MySQL accepts at most 65,535 placeholders per statement, the remainder is left for the
    /// date range, statuses and reasons of the filter.
    pub const MAX_PUSHED_EXCLUSIONS_LIMIT: usize = 60_000;

    pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

    pub const DEFAULT_CONNECT_MAX_RETRIES: u32 = 5;

    pub const DEFAULT_CONNECT_RETRY_INTERVAL_MS: u64 = 2_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.connection.tls.validate()?;

        if self.query_timeout_ms == 0 {
            return Err(ValidationError::field(
                "source.query_timeout_ms",
                "must be > 0",
            ));
        }

        if self.max_pushed_exclusions == 0
            || self.max_pushed_exclusions > Self::MAX_PUSHED_EXCLUSIONS_LIMIT
        {
            return Err(ValidationError::field(
                "source.max_pushed_exclusions",
                "must be > 0 and <= 60000",
            ));
        }

        if self.max_connections == 0 {
            return Err(ValidationError::field(
                "source.max_connections",
                "must be > 0",
            ));
        }

        if self.connect_max_retries == 0 {
            return Err(ValidationError::field(
                "source.connect_max_retries",
                "must be > 0",
            ));
        }

        Ok(())
    }
}

fn default_query_timeout_ms() -> u64 {
    SourceConfig::DEFAULT_QUERY_TIMEOUT_MS
}

fn default_max_pushed_exclusions() -> usize {
    SourceConfig::DEFAULT_MAX_PUSHED_EXCLUSIONS
}

fn default_max_connections() -> u32 {
    SourceConfig::DEFAULT_MAX_CONNECTIONS
}

fn default_connect_max_retries() -> u32 {
    SourceConfig::DEFAULT_CONNECT_MAX_RETRIES
}

fn default_connect_retry_interval_ms() -> u64 {
    SourceConfig::DEFAULT_CONNECT_RETRY_INTERVAL_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_config() -> SourceConfig {
        serde_json::from_str(
            r#"{
                "connection": {
                    "host": "localhost", "port": 3306, "name": "crm",
                    "username": "reader", "password": null,
                    "tls": { "trusted_root_certs": "", "enabled": false }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn pushed_exclusions_stay_below_placeholder_limit() {
        let mut config = source_config();
        assert!(config.validate().is_ok());

        config.max_pushed_exclusions = SourceConfig::MAX_PUSHED_EXCLUSIONS_LIMIT;
        assert!(config.validate().is_ok());

        config.max_pushed_exclusions = 65_000;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue { field, .. }) if field == "source.max_pushed_exclusions"
        ));

        config.max_pushed_exclusions = 0;
        assert!(config.validate().is_err());
    }
}
