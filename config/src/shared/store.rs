use serde::{Deserialize, Serialize};

use crate::shared::{PgConnectionConfig, ValidationError};

/// Settings for the Postgres audience store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub connection: PgConnectionConfig,
    /// Pool size shared by all task workers of this process.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Seconds after which idle pooled connections are closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl StoreConfig {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

    pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.connection.tls.validate()?;

        if self.max_connections == 0 {
            return Err(ValidationError::field("store.max_connections", "must be > 0"));
        }

        Ok(())
    }
}

fn default_max_connections() -> u32 {
    StoreConfig::DEFAULT_MAX_CONNECTIONS
}

fn default_idle_timeout_secs() -> u64 {
    StoreConfig::DEFAULT_IDLE_TIMEOUT_SECS
}
