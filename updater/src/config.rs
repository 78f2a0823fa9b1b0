use config::load_config;
use config::shared::UpdaterConfig;

use crate::error::{UpdaterError, UpdaterResult};

/// Loads and validates the updater configuration.
pub fn load_updater_config() -> UpdaterResult<UpdaterConfig> {
    let config = load_config::<UpdaterConfig>().map_err(UpdaterError::config)?;
    config.validate().map_err(UpdaterError::config)?;

    Ok(config)
}
