mod defaults;
mod excludes;
mod types;

pub use excludes::builtin_exclude_patterns;
pub use types::{
    BackupPolicy, CompressionSetting, DestinationConfig, DestinationKind, Frequency,
    RetryConfig, ScheduleConfig, ScratConfig, SourceConfig,
};

use std::path::Path;

use crate::error::{Result, ScratError};

/// Load the engine configuration from a JSON file.
pub fn load(path: &Path) -> Result<ScratConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ScratError::Validation(format!("cannot read config '{}': {e}", path.display()))
    })?;
    let config: ScratConfig = serde_json::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

/// Persist the engine configuration as pretty-printed JSON.
pub fn save(config: &ScratConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(config)?;
    std::fs::write(path, raw)?;
    Ok(())
}
