mod checkpoint;
mod execution;

pub use checkpoint::{validate_table_name, CheckpointConfig, DEFAULT_TABLE_NAME};
pub use execution::ExecutionConfig;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{MigrateError, Result};

/// Root configuration for waymark.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WaymarkConfig {
    /// Checkpoint storage configuration.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Unit execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl WaymarkConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {:?}", path);
        let content = std::fs::read_to_string(path)
            .map_err(|e| MigrateError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let content = substitute_env_vars(content)?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| MigrateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.checkpoint.table_name)?;
        if self.execution.unit_timeout_secs == Some(0) {
            return Err(MigrateError::Config(
                "unit_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| MigrateError::Config(format!("Invalid substitution pattern: {}", e)))?;

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    Ok(result)
}
