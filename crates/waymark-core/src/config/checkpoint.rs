use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Default name of the checkpoint table.
pub const DEFAULT_TABLE_NAME: &str = "schema_migrations";

/// Checkpoint storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Table holding the checkpoint row. May be schema-qualified.
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Hold a session advisory lock while migrating.
    #[serde(default = "default_advisory_lock")]
    pub advisory_lock: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
            advisory_lock: default_advisory_lock(),
        }
    }
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

fn default_advisory_lock() -> bool {
    true
}

/// Check that a table name is a plain or schema-qualified SQL identifier.
///
/// The name is interpolated into DDL and DML, so anything that is not an
/// identifier is rejected.
pub fn validate_table_name(name: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}(\.[A-Za-z_][A-Za-z0-9_]{0,62})?$")
        .map_err(|e| MigrateError::Config(format!("Invalid table name pattern: {}", e)))?;

    if re.is_match(name) {
        Ok(())
    } else {
        Err(MigrateError::Config(format!(
            "Invalid checkpoint table name: {:?}",
            name
        )))
    }
}
