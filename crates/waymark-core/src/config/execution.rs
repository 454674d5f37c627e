use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Unit execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Directory scanned for `<index>_<name>.sql` files.
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,

    /// Per-unit timeout in seconds. No timeout when unset.
    #[serde(default)]
    pub unit_timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            migrations_dir: default_migrations_dir(),
            unit_timeout_secs: None,
        }
    }
}

impl ExecutionConfig {
    /// Per-unit timeout as a duration.
    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_secs.map(Duration::from_secs)
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("./migrations")
}
