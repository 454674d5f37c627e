use thiserror::Error;

/// Core error type for waymark operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Discovery error in {source_name}: {message}")]
    Discovery {
        source_name: String,
        message: String,
    },

    #[error("Duplicate unit index {index}")]
    DuplicateIndex { index: u32 },

    #[error("Index gap after {index}: next unit is {next}")]
    IndexGap { index: u32, next: u32 },

    #[error("Checkpoint is dirty at version {version}; manual intervention required")]
    Dirty { version: u32 },

    #[error("Checkpoint version {version} exceeds the {units} registered units")]
    StaleCheckpoint { version: u32, units: usize },

    #[error("Unit {index} failed: {source}")]
    Action {
        index: u32,
        #[source]
        source: Box<MigrateError>,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Run cancelled at version {version}")]
    Cancelled { version: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl MigrateError {
    /// Wrap a unit failure with the index it was applying.
    pub fn action(index: u32, source: MigrateError) -> Self {
        MigrateError::Action {
            index,
            source: Box::new(source),
        }
    }

    /// Build a discovery error for the named source.
    pub fn discovery(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Discovery {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Index of the failed unit, if this error came out of a unit action.
    pub fn failed_index(&self) -> Option<u32> {
        match self {
            MigrateError::Action { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Result type alias using MigrateError.
pub type Result<T> = std::result::Result<T, MigrateError>;
