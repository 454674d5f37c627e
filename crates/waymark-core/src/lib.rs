pub mod checkpoint;
pub mod config;
pub mod error;
pub mod unit;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{CheckpointConfig, ExecutionConfig, WaymarkConfig};
pub use error::{MigrateError, Result};
pub use unit::{Source, Unit, UnitContext};
