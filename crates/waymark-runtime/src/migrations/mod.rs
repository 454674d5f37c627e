mod func;
mod runner;
mod sql;
mod validate;

pub use func::{FnSource, FnUnit};
pub use runner::{MigrationStatus, Orchestrator, OrchestratorBuilder, RunReport};
pub use sql::{scan_dir, split_statements, SqlDirSource, SqlFile, SqlUnit, DEFAULT_SOURCE_DIR};
pub use validate::sort_and_validate;
