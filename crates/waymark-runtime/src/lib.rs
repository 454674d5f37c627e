pub mod checkpoint;
pub mod migrations;

pub use checkpoint::{MemoryCheckpointStore, PgCheckpointStore};
pub use migrations::{
    FnSource, FnUnit, MigrationStatus, Orchestrator, OrchestratorBuilder, RunReport, SqlDirSource,
    SqlUnit,
};
