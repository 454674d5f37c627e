//! waymark: ordered, resumable database migrations.
//!
//! Units come from sources (a directory of SQL files, in-process functions,
//! or anything implementing [`Source`]), are checked to form a dense `1..=N`
//! sequence, and are applied one at a time past a durable checkpoint. A failed
//! unit leaves the checkpoint dirty at its index and blocks later runs until an
//! operator resolves it.

mod runtime;

#[doc(hidden)]
pub use waymark_core;
#[doc(hidden)]
pub use waymark_runtime;

pub use waymark_core::checkpoint::{Checkpoint, CheckpointStore};
pub use waymark_core::config::WaymarkConfig;
pub use waymark_core::error::{MigrateError, Result};
pub use waymark_core::unit::{Source, Unit, UnitContext};
pub use waymark_runtime::checkpoint::{MemoryCheckpointStore, PgCheckpointStore};
pub use waymark_runtime::migrations::{
    FnSource, FnUnit, MigrationStatus, Orchestrator, OrchestratorBuilder, RunReport, SqlDirSource,
    SqlUnit,
};

pub use runtime::prelude;
pub use runtime::{Waymark, WaymarkBuilder};
