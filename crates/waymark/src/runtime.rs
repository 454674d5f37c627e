//! Application-facing entry point.
//!
//! Wraps the orchestrator with configuration loading and Ctrl-C handling so an
//! application can migrate on startup with a few lines.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use waymark_core::config::WaymarkConfig;
use waymark_core::error::Result;
use waymark_core::unit::{Source, Unit};
use waymark_runtime::migrations::{MigrationStatus, Orchestrator, OrchestratorBuilder, RunReport};

/// Prelude module for common imports.
pub mod prelude {
    pub use tokio_util::sync::CancellationToken;

    pub use waymark_core::checkpoint::{Checkpoint, CheckpointStore};
    pub use waymark_core::config::WaymarkConfig;
    pub use waymark_core::error::{MigrateError, Result};
    pub use waymark_core::unit::{Source, Unit, UnitContext};
    pub use waymark_runtime::checkpoint::{MemoryCheckpointStore, PgCheckpointStore};
    pub use waymark_runtime::migrations::{
        FnSource, FnUnit, MigrationStatus, Orchestrator, RunReport, SqlDirSource,
    };

    pub use crate::{Waymark, WaymarkBuilder};
}

/// Configured migration stream for one PostgreSQL database.
pub struct Waymark {
    orchestrator: Orchestrator,
    /// Token for the next (or in-flight) run; replaced once that run ends.
    cancel: Mutex<CancellationToken>,
}

impl Waymark {
    /// Create a new builder.
    pub fn builder() -> WaymarkBuilder {
        WaymarkBuilder::new()
    }

    /// Wrap an already configured orchestrator.
    pub fn from_orchestrator(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Apply pending units. Ctrl-C stops the run between units.
    ///
    /// Cancellation only affects the run it was requested for; the next call
    /// starts with a fresh token.
    pub async fn migrate(&self) -> Result<RunReport> {
        let token = self.token().clone();

        let cancel = token.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal, stopping after current unit");
                cancel.cancel();
            }
        });

        let result = self.orchestrator.run(&token).await;
        watcher.abort();

        {
            let mut current = self.token();
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
        }

        match &result {
            Ok(report) if report.is_noop() => tracing::info!("Database is up to date"),
            Ok(report) => tracing::info!(
                "Migrated from version {} to {}",
                report.starting_version,
                report.final_version
            ),
            Err(e) => tracing::error!("Migration failed: {}", e),
        }
        result
    }

    /// Report the stored checkpoint and pending units.
    pub async fn status(&self) -> Result<MigrationStatus> {
        self.orchestrator.status().await
    }

    /// Token that stops the in-flight `migrate` (or the next one) between
    /// units.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token().clone()
    }

    fn token(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Underlying orchestrator.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

/// Builder for configuring a [`Waymark`].
pub struct WaymarkBuilder {
    config: WaymarkConfig,
    sources: Vec<Arc<dyn Source>>,
    units: Vec<Arc<dyn Unit>>,
    unit_timeout: Option<Duration>,
}

impl WaymarkBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: WaymarkConfig::default(),
            sources: Vec::new(),
            units: Vec::new(),
            unit_timeout: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: WaymarkConfig) -> Self {
        self.config = config;
        self.unit_timeout = None;
        self
    }

    /// Set the directory to load SQL units from.
    ///
    /// Defaults to `./migrations`. Files should be named like:
    /// - `0001_create_users.sql`
    /// - `0002_add_posts.sql`
    pub fn migrations_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.execution.migrations_dir = path.into();
        self
    }

    /// Override the checkpoint table name.
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.config.checkpoint.table_name = name.into();
        self
    }

    /// Fail units that run longer than `limit`.
    ///
    /// The exact duration is used; the config mirror rounds up to whole
    /// seconds.
    pub fn unit_timeout(mut self, limit: Duration) -> Self {
        let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
        self.config.execution.unit_timeout_secs = Some(secs.max(1));
        self.unit_timeout = Some(limit);
        self
    }

    /// Add another source next to the SQL directory.
    pub fn source(mut self, source: impl Source + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    /// Add a unit programmatically.
    pub fn unit(mut self, unit: impl Unit + 'static) -> Self {
        self.units.push(Arc::new(unit));
        self
    }

    /// Configuration the builder will use.
    pub fn current_config(&self) -> &WaymarkConfig {
        &self.config
    }

    /// Build against a connection pool.
    pub fn build(self, pool: PgPool) -> Result<Waymark> {
        let mut builder = OrchestratorBuilder::from_config(pool, &self.config)?
            .sources(self.sources)
            .units(self.units);
        if let Some(limit) = self.unit_timeout {
            builder = builder.unit_timeout(limit);
        }

        Ok(Waymark::from_orchestrator(builder.build()))
    }
}

impl Default for WaymarkBuilder {
    fn default() -> Self {
        Self::new()
    }
}
