//! Migration orchestrator.
//!
//! Collects units from every registered source, checks that their indices form
//! `1..=N`, and applies the ones past the stored checkpoint one at a time,
//! recording progress after each unit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waymark_core::checkpoint::{Checkpoint, CheckpointStore};
use waymark_core::config::WaymarkConfig;
use waymark_core::error::{MigrateError, Result};
use waymark_core::unit::{Source, Unit, UnitContext};

use super::sql::SqlDirSource;
use super::validate::sort_and_validate;
use crate::checkpoint::PgCheckpointStore;

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunReport {
    /// Checkpoint version when the run started.
    pub starting_version: u32,
    /// Checkpoint version when the run finished.
    pub final_version: u32,
    /// Indices applied by this run, in order.
    pub applied: Vec<u32>,
}

impl RunReport {
    /// True when nothing was pending.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Snapshot of where a migration stream stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Stored checkpoint, `None` before the first run.
    pub checkpoint: Option<Checkpoint>,
    /// Number of registered units.
    pub total_units: usize,
    /// Indices not yet applied.
    pub pending: Vec<u32>,
}

impl MigrationStatus {
    /// The stream is blocked on operator intervention.
    pub fn is_dirty(&self) -> bool {
        self.checkpoint.map(|c| c.dirty).unwrap_or(false)
    }
}

#[derive(Default)]
struct Registry {
    sources: Vec<Arc<dyn Source>>,
    units: Vec<Arc<dyn Unit>>,
}

/// Applies migration units in index order against a checkpoint store.
///
/// `run`, `status`, `add_sources` and `add_units` are serialized by one lock,
/// so a run always sees a stable set of units and finishes before the next
/// one starts.
pub struct Orchestrator {
    store: Arc<dyn CheckpointStore>,
    unit_timeout: Option<Duration>,
    registry: Mutex<Registry>,
}

impl Orchestrator {
    /// Create a builder around a checkpoint store.
    pub fn builder(store: impl CheckpointStore + 'static) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store)
    }

    /// Orchestrator backed by PostgreSQL, reading SQL files from the
    /// configured migrations directory.
    pub fn from_config(pool: PgPool, config: &WaymarkConfig) -> Result<Self> {
        Ok(OrchestratorBuilder::from_config(pool, config)?.build())
    }

    /// Register more sources.
    pub async fn add_sources(&self, sources: impl IntoIterator<Item = Arc<dyn Source>>) {
        self.registry.lock().await.sources.extend(sources);
    }

    /// Register units directly, bypassing discovery.
    pub async fn add_units(&self, units: impl IntoIterator<Item = Arc<dyn Unit>>) {
        self.registry.lock().await.units.extend(units);
    }

    /// Apply every pending unit.
    ///
    /// Stops at the first failing unit, leaving the checkpoint dirty at its
    /// index. Cancelling `cancel` between units stops the run cleanly; units
    /// already in flight see the cancellation through their context.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let registry = self.registry.lock().await;

        let mut units = collect(&registry).await?;
        sort_and_validate(&mut units)?;
        debug!("Collected {} units from {} sources", units.len(), registry.sources.len());

        self.store.lock().await?;

        let result = self.run_locked(&units, cancel).await;

        // Always release lock, even on error
        if let Err(e) = self.store.unlock().await {
            warn!("Failed to release migration lock: {}", e);
        }

        result
    }

    /// Report the stored checkpoint and pending units without applying anything.
    pub async fn status(&self) -> Result<MigrationStatus> {
        let registry = self.registry.lock().await;

        let mut units = collect(&registry).await?;
        sort_and_validate(&mut units)?;

        let checkpoint = self.store.current().await?;
        let version = checkpoint.map(|c| c.version).unwrap_or(0);
        let pending = units
            .iter()
            .map(|u| u.index())
            .filter(|&index| index > version)
            .collect();

        Ok(MigrationStatus {
            checkpoint,
            total_units: units.len(),
            pending,
        })
    }

    async fn run_locked(
        &self,
        units: &[Arc<dyn Unit>],
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        self.store.ensure_schema().await?;
        let checkpoint = self.store.load_or_init().await?;
        debug!("Loaded checkpoint: {}", checkpoint);

        let start = checkpoint.version as usize;
        if start > units.len() {
            return Err(MigrateError::StaleCheckpoint {
                version: checkpoint.version,
                units: units.len(),
            });
        }

        let mut report = RunReport {
            starting_version: checkpoint.version,
            final_version: checkpoint.version,
            applied: Vec::new(),
        };

        for unit in &units[start..] {
            if cancel.is_cancelled() {
                info!("Run cancelled at version {}", report.final_version);
                return Err(MigrateError::Cancelled {
                    version: report.final_version,
                });
            }

            let index = unit.index();
            let label = unit.name().unwrap_or("unnamed");
            info!("Applying unit {} ({})", index, label);

            let started = Instant::now();
            let ctx = UnitContext::new(index, report.final_version, cancel.child_token());

            if let Err(e) = self.execute_unit(unit.as_ref(), ctx).await {
                warn!("Unit {} ({}) failed: {}", index, label, e);
                if let Err(mark_err) = self.store.mark_dirty(index).await {
                    return Err(MigrateError::Persistence(format!(
                        "Failed to mark unit {} dirty after failure '{}': {}",
                        index, e, mark_err
                    )));
                }
                return Err(MigrateError::action(index, e));
            }

            if let Err(e) = self.store.advance(index).await {
                error!("Unit {} committed but checkpoint was not advanced: {}", index, e);
                return Err(e);
            }
            report.final_version = index;
            report.applied.push(index);
            info!(
                "Unit {} applied in {}ms",
                index,
                started.elapsed().as_millis()
            );
        }

        if report.is_noop() {
            debug!("No pending units at version {}", report.final_version);
        }
        Ok(report)
    }

    async fn execute_unit(&self, unit: &dyn Unit, ctx: UnitContext) -> Result<()> {
        let Some(limit) = self.unit_timeout else {
            return unit.execute(ctx).await;
        };

        let token = ctx.token().clone();
        match tokio::time::timeout(limit, unit.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(MigrateError::Timeout(format!(
                    "unit {} exceeded {:?}",
                    unit.index(),
                    limit
                )))
            }
        }
    }
}

/// Directly registered units followed by every source's units.
async fn collect(registry: &Registry) -> Result<Vec<Arc<dyn Unit>>> {
    let mut units = registry.units.clone();

    for source in &registry.sources {
        let listed = source.list_units().await.map_err(|e| match e {
            MigrateError::Discovery { .. } => e,
            other => MigrateError::discovery(source.name(), other.to_string()),
        })?;
        debug!("Source {} listed {} units", source.name(), listed.len());
        units.extend(listed);
    }

    Ok(units)
}

/// Builder for an [`Orchestrator`].
pub struct OrchestratorBuilder {
    store: Arc<dyn CheckpointStore>,
    sources: Vec<Arc<dyn Source>>,
    units: Vec<Arc<dyn Unit>>,
    unit_timeout: Option<Duration>,
}

impl OrchestratorBuilder {
    /// Create a new builder.
    pub fn new(store: impl CheckpointStore + 'static) -> Self {
        Self::with_store(Arc::new(store))
    }

    /// Builder preloaded from configuration: PostgreSQL checkpoint store plus
    /// the SQL directory source.
    pub fn from_config(pool: PgPool, config: &WaymarkConfig) -> Result<Self> {
        config.validate()?;
        let store = PgCheckpointStore::from_config(pool.clone(), &config.checkpoint)?;
        let mut builder = Self::new(store).source(SqlDirSource::new(
            pool,
            config.execution.migrations_dir.clone(),
        ));
        if let Some(limit) = config.execution.unit_timeout() {
            builder = builder.unit_timeout(limit);
        }
        Ok(builder)
    }

    /// Create a builder around a shared store.
    pub fn with_store(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            sources: Vec::new(),
            units: Vec::new(),
            unit_timeout: None,
        }
    }

    /// Register a source.
    pub fn source(mut self, source: impl Source + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    /// Register several shared sources.
    pub fn sources(mut self, sources: impl IntoIterator<Item = Arc<dyn Source>>) -> Self {
        self.sources.extend(sources);
        self
    }

    /// Register a unit directly.
    pub fn unit(mut self, unit: impl Unit + 'static) -> Self {
        self.units.push(Arc::new(unit));
        self
    }

    /// Register several shared units.
    pub fn units(mut self, units: impl IntoIterator<Item = Arc<dyn Unit>>) -> Self {
        self.units.extend(units);
        self
    }

    /// Fail any unit that runs longer than `limit`.
    pub fn unit_timeout(mut self, limit: Duration) -> Self {
        self.unit_timeout = Some(limit);
        self
    }

    /// Build the orchestrator.
    pub fn build(self) -> Orchestrator {
        Orchestrator {
            store: self.store,
            unit_timeout: self.unit_timeout,
            registry: Mutex::new(Registry {
                sources: self.sources,
                units: self.units,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::migrations::{FnSource, FnUnit};
    use std::future::Future;
    use std::pin::Pin;

    type Log = Arc<std::sync::Mutex<Vec<u32>>>;

    fn new_log() -> Log {
        Arc::new(std::sync::Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<u32> {
        log.lock().unwrap().clone()
    }

    fn ok_unit(index: u32, log: &Log) -> FnUnit {
        let log = log.clone();
        FnUnit::new(index, move |ctx| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(ctx.index);
                Ok(())
            }
        })
    }

    fn failing_unit(index: u32, log: &Log) -> FnUnit {
        let log = log.clone();
        FnUnit::new(index, move |ctx| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(ctx.index);
                Err(MigrateError::Execution("constraint violated".to_string()))
            }
        })
    }

    fn orchestrator(store: &MemoryCheckpointStore) -> OrchestratorBuilder {
        Orchestrator::builder(store.clone())
    }

    #[tokio::test]
    async fn test_applies_in_index_order_across_sources() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();

        let orch = orchestrator(&store)
            .source(FnSource::new(vec![ok_unit(5, &log), ok_unit(2, &log)]))
            .source(FnSource::new(vec![ok_unit(3, &log)]))
            .source(FnSource::new(vec![ok_unit(4, &log), ok_unit(1, &log)]))
            .build();

        let report = orch.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(entries(&log), vec![1, 2, 3, 4, 5]);
        assert_eq!(report.applied, vec![1, 2, 3, 4, 5]);
        assert_eq!(report.starting_version, 0);
        assert_eq!(report.final_version, 5);
        assert_eq!(store.snapshot(), Some(Checkpoint::clean(5)));
    }

    #[tokio::test]
    async fn test_duplicate_index_runs_nothing() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();

        let orch = orchestrator(&store)
            .source(FnSource::new(vec![ok_unit(1, &log), ok_unit(3, &log)]))
            .source(FnSource::new(vec![ok_unit(2, &log), ok_unit(3, &log)]))
            .build();

        let err = orch.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateIndex { index: 3 }));
        assert!(entries(&log).is_empty());
        assert!(!store.schema_ready());
    }

    #[tokio::test]
    async fn test_index_gap_runs_nothing() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();

        let orch = orchestrator(&store)
            .unit(ok_unit(1, &log))
            .unit(ok_unit(2, &log))
            .unit(ok_unit(4, &log))
            .build();

        let err = orch.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MigrateError::IndexGap { index: 2, next: 4 }));
        assert!(entries(&log).is_empty());
        assert_eq!(store.snapshot(), None);
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();

        let orch = orchestrator(&store)
            .source(FnSource::new(vec![ok_unit(1, &log), ok_unit(2, &log)]))
            .build();
        let token = CancellationToken::new();

        orch.run(&token).await.unwrap();
        let report = orch.run(&token).await.unwrap();

        assert!(report.is_noop());
        assert_eq!(report.final_version, 2);
        assert_eq!(entries(&log), vec![1, 2]);
        assert_eq!(store.snapshot(), Some(Checkpoint::clean(2)));
    }

    #[tokio::test]
    async fn test_failure_marks_dirty_and_stops() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();

        let orch = orchestrator(&store)
            .source(FnSource::new(vec![
                ok_unit(1, &log),
                failing_unit(2, &log),
                ok_unit(3, &log),
            ]))
            .build();
        let token = CancellationToken::new();

        let err = orch.run(&token).await.unwrap_err();
        assert_eq!(err.failed_index(), Some(2));
        assert!(err.to_string().contains("constraint violated"));
        assert_eq!(entries(&log), vec![1, 2]);
        assert_eq!(store.snapshot(), Some(Checkpoint::dirty(2)));

        // Blocked until an operator clears the flag.
        let err = orch.run(&token).await.unwrap_err();
        assert!(matches!(err, MigrateError::Dirty { version: 2 }));
        assert_eq!(entries(&log), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_resumes_after_operator_clears_dirty() {
        let store = MemoryCheckpointStore::with_checkpoint(Checkpoint::dirty(2));
        let log = new_log();

        let orch = orchestrator(&store)
            .source(FnSource::new(vec![
                ok_unit(1, &log),
                ok_unit(2, &log),
                ok_unit(3, &log),
            ]))
            .build();
        let token = CancellationToken::new();

        assert!(orch.run(&token).await.is_err());

        // Operator repaired unit 2 by hand.
        store.set(Checkpoint::clean(2));
        let report = orch.run(&token).await.unwrap();
        assert_eq!(report.applied, vec![3]);
        assert_eq!(entries(&log), vec![3]);
    }

    #[tokio::test]
    async fn test_first_run_with_no_units_initializes_checkpoint() {
        let store = MemoryCheckpointStore::new();
        let orch = orchestrator(&store).build();

        let report = orch.run(&CancellationToken::new()).await.unwrap();
        assert!(report.is_noop());
        assert!(store.schema_ready());
        assert_eq!(store.snapshot(), Some(Checkpoint::initial()));
    }

    #[tokio::test]
    async fn test_stale_checkpoint() {
        let store = MemoryCheckpointStore::with_checkpoint(Checkpoint::clean(5));
        let log = new_log();

        let orch = orchestrator(&store)
            .unit(ok_unit(1, &log))
            .unit(ok_unit(2, &log))
            .unit(ok_unit(3, &log))
            .build();

        let err = orch.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            MigrateError::StaleCheckpoint {
                version: 5,
                units: 3
            }
        ));
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn test_resumes_from_checkpoint() {
        let store = MemoryCheckpointStore::with_checkpoint(Checkpoint::clean(2));
        let log = new_log();

        let orch = orchestrator(&store)
            .source(FnSource::new((1..=4).map(|i| ok_unit(i, &log))))
            .build();

        let report = orch.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.starting_version, 2);
        assert_eq!(report.applied, vec![3, 4]);
        assert_eq!(entries(&log), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_sources_are_requeried_without_accumulating() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();

        let orch = orchestrator(&store)
            .source(FnSource::new(vec![ok_unit(1, &log)]))
            .build();
        let token = CancellationToken::new();

        orch.run(&token).await.unwrap();
        orch.add_sources(vec![
            Arc::new(FnSource::new(vec![ok_unit(2, &log)])) as Arc<dyn Source>
        ])
        .await;
        orch.add_units(vec![Arc::new(ok_unit(3, &log)) as Arc<dyn Unit>])
            .await;

        let report = orch.run(&token).await.unwrap();
        assert_eq!(report.applied, vec![2, 3]);
        assert_eq!(entries(&log), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_concurrent_runs_apply_each_unit_once() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();

        let slow = {
            let log = log.clone();
            FnUnit::new(1, move |ctx| {
                let log = log.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    log.lock().unwrap().push(ctx.index);
                    Ok(())
                }
            })
        };
        let orch = Arc::new(
            orchestrator(&store)
                .unit(slow)
                .unit(ok_unit(2, &log))
                .build(),
        );

        let token = CancellationToken::new();
        let (a, b) = tokio::join!(orch.run(&token), orch.run(&token));
        let mut applied = a.unwrap().applied;
        applied.extend(b.unwrap().applied);

        assert_eq!(applied, vec![1, 2]);
        assert_eq!(entries(&log), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();
        let orch = orchestrator(&store).unit(ok_unit(1, &log)).build();

        let token = CancellationToken::new();
        token.cancel();

        let err = orch.run(&token).await.unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled { version: 0 }));
        assert!(entries(&log).is_empty());
        assert_eq!(store.snapshot(), Some(Checkpoint::initial()));
    }

    #[tokio::test]
    async fn test_unit_ignoring_cancellation_is_recorded() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();
        let token = CancellationToken::new();

        let cancelling = {
            let token = token.clone();
            let log = log.clone();
            FnUnit::new(1, move |ctx| {
                let token = token.clone();
                let log = log.clone();
                async move {
                    token.cancel();
                    assert!(ctx.is_cancelled());
                    log.lock().unwrap().push(ctx.index);
                    Ok(())
                }
            })
        };
        let orch = orchestrator(&store)
            .unit(cancelling)
            .unit(ok_unit(2, &log))
            .build();

        let err = orch.run(&token).await.unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled { version: 1 }));
        assert_eq!(entries(&log), vec![1]);
        assert_eq!(store.snapshot(), Some(Checkpoint::clean(1)));
    }

    #[tokio::test]
    async fn test_timeout_marks_dirty() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();

        let stuck = FnUnit::new(1, |ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            assert!(ctx.is_cancelled());
            Ok(())
        });
        let orch = orchestrator(&store)
            .unit(stuck)
            .unit(ok_unit(2, &log))
            .unit_timeout(Duration::from_millis(20))
            .build();

        let err = orch.run(&CancellationToken::new()).await.unwrap_err();
        match err {
            MigrateError::Action { index, source } => {
                assert_eq!(index, 1);
                assert!(matches!(*source, MigrateError::Timeout(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(entries(&log).is_empty());
        assert_eq!(store.snapshot(), Some(Checkpoint::dirty(1)));
    }

    /// Store whose `mark_dirty` always fails.
    struct BrokenDirtyMark(MemoryCheckpointStore);

    impl CheckpointStore for BrokenDirtyMark {
        fn ensure_schema(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            self.0.ensure_schema()
        }

        fn read_or_init(&self) -> Pin<Box<dyn Future<Output = Result<Checkpoint>> + Send + '_>> {
            self.0.read_or_init()
        }

        fn current(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>>> + Send + '_>> {
            self.0.current()
        }

        fn advance(&self, index: u32) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            self.0.advance(index)
        }

        fn mark_dirty(&self, _index: u32) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Err(MigrateError::Persistence("connection reset".to_string())) })
        }
    }

    #[tokio::test]
    async fn test_dirty_mark_failure_takes_precedence() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();

        let orch = Orchestrator::builder(BrokenDirtyMark(store.clone()))
            .unit(ok_unit(1, &log))
            .unit(failing_unit(2, &log))
            .build();

        let err = orch.run(&CancellationToken::new()).await.unwrap_err();
        match err {
            MigrateError::Persistence(message) => {
                assert!(message.contains("unit 2"));
                assert!(message.contains("constraint violated"));
                assert!(message.contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.snapshot(), Some(Checkpoint::clean(1)));
    }

    struct UnreadableSource;

    impl Source for UnreadableSource {
        fn name(&self) -> &str {
            "unreadable"
        }

        fn list_units(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Arc<dyn Unit>>>> + Send + '_>> {
            Box::pin(async {
                Err(MigrateError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "permission denied",
                )))
            })
        }
    }

    #[tokio::test]
    async fn test_source_failure_is_discovery_error() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();

        let orch = orchestrator(&store)
            .unit(ok_unit(1, &log))
            .source(UnreadableSource)
            .build();

        let err = orch.run(&CancellationToken::new()).await.unwrap_err();
        match err {
            MigrateError::Discovery {
                source_name,
                message,
            } => {
                assert_eq!(source_name, "unreadable");
                assert!(message.contains("permission denied"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(entries(&log).is_empty());
    }

    #[tokio::test]
    async fn test_status_lists_pending() {
        let store = MemoryCheckpointStore::new();
        let log = new_log();
        let orch = orchestrator(&store)
            .source(FnSource::new((1..=3).map(|i| ok_unit(i, &log))))
            .build();

        let status = orch.status().await.unwrap();
        assert_eq!(status.checkpoint, None);
        assert_eq!(status.pending, vec![1, 2, 3]);
        assert_eq!(store.snapshot(), None);

        store.set(Checkpoint::dirty(2));
        let status = orch.status().await.unwrap();
        assert!(status.is_dirty());
        assert_eq!(status.total_units, 3);
        assert_eq!(status.pending, vec![3]);
        assert!(entries(&log).is_empty());
    }
}
