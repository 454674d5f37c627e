use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use waymark_core::checkpoint::{Checkpoint, CheckpointStore};
use waymark_core::error::{MigrateError, Result};

/// Process-local checkpoint store.
///
/// Clones share the same record, so a test can keep a handle while the
/// orchestrator owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    schema_ready: bool,
    checkpoint: Option<Checkpoint>,
}

impl MemoryCheckpointStore {
    /// Create an empty store (no table, no row).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `checkpoint`.
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                schema_ready: true,
                checkpoint: Some(checkpoint),
            })),
        }
    }

    /// Current row, if any.
    pub fn snapshot(&self) -> Option<Checkpoint> {
        self.lock_state().ok().and_then(|s| s.checkpoint)
    }

    /// Whether `ensure_schema` has run.
    pub fn schema_ready(&self) -> bool {
        self.lock_state().map(|s| s.schema_ready).unwrap_or(false)
    }

    /// Overwrite the stored row, the way an operator would by hand.
    pub fn set(&self, checkpoint: Checkpoint) {
        if let Ok(mut state) = self.lock_state() {
            state.schema_ready = true;
            state.checkpoint = Some(checkpoint);
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| MigrateError::Persistence("Checkpoint state poisoned".to_string()))
    }

    fn update(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut state = self.lock_state()?;
        match state.checkpoint.as_mut() {
            Some(row) => {
                *row = checkpoint;
                Ok(())
            }
            None => Err(MigrateError::Persistence(
                "Checkpoint row does not exist".to_string(),
            )),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn ensure_schema(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.lock_state()?.schema_ready = true;
            Ok(())
        })
    }

    fn read_or_init(&self) -> Pin<Box<dyn Future<Output = Result<Checkpoint>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.lock_state()?;
            if !state.schema_ready {
                return Err(MigrateError::Persistence(
                    "Checkpoint table does not exist".to_string(),
                ));
            }
            Ok(*state.checkpoint.get_or_insert_with(Checkpoint::initial))
        })
    }

    fn current(&self) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>>> + Send + '_>> {
        Box::pin(async move { Ok(self.lock_state()?.checkpoint) })
    }

    fn advance(&self, index: u32) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.update(Checkpoint::clean(index)) })
    }

    fn mark_dirty(&self, index: u32) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.update(Checkpoint::dirty(index)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_read_requires_schema() {
        let store = MemoryCheckpointStore::new();
        assert_err!(store.read_or_init().await);

        assert_ok!(store.ensure_schema().await);
        assert_eq!(store.read_or_init().await.unwrap(), Checkpoint::initial());
        assert_eq!(store.snapshot(), Some(Checkpoint::initial()));
    }

    #[tokio::test]
    async fn test_current_does_not_init() {
        let store = MemoryCheckpointStore::new();
        store.ensure_schema().await.unwrap();
        assert_eq!(store.current().await.unwrap(), None);
        assert_eq!(store.snapshot(), None);
    }

    #[tokio::test]
    async fn test_advance_and_mark_dirty() {
        let store = MemoryCheckpointStore::new();
        store.ensure_schema().await.unwrap();
        store.read_or_init().await.unwrap();

        assert_ok!(store.advance(1).await);
        assert_eq!(store.snapshot(), Some(Checkpoint::clean(1)));

        assert_ok!(store.mark_dirty(2).await);
        assert_eq!(store.snapshot(), Some(Checkpoint::dirty(2)));
    }

    #[tokio::test]
    async fn test_update_without_row_fails() {
        let store = MemoryCheckpointStore::new();
        store.ensure_schema().await.unwrap();
        let err = store.advance(1).await.unwrap_err();
        assert!(matches!(err, MigrateError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_load_or_init_rejects_dirty() {
        let store = MemoryCheckpointStore::with_checkpoint(Checkpoint::dirty(5));
        let err = store.load_or_init().await.unwrap_err();
        assert!(matches!(err, MigrateError::Dirty { version: 5 }));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryCheckpointStore::new();
        let handle = store.clone();
        store.set(Checkpoint::clean(3));
        assert_eq!(handle.snapshot(), Some(Checkpoint::clean(3)));
        assert!(handle.schema_ready());
    }
}
