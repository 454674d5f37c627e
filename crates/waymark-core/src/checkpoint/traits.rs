use std::future::Future;
use std::pin::Pin;

use super::Checkpoint;
use crate::error::{MigrateError, Result};

/// Durable storage for a single migration checkpoint.
pub trait CheckpointStore: Send + Sync {
    /// Create the backing structure if it does not exist. Safe to call every run.
    fn ensure_schema(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Return the stored checkpoint, creating it at `version=0, dirty=false`
    /// if absent. Creation must be atomic with respect to other initializers.
    fn read_or_init(&self) -> Pin<Box<dyn Future<Output = Result<Checkpoint>> + Send + '_>>;

    /// Read the checkpoint without creating it.
    fn current(&self) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>>> + Send + '_>>;

    /// Record `index` as the last applied unit and clear the dirty flag.
    fn advance(&self, index: u32) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Record that applying `index` failed.
    fn mark_dirty(&self, index: u32) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Load the checkpoint for a run, refusing to continue from a dirty one.
    fn load_or_init(&self) -> Pin<Box<dyn Future<Output = Result<Checkpoint>> + Send + '_>> {
        Box::pin(async move {
            let checkpoint = self.read_or_init().await?;
            if checkpoint.dirty {
                return Err(MigrateError::Dirty {
                    version: checkpoint.version,
                });
            }
            Ok(checkpoint)
        })
    }

    /// Take a cross-process lock around a run. No-op unless the store supports it.
    fn lock(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    /// Release the lock taken by [`CheckpointStore::lock`].
    fn unlock(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
