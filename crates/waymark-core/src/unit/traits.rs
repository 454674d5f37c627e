use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::context::UnitContext;
use crate::Result;

/// A single migration step.
pub trait Unit: Send + Sync {
    /// Ordinal position of this unit. Indices start at 1 and must be dense
    /// across every registered source.
    fn index(&self) -> u32;

    /// Human-readable name, used in logs.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Execute the unit.
    fn execute(&self, ctx: UnitContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// A provider of migration units.
///
/// Ordering is irrelevant; the orchestrator sorts the combined set. After the
/// first successful call, repeated calls must return the same units.
pub trait Source: Send + Sync {
    /// Name used in discovery errors and logs.
    fn name(&self) -> &str;

    /// Enumerate the units owned by this source.
    fn list_units(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Arc<dyn Unit>>>> + Send + '_>>;
}

impl std::fmt::Debug for dyn Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("index", &self.index())
            .field("name", &self.name())
            .finish()
    }
}
