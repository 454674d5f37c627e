use tokio_util::sync::CancellationToken;

/// Context handed to a unit while it executes.
///
/// Cheap to clone; the token is shared with the run that created it, so
/// cancelling the run is observed by the unit.
#[derive(Debug, Clone)]
pub struct UnitContext {
    /// Index of the unit being executed.
    pub index: u32,
    /// Checkpoint version before this unit started.
    pub previous_version: u32,
    cancel: CancellationToken,
}

impl UnitContext {
    /// Create a new unit context.
    pub fn new(index: u32, previous_version: u32, cancel: CancellationToken) -> Self {
        Self {
            index,
            previous_version,
            cancel,
        }
    }

    /// Check whether the run or this unit has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Get the cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}
