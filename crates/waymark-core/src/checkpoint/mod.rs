mod traits;

pub use traits::CheckpointStore;

/// Durable record of migration progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    /// Index of the last unit known to have completed (0 = none applied).
    pub version: u32,
    /// The last attempted unit did not confirm success.
    pub dirty: bool,
}

impl Checkpoint {
    /// Checkpoint written on the first-ever run.
    pub const fn initial() -> Self {
        Self {
            version: 0,
            dirty: false,
        }
    }

    /// Clean checkpoint at the given version.
    pub const fn clean(version: u32) -> Self {
        Self {
            version,
            dirty: false,
        }
    }

    /// Dirty checkpoint at the given version.
    pub const fn dirty(version: u32) -> Self {
        Self {
            version,
            dirty: true,
        }
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dirty {
            write!(f, "version {} (dirty)", self.version)
        } else {
            write!(f, "version {}", self.version)
        }
    }
}
