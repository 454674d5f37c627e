use std::sync::Arc;

use waymark_core::error::{MigrateError, Result};
use waymark_core::unit::Unit;

/// Sort units by index and check that they form the sequence `1..=N`.
///
/// Sorting first puts every duplicate next to its twin, so checking adjacent
/// pairs catches all of them. Index 0 is the "nothing applied" checkpoint
/// value and can never be a unit.
pub fn sort_and_validate(units: &mut [Arc<dyn Unit>]) -> Result<()> {
    units.sort_by_key(|unit| unit.index());

    for pair in units.windows(2) {
        let (prev, next) = (pair[0].index(), pair[1].index());
        if next == prev {
            return Err(MigrateError::DuplicateIndex { index: prev });
        }
        if next != prev + 1 {
            return Err(MigrateError::IndexGap {
                index: prev,
                next,
            });
        }
    }

    match units.first() {
        Some(first) if first.index() != 1 => Err(MigrateError::IndexGap {
            index: 0,
            next: first.index(),
        }),
        _ => Ok(()),
    }
}
