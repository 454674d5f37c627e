mod context;
mod traits;

pub use context::UnitContext;
pub use traits::{Source, Unit};
