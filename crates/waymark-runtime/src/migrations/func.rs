//! In-process function units.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use waymark_core::error::Result;
use waymark_core::unit::{Source, Unit, UnitContext};

type BoxedAction =
    Arc<dyn Fn(UnitContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// A unit backed by an async closure.
#[derive(Clone)]
pub struct FnUnit {
    index: u32,
    name: Option<String>,
    action: BoxedAction,
}

impl FnUnit {
    /// Create a unit running `action` at `index`.
    pub fn new<F, Fut>(index: u32, action: F) -> Self
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            index,
            name: None,
            action: Arc::new(
                move |ctx| -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
                    Box::pin(action(ctx))
                },
            ),
        }
    }

    /// Attach a display name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl std::fmt::Debug for FnUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnUnit")
            .field("index", &self.index)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Unit for FnUnit {
    fn index(&self) -> u32 {
        self.index
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn execute(&self, ctx: UnitContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        (self.action)(ctx)
    }
}

/// A fixed list of function units.
#[derive(Debug, Clone)]
pub struct FnSource {
    name: String,
    units: Vec<FnUnit>,
}

impl FnSource {
    /// Create a source holding `units`.
    pub fn new(units: impl IntoIterator<Item = FnUnit>) -> Self {
        Self {
            name: "fn".to_string(),
            units: units.into_iter().collect(),
        }
    }

    /// Override the name used in logs and discovery errors.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a unit.
    pub fn push(&mut self, unit: FnUnit) {
        self.units.push(unit);
    }

    /// Number of units held.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the source holds no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl Source for FnSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_units(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Arc<dyn Unit>>>> + Send + '_>> {
        let units = self
            .units
            .iter()
            .cloned()
            .map(|unit| Arc::new(unit) as Arc<dyn Unit>)
            .collect();
        Box::pin(async move { Ok(units) })
    }
}
