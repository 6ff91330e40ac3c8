//! Standard step library
//!
//! Collection of built-in steps for logging, waiting, shaping the data bag
//! and exercising failure and pause handling.

mod control;
mod data;
mod debug;
mod time;

pub use control::{AwaitKeyStep, FailStep};
pub use data::{JsonParseStep, SetDataStep};
pub use debug::DebugStep;
pub use time::DelayStep;
use flowruntime::StepRegistry;

use std::sync::Arc;

/// Register all standard steps with a registry
pub fn register_all(registry: &mut StepRegistry) {
    registry.register(Arc::new(debug::DebugStepFactory));
    registry.register(Arc::new(time::DelayStepFactory));
    registry.register(Arc::new(data::SetDataStepFactory));
    registry.register(Arc::new(data::JsonParseStepFactory));
    registry.register(Arc::new(control::FailStepFactory));
    registry.register(Arc::new(control::AwaitKeyStepFactory));
}

/// A registry preloaded with every standard step
pub fn standard_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    register_all(&mut registry);
    registry
}
