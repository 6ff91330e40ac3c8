//! Core abstractions for the flow engine
//!
//! This crate provides the flow model (definitions, durable state, values,
//! branch conditions), static plan resolution, error types, and the traits
//! that the runtime depends on: [`Step`], [`FlowStore`] and
//! [`StatusNotifier`]. It has no runtime of its own.

mod condition;
mod definition;
mod error;
pub mod events;
mod plan;
mod state;
mod step;
mod store;
mod value;

pub use condition::{Condition, Predicate, PredicateRegistry};
pub use definition::{Branch, FlowDefinition, RetryPolicy, StepSpec};
pub use error::{DefinitionError, ErrorKind, FlowError, StepError, StoreError};
pub use events::*;
pub use plan::{resolve_execution_order, ExecutionPlan};
pub use state::{
    ErrorInfo, FlowEvent, FlowEventType, FlowId, FlowState, FlowStatus, PauseCondition, PauseReason,
    StepResult, StepState, StepStatus,
};
pub use step::{Step, StepContext};
pub use store::{query_all, DateRange, FlowFilter, FlowStore, PageRequest, PagedResult};
pub use value::{bag_from_json, DataBag, Value};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
