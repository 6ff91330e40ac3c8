//! Flow execution runtime
//!
//! This crate runs flows durably: the batch executor with retries, timeouts
//! and branches, operator commands guarded by optimistic concurrency, crash
//! recovery, the auto-resume loop, flow stores, and the [`FlowEngine`]
//! facade that ties them together.

mod active;
mod auto_resume;
mod commands;
mod config;
mod context;
mod engine;
mod executor;
mod loader;
pub mod persistence;
mod recovery;
mod registry;
mod report;

pub use active::{AttachClaim, ExecutorRegistry, FlowControl};
pub use auto_resume::{AutoResumeReport, AutoResumeService, ResumeCondition};
pub use config::EngineConfig;
pub use context::EngineContext;
pub use engine::{FlowEngine, FlowEngineBuilder};
pub use executor::{choose_branch, FlowExecutor};
pub use loader::{load_definition, DefinitionLoader};
pub use persistence::{FileFlowStore, InMemoryFlowStore};
pub use recovery::{FlowRecovery, RecoverySummary};
pub use registry::{DefinitionRegistry, KeyDefinition, RegisteredDefinition, StepFactory, StepMetadata, StepRegistry};
pub use report::{
    timeline_of, BatchItemResult, BatchOperation, BatchReport, FlowStatistics, FlowSummary, NewFlow,
    OperationError, TimelineEntry,
};
