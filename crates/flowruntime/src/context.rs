use crate::{EngineConfig, ExecutorRegistry, StepRegistry};
use flowcore::{FlowStore, PredicateRegistry, StatusNotifier};
use std::sync::Arc;

/// Collaborators shared by the executor, recovery, auto-resume and the facade
pub struct EngineContext {
    pub store: Arc<dyn FlowStore>,
    pub steps: Arc<StepRegistry>,
    pub predicates: Arc<PredicateRegistry>,
    pub notifier: Arc<dyn StatusNotifier>,
    pub executors: Arc<ExecutorRegistry>,
    pub config: EngineConfig,
}
