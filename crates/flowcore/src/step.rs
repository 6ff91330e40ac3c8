use crate::{DataBag, FlowId, StepError, StepResult, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Business logic behind a flow step. The engine only orchestrates.
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique type identifier (e.g., "debug.log", "time.delay")
    fn step_type(&self) -> &str;

    /// Execute the step against a snapshot of the flow's data bag.
    ///
    /// Returning `Ok` with `is_success == false` counts as a failure for
    /// retry and criticality purposes, unless the result asks for a pause.
    async fn execute(&self, ctx: StepContext) -> Result<StepResult, StepError>;

    /// Optional: Validate configuration at definition load time
    fn validate_config(&self, _config: &HashMap<String, Value>) -> Result<(), StepError> {
        Ok(())
    }
}

/// Execution context passed to each step attempt
#[derive(Clone)]
pub struct StepContext {
    pub flow_id: FlowId,
    pub step_name: String,
    /// 0-based attempt number within the current run of the step.
    pub attempt: u32,
    pub data: DataBag,
    pub config: HashMap<String, Value>,
    pub cancellation: CancellationToken,
}

impl StepContext {
    pub fn new(flow_id: FlowId, step_name: impl Into<String>) -> Self {
        Self {
            flow_id,
            step_name: step_name.into(),
            attempt: 0,
            data: DataBag::new(),
            config: HashMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Get required input from the data bag or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, StepError> {
        self.data
            .get(name)
            .ok_or_else(|| StepError::MissingInput(name.to_string()))
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, StepError> {
        self.config
            .get(name)
            .ok_or_else(|| StepError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }
}
