use async_trait::async_trait;
use flowcore::{Step, StepContext, StepError, StepResult, Value};
use flowruntime::{KeyDefinition, StepFactory, StepMetadata};
use std::collections::HashMap;
use std::sync::Arc;

/// Simple debug step that logs a message and the data bag
pub struct DebugStep;

#[async_trait]
impl Step for DebugStep {
    fn step_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepResult, StepError> {
        let message = ctx
            .config
            .get("message")
            .or_else(|| ctx.data.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)")
            .to_string();

        tracing::info!(flow_id = %ctx.flow_id, step = %ctx.step_name, "DEBUG: {}", message);

        // Also log the bag for visibility
        for (key, value) in &ctx.data {
            tracing::debug!(flow_id = %ctx.flow_id, "  {}: {:?}", key, value);
        }

        Ok(StepResult::success(format!("logged: {}", message)).with_data("message", message))
    }
}

pub struct DebugStepFactory;

impl StepFactory for DebugStepFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Arc<dyn Step>, StepError> {
        Ok(Arc::new(DebugStep))
    }

    fn step_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Logs a message and the data bag for debugging".to_string(),
            category: "debug".to_string(),
            reads: vec![KeyDefinition {
                name: "message".to_string(),
                description: "Fallback when no `message` config is set".to_string(),
                required: false,
            }],
            writes: vec![KeyDefinition {
                name: "message".to_string(),
                description: "The message that was logged".to_string(),
                required: false,
            }],
        }
    }
}
