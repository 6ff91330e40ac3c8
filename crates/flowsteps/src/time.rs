use async_trait::async_trait;
use flowcore::{Step, StepContext, StepError, StepResult, Value};
use flowruntime::{StepFactory, StepMetadata};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Delay execution for a configured duration
pub struct DelayStep {
    delay_ms: u64,
}

impl DelayStep {
    pub fn new(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

#[async_trait]
impl Step for DelayStep {
    fn step_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepResult, StepError> {
        tracing::debug!(step = %ctx.step_name, "Delaying for {}ms", self.delay_ms);

        tokio::select! {
            _ = sleep(Duration::from_millis(self.delay_ms)) => {
                Ok(StepResult::success(format!("waited {}ms", self.delay_ms)))
            }
            _ = ctx.cancellation.cancelled() => Err(StepError::Cancelled),
        }
    }
}

pub struct DelayStepFactory;

impl StepFactory for DelayStepFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Step>, StepError> {
        let delay_ms = match config.get("delay_ms") {
            None => 1000, // Default to 1 second if not specified
            Some(value) => value
                .as_f64()
                .filter(|ms| *ms >= 0.0)
                .ok_or_else(|| StepError::Configuration("delay_ms must be a non-negative number".to_string()))?
                as u64,
        };
        Ok(Arc::new(DelayStep::new(delay_ms)))
    }

    fn step_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            ..StepMetadata::default()
        }
    }
}
