use async_trait::async_trait;
use chrono::{Duration, Utc};
use flowcore::{PauseCondition, PauseReason, Step, StepContext, StepError, StepResult, Value};
use flowruntime::{KeyDefinition, StepFactory, StepMetadata};
use std::collections::HashMap;
use std::sync::Arc;

/// Fails on purpose. With `fail_times` set it fails that many attempts and
/// then succeeds, which makes retry policies observable.
pub struct FailStep {
    message: String,
    fail_times: Option<u32>,
}

#[async_trait]
impl Step for FailStep {
    fn step_type(&self) -> &str {
        "control.fail"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepResult, StepError> {
        match self.fail_times {
            Some(times) if ctx.attempt >= times => {
                Ok(StepResult::success(format!("succeeded on attempt {}", ctx.attempt + 1)))
            }
            _ => Err(StepError::ExecutionFailed(self.message.clone())),
        }
    }
}

pub struct FailStepFactory;

impl StepFactory for FailStepFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Step>, StepError> {
        let message = config
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("configured failure")
            .to_string();
        let fail_times = config.get("fail_times").and_then(|v| v.as_f64()).map(|n| n.max(0.0) as u32);
        Ok(Arc::new(FailStep { message, fail_times }))
    }

    fn step_type(&self) -> &str {
        "control.fail"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Fail with `message`, optionally only for the first `fail_times` attempts".to_string(),
            category: "control".to_string(),
            ..StepMetadata::default()
        }
    }
}

/// Pauses the flow until a key shows up in the data bag.
///
/// Resuming with the key supplied lets the step complete; resuming without
/// it pauses the flow again.
pub struct AwaitKeyStep {
    key: String,
    reason: PauseReason,
    resume_after_ms: Option<i64>,
}

#[async_trait]
impl Step for AwaitKeyStep {
    fn step_type(&self) -> &str {
        "control.await"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepResult, StepError> {
        if let Some(value) = ctx.data.get(&self.key).filter(|v| !v.is_null()) {
            return Ok(StepResult::success(format!("'{}' arrived", self.key)).with_data(self.key.clone(), value.clone()));
        }

        let mut condition =
            PauseCondition::new(self.reason).with_message(format!("waiting for '{}'", self.key));
        if let Some(ms) = self.resume_after_ms {
            condition = condition.until(Utc::now() + Duration::milliseconds(ms));
        }
        Ok(StepResult::wait(condition))
    }
}

fn parse_reason(raw: &str) -> Result<PauseReason, StepError> {
    match raw.to_ascii_lowercase().replace('_', "").as_str() {
        "externalwait" => Ok(PauseReason::ExternalWait),
        "errorthrottle" => Ok(PauseReason::ErrorThrottle),
        "scheduled" => Ok(PauseReason::Scheduled),
        "manualintervention" => Ok(PauseReason::ManualIntervention),
        other => Err(StepError::Configuration(format!("unsupported pause reason '{}'", other))),
    }
}

pub struct AwaitKeyStepFactory;

impl StepFactory for AwaitKeyStepFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Step>, StepError> {
        let key = config
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StepError::Configuration("Missing config: key".to_string()))?
            .to_string();
        let reason = match config.get("reason").and_then(|v| v.as_str()) {
            Some(raw) => parse_reason(raw)?,
            None => PauseReason::ExternalWait,
        };
        let resume_after_ms = config.get("resume_after_ms").and_then(|v| v.as_f64()).map(|ms| ms as i64);
        Ok(Arc::new(AwaitKeyStep {
            key,
            reason,
            resume_after_ms,
        }))
    }

    fn step_type(&self) -> &str {
        "control.await"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Pause the flow until `key` is supplied, e.g. on resume".to_string(),
            category: "control".to_string(),
            reads: vec![KeyDefinition {
                name: "key".to_string(),
                description: "The awaited key (config `key`)".to_string(),
                required: false,
            }],
            writes: vec![],
        }
    }
}
