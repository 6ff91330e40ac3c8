use crate::executor::spawn_executor;
use crate::EngineContext;
use flowcore::{
    notify_quietly, query_all, ErrorInfo, ErrorKind, FlowError, FlowEvent, FlowEventType, FlowFilter, FlowId,
    FlowState, FlowStatus, StepStatus,
};
use serde::Serialize;
use std::sync::Arc;

/// What one recovery pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoverySummary {
    /// Flows handed back to an executor.
    pub recovered: Vec<FlowId>,
    /// Flows failed because a non-idempotent step may or may not have run.
    pub failed: Vec<FlowId>,
    pub errors: Vec<(FlowId, String)>,
}

impl RecoverySummary {
    pub fn recovered_count(&self) -> usize {
        self.recovered.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

enum Recovered {
    Resumed,
    Failed,
}

/// Re-attaches flows whose process died while they were `Running`.
pub struct FlowRecovery {
    ctx: Arc<EngineContext>,
}

impl FlowRecovery {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn recover_crashed_flows(&self) -> Result<RecoverySummary, FlowError> {
        let running = query_all(self.ctx.store.as_ref(), &FlowFilter::with_status(FlowStatus::Running)).await?;
        let mut summary = RecoverySummary::default();

        for flow in running {
            let flow_id = flow.flow_id;
            if self.ctx.executors.is_owned(flow_id) {
                continue;
            }
            match self.recover(flow).await {
                Ok(Recovered::Resumed) => summary.recovered.push(flow_id),
                Ok(Recovered::Failed) => summary.failed.push(flow_id),
                Err(e) => {
                    tracing::error!(%flow_id, "Recovery failed: {}", e);
                    summary.errors.push((flow_id, e.to_string()));
                }
            }
        }

        tracing::info!(
            "Recovery pass: {} resumed, {} failed, {} errors",
            summary.recovered_count(),
            summary.failed_count(),
            summary.error_count()
        );
        Ok(summary)
    }

    async fn recover(&self, mut state: FlowState) -> Result<Recovered, FlowError> {
        let flow_id = state.flow_id;
        let unconfirmed: Vec<String> = state
            .running_steps()
            .into_iter()
            .filter(|s| !s.is_idempotent)
            .map(|s| s.name.clone())
            .collect();
        let interrupted: Vec<String> = state.running_steps().into_iter().map(|s| s.name.clone()).collect();

        for name in &interrupted {
            if unconfirmed.contains(name) {
                continue;
            }
            if let Some(step) = state.step_mut(name) {
                step.status = StepStatus::Pending;
                step.started_at = None;
            }
        }

        if unconfirmed.is_empty() {
            state.point_cursor_at_next_batch();
            state.record(
                FlowEvent::new(
                    FlowEventType::FlowRecovered,
                    format!("Flow recovered; re-running [{}]", interrupted.join(", ")),
                )
                .with_data("steps", interrupted.join(",")),
            );
            state.version = self.ctx.store.save(&state).await?;
            tracing::info!(%flow_id, "Recovered flow '{}' at step {:?}", state.flow_type, state.current_step_name);
            spawn_executor(&self.ctx, flow_id).await;
            return Ok(Recovered::Resumed);
        }

        let message = format!(
            "process stopped while non-idempotent step(s) [{}] were running; outcome unknown",
            unconfirmed.join(", ")
        );
        for name in &unconfirmed {
            let error = ErrorInfo::new(ErrorKind::UnconfirmedStepOnCrash, message.clone(), Some(name.clone()));
            if let Some(step) = state.step_mut(name) {
                step.status = StepStatus::Failed;
                step.error = Some(error);
            }
        }
        state.last_error = Some(ErrorInfo::new(
            ErrorKind::UnconfirmedStepOnCrash,
            message.clone(),
            unconfirmed.first().cloned(),
        ));
        state.transition(FlowStatus::Failed)?;
        state.record(FlowEvent::new(FlowEventType::FlowFailed, format!("Flow failed during recovery: {}", message)));
        state.version = self.ctx.store.save(&state).await?;
        tracing::warn!(%flow_id, "{}", message);
        notify_quietly(self.ctx.notifier.as_ref(), &state).await;
        Ok(Recovered::Failed)
    }
}
