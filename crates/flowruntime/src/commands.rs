//! Operator transitions. Each one is checked against the stored flow, written
//! with compare-and-swap, and announced to the notifier after the write.

use crate::executor::spawn_executor;
use crate::EngineContext;
use chrono::Utc;
use flowcore::{
    notify_quietly, DataBag, ErrorKind, FlowError, FlowEvent, FlowEventType, FlowId, FlowState, FlowStatus,
    PauseCondition, StepStatus, StoreError,
};
use std::sync::Arc;
use tracing::instrument;

/// Load, apply, save. A lost CAS race reloads and re-applies, up to
/// `command_conflict_retries` times.
pub(crate) async fn mutate<F>(ctx: &EngineContext, flow_id: FlowId, mut apply: F) -> Result<FlowState, FlowError>
where
    F: FnMut(&mut FlowState) -> Result<(), FlowError>,
{
    let mut conflicts = 0;
    loop {
        let mut state = ctx.store.load(flow_id).await?;
        apply(&mut state)?;
        match ctx.store.save(&state).await {
            Ok(version) => {
                state.version = version;
                return Ok(state);
            }
            Err(StoreError::ConcurrencyConflict { expected, found, .. })
                if conflicts < ctx.config.command_conflict_retries =>
            {
                conflicts += 1;
                tracing::warn!(%flow_id, expected, found, "Write conflict, reloading (attempt {})", conflicts);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn require(state: &FlowState, allowed: &[FlowStatus], operation: &str) -> Result<(), FlowError> {
    if allowed.contains(&state.status) {
        Ok(())
    } else {
        Err(FlowError::InvalidOperation(format!(
            "cannot {} flow {} while it is {}",
            operation, state.flow_id, state.status
        )))
    }
}

#[instrument(skip_all, fields(flow_id = %flow_id))]
pub(crate) async fn start_flow(ctx: &Arc<EngineContext>, flow_id: FlowId) -> Result<FlowState, FlowError> {
    let _claim = ctx.executors.claim(flow_id);
    let state = mutate(ctx, flow_id, |state| {
        require(state, &[FlowStatus::Pending], "start")?;
        state.transition(FlowStatus::Running)?;
        state.started_at = Some(Utc::now());
        state.record(FlowEvent::new(FlowEventType::FlowStarted, "Flow started"));
        Ok(())
    })
    .await?;
    tracing::info!("Flow '{}' started", state.flow_type);
    notify_quietly(ctx.notifier.as_ref(), &state).await;
    spawn_executor(ctx, flow_id).await;
    Ok(state)
}

/// Pause a running flow.
///
/// With an executor attached the request is honoured at the next batch
/// boundary and the returned state is still `Running`.
#[instrument(skip_all, fields(flow_id = %flow_id, reason = %condition.reason))]
pub(crate) async fn pause_flow(
    ctx: &Arc<EngineContext>,
    flow_id: FlowId,
    condition: PauseCondition,
) -> Result<FlowState, FlowError> {
    if let Some(control) = ctx.executors.control(flow_id) {
        let state = ctx.store.load(flow_id).await?;
        require(&state, &[FlowStatus::Running], "pause")?;
        control.request_pause(condition);
        tracing::info!("Pause requested; the executor stops at the next batch boundary");
        return Ok(state);
    }

    let state = mutate(ctx, flow_id, |state| {
        require(state, &[FlowStatus::Running], "pause")?;
        if let Some(step) = state.running_steps().first() {
            return Err(FlowError::InvalidOperation(format!(
                "step '{}' is marked running without an executor; run recovery before pausing",
                step.name
            )));
        }
        state.transition(FlowStatus::Paused)?;
        state.apply_pause(&condition);
        state.record(
            FlowEvent::new(
                FlowEventType::FlowPaused,
                format!(
                    "Flow paused ({}): {}",
                    condition.reason,
                    condition.message.as_deref().unwrap_or("no message")
                ),
            )
            .with_data("reason", condition.reason.to_string()),
        );
        Ok(())
    })
    .await?;
    tracing::info!("Flow paused");
    notify_quietly(ctx.notifier.as_ref(), &state).await;
    Ok(state)
}

#[instrument(skip_all, fields(flow_id = %flow_id))]
pub(crate) async fn resume_flow(
    ctx: &Arc<EngineContext>,
    flow_id: FlowId,
    data: Option<DataBag>,
) -> Result<FlowState, FlowError> {
    let _claim = ctx.executors.claim(flow_id);
    let state = mutate(ctx, flow_id, |state| {
        require(state, &[FlowStatus::Paused], "resume")?;
        let reason = state.pause_reason;
        state.clear_pause();
        let mut event = FlowEvent::new(FlowEventType::FlowResumed, "Flow resumed");
        if let Some(reason) = reason {
            event = event.with_data("paused_for", reason.to_string());
        }
        if let Some(data) = &data {
            event = event.with_data("keys", data.keys().cloned().collect::<Vec<_>>().join(","));
            state.merge_data(data.clone());
        }
        state.transition(FlowStatus::Running)?;
        state.point_cursor_at_next_batch();
        state.record(event);
        Ok(())
    })
    .await?;
    tracing::info!("Flow resumed at step {:?}", state.current_step_name);
    notify_quietly(ctx.notifier.as_ref(), &state).await;
    spawn_executor(ctx, flow_id).await;
    Ok(state)
}

#[instrument(skip_all, fields(flow_id = %flow_id))]
pub(crate) async fn cancel_flow(
    ctx: &Arc<EngineContext>,
    flow_id: FlowId,
    reason: Option<String>,
) -> Result<FlowState, FlowError> {
    let state = mutate(ctx, flow_id, |state| {
        if state.status.is_terminal() {
            return Err(FlowError::InvalidOperation(format!(
                "flow {} is already {}",
                state.flow_id, state.status
            )));
        }
        state.transition(FlowStatus::Cancelled)?;
        state.completed_at = Some(Utc::now());
        let description = match &reason {
            Some(reason) => format!("Flow cancelled: {}", reason),
            None => "Flow cancelled".to_string(),
        };
        state.record(FlowEvent::new(FlowEventType::FlowCancelled, description));
        Ok(())
    })
    .await?;
    if let Some(control) = ctx.executors.control(flow_id) {
        control.cancel();
    }
    tracing::info!("Flow cancelled");
    notify_quietly(ctx.notifier.as_ref(), &state).await;
    Ok(state)
}

#[instrument(skip_all, fields(flow_id = %flow_id))]
pub(crate) async fn resolve_flow(ctx: &Arc<EngineContext>, flow_id: FlowId, note: String) -> Result<FlowState, FlowError> {
    let state = mutate(ctx, flow_id, |state| {
        require(state, &[FlowStatus::Failed], "resolve")?;
        state.transition(FlowStatus::Resolved)?;
        state.completed_at = Some(Utc::now());
        state.resolution_note = Some(note.clone());
        state.record(FlowEvent::new(FlowEventType::FlowResolved, format!("Flow resolved: {}", note)));
        Ok(())
    })
    .await?;
    tracing::info!("Flow resolved manually");
    notify_quietly(ctx.notifier.as_ref(), &state).await;
    Ok(state)
}

/// Re-run a failed flow. Every failed critical step is reset, along with the
/// step named by `last_error` and any step whose outcome was lost in a crash.
/// Everything that already completed stays completed.
#[instrument(skip_all, fields(flow_id = %flow_id))]
pub(crate) async fn retry_flow(ctx: &Arc<EngineContext>, flow_id: FlowId) -> Result<FlowState, FlowError> {
    let _claim = ctx.executors.claim(flow_id);
    let state = mutate(ctx, flow_id, |state| {
        require(state, &[FlowStatus::Failed], "retry")?;

        let named = state.last_error.as_ref().and_then(|e| e.step_name.clone());
        let targets: Vec<String> = state
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .filter(|s| {
                s.is_critical
                    || named.as_deref() == Some(s.name.as_str())
                    || s.error.as_ref().is_some_and(|e| e.kind == ErrorKind::UnconfirmedStepOnCrash)
            })
            .map(|s| s.name.clone())
            .collect();
        for name in &targets {
            if let Some(step) = state.step_mut(name) {
                step.reset();
            }
        }

        state.last_error = None;
        state.completed_at = None;
        state.transition(FlowStatus::Running)?;
        state.point_cursor_at_next_batch();
        state.record(
            FlowEvent::new(FlowEventType::FlowRetried, format!("Flow retried from [{}]", targets.join(", ")))
                .with_data("steps", targets.join(",")),
        );
        Ok(())
    })
    .await?;
    tracing::info!("Flow retried from step {:?}", state.current_step_name);
    notify_quietly(ctx.notifier.as_ref(), &state).await;
    spawn_executor(ctx, flow_id).await;
    Ok(state)
}
