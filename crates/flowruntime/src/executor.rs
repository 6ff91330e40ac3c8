use crate::{EngineContext, FlowControl};
use chrono::Utc;
use flowcore::{
    notify_quietly, Branch, DataBag, ErrorInfo, ErrorKind, FlowError, FlowEvent, FlowEventType, FlowId,
    FlowState, FlowStatus, PauseCondition, PredicateRegistry, Step, StepContext, StepError, StepResult,
    StepState, StepStatus, StoreError, Value,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Drives one flow through its plan, batch by batch, checkpointing every
/// transition through the store.
pub struct FlowExecutor {
    ctx: Arc<EngineContext>,
}

enum Checkpoint {
    Saved,
    /// Someone else moved the flow out of `Running`; stop without writing.
    Superseded(FlowStatus),
}

/// Settled result of one step within a batch
struct StepOutcome {
    attempts: u32,
    /// Error messages of attempts that were followed by a retry.
    retried: Vec<String>,
    kind: OutcomeKind,
}

enum OutcomeKind {
    Succeeded(StepResult),
    /// The step asked to pause before it could finish.
    Waiting(StepResult),
    Failed { kind: ErrorKind, message: String },
}

impl StepOutcome {
    fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            attempts: 0,
            retried: Vec::new(),
            kind: OutcomeKind::Failed {
                kind,
                message: message.into(),
            },
        }
    }
}

impl FlowExecutor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run the flow until it completes, fails, pauses or is cancelled.
    ///
    /// Returns the status the flow was left in.
    #[instrument(skip_all, fields(flow_id = %flow_id))]
    pub async fn run(&self, flow_id: FlowId, control: Arc<FlowControl>) -> Result<FlowStatus, FlowError> {
        let mut state = self.ctx.store.load(flow_id).await?;
        if state.status != FlowStatus::Running {
            tracing::debug!("Flow is {}, nothing to execute", state.status);
            return Ok(state.status);
        }
        if let Some(step) = state.running_steps().first() {
            return Err(FlowError::InvalidOperation(format!(
                "step '{}' is marked running without an executor; run recovery first",
                step.name
            )));
        }

        tracing::info!("Executing flow '{}' from step {:?}", state.flow_type, state.current_step_name);

        loop {
            if control.is_cancelled() {
                return self.reload_status(flow_id).await;
            }
            if let Some(condition) = control.take_pause() {
                return self.pause(&mut state, condition).await;
            }

            self.settle_skips(&mut state);
            let batch = next_batch(&state);

            if batch.is_empty() {
                return if state.has_pending_steps() {
                    self.stall(&mut state).await
                } else {
                    self.complete(&mut state).await
                };
            }

            let now = Utc::now();
            for name in &batch {
                if let Some(step) = state.step_mut(name) {
                    step.status = StepStatus::Running;
                    step.started_at = Some(now);
                    step.completed_at = None;
                    step.error = None;
                }
                state.record(FlowEvent::new(FlowEventType::StepStarted, format!("Step '{}' started", name)));
            }
            state.point_cursor_at_next_batch();
            tracing::debug!("Starting batch {:?}", batch);
            if let Checkpoint::Superseded(status) = self.checkpoint(&mut state).await? {
                return Ok(status);
            }

            let outcomes = match self.run_batch(&state, &batch, &control).await {
                Some(outcomes) => outcomes,
                None => return self.reload_status(flow_id).await,
            };

            let pause = self.apply_outcomes(&mut state, &batch, outcomes)?;
            state.point_cursor_at_next_batch();
            if let Checkpoint::Superseded(status) = self.checkpoint(&mut state).await? {
                return Ok(status);
            }

            if state.status == FlowStatus::Failed {
                notify_quietly(self.ctx.notifier.as_ref(), &state).await;
                return Ok(FlowStatus::Failed);
            }
            if let Some(condition) = pause {
                control.request_pause(condition);
            }
        }
    }

    /// Save, adopting the new version. A conflict against a flow that is no
    /// longer running means an operator got there first.
    async fn checkpoint(&self, state: &mut FlowState) -> Result<Checkpoint, FlowError> {
        match self.ctx.store.save(state).await {
            Ok(version) => {
                state.version = version;
                Ok(Checkpoint::Saved)
            }
            Err(err @ StoreError::ConcurrencyConflict { .. }) => {
                let current = self.ctx.store.load(state.flow_id).await?;
                if current.status != FlowStatus::Running {
                    tracing::info!("Flow moved to {} by another writer; executor stops", current.status);
                    Ok(Checkpoint::Superseded(current.status))
                } else {
                    tracing::error!("Lost a write race on a running flow: {}", err);
                    Err(err.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reload_status(&self, flow_id: FlowId) -> Result<FlowStatus, FlowError> {
        let status = self.ctx.store.load(flow_id).await?.status;
        tracing::info!("Executor released after cancellation (flow is {})", status);
        Ok(status)
    }

    async fn pause(&self, state: &mut FlowState, condition: PauseCondition) -> Result<FlowStatus, FlowError> {
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
        if let Checkpoint::Superseded(status) = self.checkpoint(state).await? {
            return Ok(status);
        }
        tracing::info!("Flow paused at step {:?} ({})", state.current_step_name, condition.reason);
        notify_quietly(self.ctx.notifier.as_ref(), state).await;
        Ok(FlowStatus::Paused)
    }

    async fn complete(&self, state: &mut FlowState) -> Result<FlowStatus, FlowError> {
        let blocked = state
            .steps
            .iter()
            .find(|s| s.is_critical && s.status == StepStatus::Failed)
            .map(|s| s.name.clone());
        if let Some(name) = blocked {
            return self.fail_blocked(state, &name).await;
        }

        state.transition(FlowStatus::Completed)?;
        state.completed_at = Some(Utc::now());
        state.point_cursor_at_next_batch();
        state.record(FlowEvent::new(FlowEventType::FlowCompleted, "Flow completed"));
        if let Checkpoint::Superseded(status) = self.checkpoint(state).await? {
            return Ok(status);
        }
        tracing::info!("Flow '{}' completed", state.flow_type);
        notify_quietly(self.ctx.notifier.as_ref(), state).await;
        Ok(FlowStatus::Completed)
    }

    /// Nothing is left to run but a critical step is still `Failed`.
    async fn fail_blocked(&self, state: &mut FlowState, name: &str) -> Result<FlowStatus, FlowError> {
        let message = format!("critical step '{}' is still failed", name);
        let error = state
            .step(name)
            .and_then(|s| s.error.clone())
            .unwrap_or_else(|| ErrorInfo::new(ErrorKind::StepExecutionError, message.clone(), Some(name.to_string())));
        tracing::warn!("Flow cannot complete: {}", message);
        state.last_error = Some(error);
        state.transition(FlowStatus::Failed)?;
        state.record(
            FlowEvent::new(FlowEventType::FlowFailed, format!("Flow failed: {}", message)).with_data("step", name),
        );
        if let Checkpoint::Superseded(status) = self.checkpoint(state).await? {
            return Ok(status);
        }
        notify_quietly(self.ctx.notifier.as_ref(), state).await;
        Ok(FlowStatus::Failed)
    }

    async fn stall(&self, state: &mut FlowState) -> Result<FlowStatus, FlowError> {
        let pending: Vec<&str> = state
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.name.as_str())
            .collect();
        let message = format!("no step is eligible to run; pending: {}", pending.join(", "));
        tracing::error!("Flow stalled: {}", message);
        state.last_error = Some(ErrorInfo::new(ErrorKind::ValidationError, message.clone(), None));
        state.transition(FlowStatus::Failed)?;
        state.record(FlowEvent::new(FlowEventType::FlowFailed, format!("Flow failed: {}", message)));
        if let Checkpoint::Superseded(status) = self.checkpoint(state).await? {
            return Ok(status);
        }
        notify_quietly(self.ctx.notifier.as_ref(), state).await;
        Ok(FlowStatus::Failed)
    }

    /// Skip pending steps whose branch was not taken or whose dependency failed,
    /// until nothing else changes.
    fn settle_skips(&self, state: &mut FlowState) {
        loop {
            let view: &FlowState = state;
            let skips: Vec<(String, String)> = view
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .filter_map(|s| skip_reason(view, s).map(|reason| (s.name.clone(), reason)))
                .collect();
            if skips.is_empty() {
                return;
            }
            let now = Utc::now();
            for (name, reason) in skips {
                tracing::debug!("Skipping step '{}': {}", name, reason);
                if let Some(step) = state.step_mut(&name) {
                    step.status = StepStatus::Skipped;
                    step.completed_at = Some(now);
                }
                state.record(
                    FlowEvent::new(FlowEventType::StepSkipped, format!("Step '{}' skipped: {}", name, reason))
                        .with_data("step", name.as_str()),
                );
            }
        }
    }

    /// Run every step of the batch concurrently and wait for all of them.
    /// `None` means the flow was cancelled while the batch was in flight.
    async fn run_batch(
        &self,
        state: &FlowState,
        batch: &[String],
        control: &FlowControl,
    ) -> Option<Vec<StepOutcome>> {
        let permits = Arc::new(Semaphore::new(self.ctx.config.max_parallel_steps.max(1)));
        let mut outcomes: Vec<Option<StepOutcome>> = batch.iter().map(|_| None).collect();
        let mut running = FuturesUnordered::new();

        for (position, name) in batch.iter().enumerate() {
            let Some(step) = state.step(name).cloned() else {
                outcomes[position] = Some(StepOutcome::failed(
                    ErrorKind::ValidationError,
                    format!("step '{}' is not part of this flow", name),
                ));
                continue;
            };
            let instance = match self.ctx.steps.create_step(&step.step_type, &step.config) {
                Ok(instance) => instance,
                Err(e) => {
                    outcomes[position] = Some(StepOutcome::failed(ErrorKind::StepExecutionError, e.to_string()));
                    continue;
                }
            };

            let mut step_ctx = StepContext::new(state.flow_id, step.name.clone());
            step_ctx.data = state.data.clone();
            step_ctx.config = step.config.clone();
            step_ctx.cancellation = control.token().child_token();

            let permits = Arc::clone(&permits);
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                execute_with_retry(step, instance, step_ctx).await
            });
            running.push(async move { (position, handle.await) });
        }

        loop {
            tokio::select! {
                _ = control.token().cancelled() => {
                    tracing::info!("Flow cancelled with {} step(s) still in flight", running.len());
                    return None;
                }
                next = running.next() => match next {
                    Some((position, Ok(outcome))) => outcomes[position] = Some(outcome),
                    Some((position, Err(join_error))) => {
                        outcomes[position] = Some(StepOutcome::failed(
                            ErrorKind::StepExecutionError,
                            format!("step task aborted: {}", join_error),
                        ));
                    }
                    None => break,
                },
            }
        }

        Some(
            outcomes
                .into_iter()
                .map(|o| o.unwrap_or_else(|| StepOutcome::failed(ErrorKind::StepExecutionError, "no outcome")))
                .collect(),
        )
    }

    /// Fold a settled batch into the flow state. Returns a pause requested by
    /// one of the steps, if any.
    fn apply_outcomes(
        &self,
        state: &mut FlowState,
        batch: &[String],
        outcomes: Vec<StepOutcome>,
    ) -> Result<Option<PauseCondition>, FlowError> {
        let mut pause = None;
        let now = Utc::now();

        for (name, outcome) in batch.iter().zip(outcomes) {
            for (attempt, message) in outcome.retried.iter().enumerate() {
                state.record(
                    FlowEvent::new(
                        FlowEventType::StepRetried,
                        format!("Step '{}' attempt {} failed, retrying: {}", name, attempt + 1, message),
                    )
                    .with_data("step", name.as_str())
                    .with_data("attempt", (attempt + 1) as i64),
                );
            }

            let Some(step) = state.step(name).cloned() else { continue };

            match outcome.kind {
                OutcomeKind::Succeeded(result) => {
                    state.merge_data(select_outputs(&step, &result.data));
                    let decision = if step.branches.is_empty() {
                        None
                    } else {
                        Some(choose_branch(&step.branches, &state.data, &self.ctx.predicates))
                    };
                    if let Some(condition) = &result.pause {
                        pause.get_or_insert_with(|| condition.clone());
                    }
                    if let Some(slot) = state.step_mut(name) {
                        slot.status = StepStatus::Completed;
                        slot.attempts = outcome.attempts;
                        slot.completed_at = Some(now);
                        slot.result = Some(result.clone());
                    }
                    tracing::info!("Step '{}' completed after {} attempt(s)", name, outcome.attempts);
                    state.record(
                        FlowEvent::new(FlowEventType::StepCompleted, format!("Step '{}' completed: {}", name, result.message))
                            .with_data("step", name.as_str())
                            .with_data("attempts", outcome.attempts as i64),
                    );
                    if let Some(choice) = decision {
                        state.branch_decisions.insert(name.clone(), choice);
                        let description = match choice {
                            Some(index) => format!(
                                "Step '{}' took branch {} -> [{}]",
                                name,
                                index,
                                step.branches[index].steps.join(", ")
                            ),
                            None => format!("Step '{}' matched no branch", name),
                        };
                        let mut event = FlowEvent::new(FlowEventType::BranchEvaluated, description)
                            .with_data("step", name.as_str());
                        if let Some(index) = choice {
                            event = event.with_data("branch", index as i64);
                        }
                        state.record(event);
                    }
                }
                OutcomeKind::Waiting(result) => {
                    if let Some(condition) = &result.pause {
                        pause.get_or_insert_with(|| condition.clone());
                    }
                    if let Some(slot) = state.step_mut(name) {
                        slot.status = StepStatus::Pending;
                        slot.attempts = outcome.attempts;
                        slot.started_at = None;
                        slot.result = Some(result.clone());
                    }
                    tracing::info!("Step '{}' is waiting: {}", name, result.message);
                }
                OutcomeKind::Failed { kind, message } => {
                    let error = ErrorInfo::new(kind, message.clone(), Some(name.clone()));
                    if let Some(slot) = state.step_mut(name) {
                        slot.status = StepStatus::Failed;
                        slot.attempts = outcome.attempts;
                        slot.completed_at = Some(now);
                        slot.error = Some(error.clone());
                    }
                    tracing::warn!("Step '{}' failed after {} attempt(s): {}", name, outcome.attempts, message);
                    state.record(
                        FlowEvent::new(FlowEventType::StepFailed, format!("Step '{}' failed: {}", name, message))
                            .with_data("step", name.as_str())
                            .with_data("kind", kind.to_string()),
                    );

                    if step.is_critical && state.status == FlowStatus::Running {
                        state.last_error = Some(error);
                        state.transition(FlowStatus::Failed)?;
                        state.record(
                            FlowEvent::new(
                                FlowEventType::FlowFailed,
                                format!("Flow failed at critical step '{}': {}", name, message),
                            )
                            .with_data("step", name.as_str()),
                        );
                    }
                }
            }
        }

        Ok(pause)
    }
}

/// Attach an executor to the flow in the background.
pub(crate) async fn spawn_executor(ctx: &Arc<EngineContext>, flow_id: FlowId) {
    let executor = FlowExecutor::new(Arc::clone(ctx));
    ctx.executors
        .attach(flow_id, move |control| async move {
            match executor.run(flow_id, control).await {
                Ok(status) => tracing::debug!(%flow_id, "Executor finished with flow {}", status),
                Err(e) => tracing::error!(%flow_id, "Executor stopped with error: {}", e),
            }
        })
        .await;
}

/// First plan batch that has steps ready to run, restricted to those steps.
fn next_batch(state: &FlowState) -> Vec<String> {
    for batch in &state.plan.batches {
        let ready: Vec<String> = batch
            .iter()
            .filter(|name| state.step(name).is_some_and(|s| is_eligible(state, s)))
            .cloned()
            .collect();
        if !ready.is_empty() {
            return ready;
        }
    }
    Vec::new()
}

fn is_eligible(state: &FlowState, step: &StepState) -> bool {
    step.status == StepStatus::Pending
        && step
            .step_dependencies
            .iter()
            .all(|dep| state.step(dep).is_some_and(|d| d.status.is_settled_ok()))
        && step
            .data_dependencies
            .values()
            .all(|producer| state.step(producer).is_some_and(|p| p.status.is_settled_ok()))
        && branch_gate(state, &step.name) == Gate::Open
}

#[derive(Debug, PartialEq)]
enum Gate {
    Open,
    Waiting,
    Closed,
}

fn branch_gate(state: &FlowState, name: &str) -> Gate {
    let Some(owner) = state.branch_owner(name) else {
        return Gate::Open;
    };
    match owner.status {
        StepStatus::Completed => {
            let chosen = state.branch_decisions.get(&owner.name).copied().flatten();
            match chosen.and_then(|index| owner.branches.get(index)) {
                Some(branch) if branch.steps.iter().any(|s| s == name) => Gate::Open,
                _ => Gate::Closed,
            }
        }
        StepStatus::Skipped | StepStatus::Failed => Gate::Closed,
        StepStatus::Pending | StepStatus::Running => Gate::Waiting,
    }
}

fn skip_reason(state: &FlowState, step: &StepState) -> Option<String> {
    if branch_gate(state, &step.name) == Gate::Closed {
        return Some("branch not taken".to_string());
    }
    if let Some((key, producer)) = step.data_dependencies.iter().find(|(key, producer)| {
        state.step(producer).is_some_and(|p| p.status == StepStatus::Skipped)
            && state.data.get(*key).map_or(true, Value::is_null)
    }) {
        return Some(format!("input '{}' from skipped step '{}' will never arrive", key, producer));
    }
    step.step_dependencies
        .iter()
        .chain(step.data_dependencies.values())
        .find(|dep| state.step(dep).is_some_and(|d| d.status == StepStatus::Failed))
        .map(|dep| format!("dependency '{}' failed", dep))
}

/// First matching non-default branch, else the default one, else none.
pub fn choose_branch(branches: &[Branch], data: &DataBag, predicates: &PredicateRegistry) -> Option<usize> {
    branches
        .iter()
        .position(|b| !b.is_default && b.condition.evaluate(data, predicates))
        .or_else(|| branches.iter().position(|b| b.is_default))
}

/// Keys from a step result that land in the data bag.
fn select_outputs(step: &StepState, data: &DataBag) -> DataBag {
    if step.outputs.is_empty() {
        return data.clone();
    }
    data.iter()
        .filter(|(key, _)| {
            let declared = step.outputs.contains(key);
            if !declared {
                tracing::debug!("Step '{}' produced undeclared key '{}'; dropped", step.name, key);
            }
            declared
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

async fn execute_with_retry(step: StepState, instance: Arc<dyn Step>, base: StepContext) -> StepOutcome {
    if let Some((key, producer)) = step
        .data_dependencies
        .iter()
        .find(|(key, _)| base.data.get(*key).map_or(true, Value::is_null))
    {
        return StepOutcome::failed(
            ErrorKind::StepExecutionError,
            format!("required input '{}' from step '{}' is missing", key, producer),
        );
    }

    let cancellation: CancellationToken = base.cancellation.clone();
    let mut retried = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        let mut ctx = base.clone();
        ctx.attempt = attempt;

        let result = match step.timeout_ms {
            Some(millis) => match timeout(Duration::from_millis(millis), instance.execute(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(StepError::Timeout { millis }),
            },
            None => instance.execute(ctx).await,
        };

        let (kind, message) = match result {
            Ok(result) if result.is_success => {
                return StepOutcome {
                    attempts: attempt + 1,
                    retried,
                    kind: OutcomeKind::Succeeded(result),
                };
            }
            Ok(result) if result.pause.is_some() => {
                return StepOutcome {
                    attempts: attempt + 1,
                    retried,
                    kind: OutcomeKind::Waiting(result),
                };
            }
            Ok(result) => (ErrorKind::StepExecutionError, result.message),
            Err(e) => (e.kind(), e.to_string()),
        };

        if attempt >= step.retry.max_retries {
            return StepOutcome {
                attempts: attempt + 1,
                retried,
                kind: OutcomeKind::Failed { kind, message },
            };
        }

        let delay = step.retry.delay_for(attempt);
        tracing::warn!(
            "Step '{}' attempt {} failed ({}); retrying in {}ms",
            step.name,
            attempt + 1,
            message,
            delay
        );
        retried.push(message);

        tokio::select! {
            _ = sleep(Duration::from_millis(delay)) => {}
            _ = cancellation.cancelled() => {
                return StepOutcome {
                    attempts: attempt + 1,
                    retried,
                    kind: OutcomeKind::Failed {
                        kind: ErrorKind::StepExecutionError,
                        message: StepError::Cancelled.to_string(),
                    },
                };
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::Condition;

    #[test]
    fn default_branch_is_the_fallback() {
        let branches = vec![
            Branch::otherwise(&["standard"]),
            Branch::when(Condition::IsTrue { key: "vip".into() }, &["fast_track"]),
        ];
        let predicates = PredicateRegistry::new();
        let mut data = DataBag::new();
        assert_eq!(choose_branch(&branches, &data, &predicates), Some(0));
        data.insert("vip".into(), Value::Bool(true));
        assert_eq!(choose_branch(&branches, &data, &predicates), Some(1));
        assert_eq!(choose_branch(&branches[1..], &DataBag::new(), &predicates), None);
    }
}
