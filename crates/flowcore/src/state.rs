//! Durable, mutable execution state of a flow instance.

use crate::{
    Branch, DataBag, ErrorKind, ExecutionPlan, FlowDefinition, FlowError, RetryPolicy, Value,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

pub type FlowId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlowStatus {
    Pending,
    Running,
    Paused,
    Failed,
    Completed,
    Cancelled,
    Resolved,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Cancelled | FlowStatus::Resolved)
    }

    /// The only status edges a flow may take.
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Failed)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Failed, Running)
                | (Failed, Resolved)
                | (Failed, Cancelled)
        )
    }

    pub const ALL: [FlowStatus; 7] = [
        FlowStatus::Pending,
        FlowStatus::Running,
        FlowStatus::Paused,
        FlowStatus::Failed,
        FlowStatus::Completed,
        FlowStatus::Cancelled,
        FlowStatus::Resolved,
    ];
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::str::FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlowStatus::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown flow status '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Satisfies a dependent step's ordering requirement.
    pub fn is_settled_ok(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PauseReason {
    ManualIntervention,
    ExternalWait,
    ErrorThrottle,
    Scheduled,
    Shutdown,
}

impl PauseReason {
    /// Whether the auto-resume loop may ever lift a pause with this reason.
    pub fn is_auto_resumable(self) -> bool {
        !matches!(self, PauseReason::ManualIntervention)
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Reason, message and optional wake-up time recorded on pause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseCondition {
    pub reason: PauseReason,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub resume_after: Option<DateTime<Utc>>,
}

impl PauseCondition {
    pub fn new(reason: PauseReason) -> Self {
        Self {
            reason,
            message: None,
            resume_after: None,
        }
    }

    pub fn manual(message: impl Into<String>) -> Self {
        Self::new(PauseReason::ManualIntervention).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn until(mut self, resume_after: DateTime<Utc>) -> Self {
        self.resume_after = Some(resume_after);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub step_name: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>, step_name: Option<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_name,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowEventType {
    FlowCreated,
    FlowStarted,
    StepStarted,
    StepCompleted,
    StepRetried,
    StepFailed,
    StepSkipped,
    BranchEvaluated,
    FlowPaused,
    FlowResumed,
    FlowCancelled,
    FlowResolved,
    FlowRetried,
    FlowRecovered,
    FlowFailed,
    FlowCompleted,
}

/// Audit trail entry. Appended, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub event_id: Uuid,
    pub event_type: FlowEventType,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl FlowEvent {
    pub fn new(event_type: FlowEventType, description: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            description: description.into(),
            timestamp: Utc::now(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Output of one step execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub is_success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: DataBag,
    /// Asks the engine to pause the flow once the current batch settles.
    #[serde(default)]
    pub pause: Option<PauseCondition>,
}

impl StepResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            is_success: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            message: message.into(),
            ..Self::default()
        }
    }

    /// Not done yet: re-run this step after the flow resumes.
    pub fn wait(condition: PauseCondition) -> Self {
        Self {
            is_success: false,
            message: condition.message.clone().unwrap_or_else(|| "waiting".to_string()),
            data: DataBag::new(),
            pause: Some(condition),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn then_pause(mut self, condition: PauseCondition) -> Self {
        self.pause = Some(condition);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub step_type: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    pub status: StepStatus,
    #[serde(default)]
    pub step_dependencies: BTreeSet<String>,
    #[serde(default)]
    pub data_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub is_critical: bool,
    pub is_idempotent: bool,
    pub can_run_in_parallel: bool,
    #[serde(default)]
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub result: Option<StepResult>,
}

impl StepState {
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.attempts = 0;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.result = None;
    }
}

/// One durable record per flow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub flow_id: FlowId,
    pub flow_type: String,
    pub status: FlowStatus,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    pub current_step_index: usize,
    #[serde(default)]
    pub current_step_name: Option<String>,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    #[serde(default)]
    pub pause_message: Option<String>,
    #[serde(default)]
    pub resume_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<ErrorInfo>,
    #[serde(default)]
    pub resolution_note: Option<String>,
    #[serde(default)]
    pub data: DataBag,
    #[serde(default)]
    pub events: Vec<FlowEvent>,
    pub steps: Vec<StepState>,
    pub plan: ExecutionPlan,
    /// Branching step -> index of the branch taken (`None`: no branch matched).
    #[serde(default)]
    pub branch_decisions: BTreeMap<String, Option<usize>>,
    /// Optimistic-concurrency sequence, bumped by every successful save.
    #[serde(default)]
    pub version: u64,
}

impl FlowState {
    /// Instantiate a definition whose plan has already been resolved.
    pub fn instantiate(definition: &FlowDefinition, plan: ExecutionPlan, data: DataBag) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|spec| StepState {
                name: spec.name.clone(),
                step_type: spec.step_type.clone(),
                config: spec.config.clone(),
                status: StepStatus::Pending,
                step_dependencies: spec.step_dependencies.clone(),
                data_dependencies: spec.data_dependencies.clone(),
                outputs: spec.outputs.clone(),
                retry: spec.retry.clone(),
                timeout_ms: spec.timeout_ms,
                is_critical: spec.is_critical,
                is_idempotent: spec.is_idempotent,
                can_run_in_parallel: spec.can_run_in_parallel,
                branches: spec.branches.clone(),
                attempts: 0,
                started_at: None,
                completed_at: None,
                error: None,
                result: None,
            })
            .collect();

        let mut state = Self {
            flow_id: Uuid::new_v4(),
            flow_type: definition.flow_type.clone(),
            status: FlowStatus::Pending,
            user_id: None,
            correlation_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            paused_at: None,
            current_step_index: 0,
            current_step_name: None,
            pause_reason: None,
            pause_message: None,
            resume_after: None,
            last_error: None,
            resolution_note: None,
            data,
            events: Vec::new(),
            steps,
            plan,
            branch_decisions: BTreeMap::new(),
            version: 0,
        };
        state.point_cursor_at_next_batch();
        state.record(FlowEvent::new(
            FlowEventType::FlowCreated,
            format!("Flow '{}' created", state.flow_type),
        ));
        state
    }

    /// Move along a declared status edge, or refuse.
    pub fn transition(&mut self, next: FlowStatus) -> Result<(), FlowError> {
        if !self.status.can_transition_to(next) {
            return Err(FlowError::InvalidOperation(format!(
                "flow {} cannot move from {} to {}",
                self.flow_id, self.status, next
            )));
        }
        tracing::debug!(flow_id = %self.flow_id, from = %self.status, to = %next, "flow transition");
        self.status = next;
        Ok(())
    }

    pub fn record(&mut self, event: FlowEvent) {
        self.events.push(event);
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// The step whose branches decide whether `name` runs.
    pub fn branch_owner(&self, name: &str) -> Option<&StepState> {
        self.steps
            .iter()
            .find(|s| s.branches.iter().any(|b| b.steps.iter().any(|t| t == name)))
    }

    pub fn running_steps(&self) -> Vec<&StepState> {
        self.steps.iter().filter(|s| s.status == StepStatus::Running).collect()
    }

    pub fn has_pending_steps(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Pending)
    }

    /// Point the cursor at the first step of the first batch that still has work.
    pub fn point_cursor_at_next_batch(&mut self) {
        let next = self.plan.batches.iter().find_map(|batch| {
            batch.iter().find(|name| {
                self.step(name)
                    .is_some_and(|s| matches!(s.status, StepStatus::Pending | StepStatus::Running))
            })
        });
        match next.cloned() {
            Some(name) => {
                self.current_step_index = self.step_index(&name).unwrap_or(0);
                self.current_step_name = Some(name);
            }
            None => {
                self.current_step_index = self.steps.len();
                self.current_step_name = None;
            }
        }
    }

    pub fn merge_data(&mut self, data: DataBag) {
        self.data.extend(data);
    }

    pub fn apply_pause(&mut self, condition: &PauseCondition) {
        self.paused_at = Some(Utc::now());
        self.pause_reason = Some(condition.reason);
        self.pause_message = condition.message.clone();
        self.resume_after = condition.resume_after;
    }

    pub fn clear_pause(&mut self) {
        self.paused_at = None;
        self.pause_reason = None;
        self.pause_message = None;
        self.resume_after = None;
    }

    /// Wall-clock run time, for flows that have both start and end stamps.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
