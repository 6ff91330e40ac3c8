//! Operator-facing views of flows and the structured results of commands.

use chrono::{DateTime, Utc};
use flowcore::{
    DataBag, ErrorInfo, FlowError, FlowEventType, FlowId, FlowState, FlowStatus, PauseReason, StepStatus,
    StoreError, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Input for a new flow instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewFlow {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub data: DataBag,
}

impl NewFlow {
    pub fn with_data(data: DataBag) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }
}

/// Compact projection of a flow for listings and command replies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow_id: FlowId,
    pub flow_type: String,
    pub status: FlowStatus,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_step_index: usize,
    pub current_step_name: Option<String>,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub pause_reason: Option<PauseReason>,
    pub pause_message: Option<String>,
    pub resume_after: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorInfo>,
    pub resolution_note: Option<String>,
    /// A pause was accepted and waits for the current batch to settle.
    pub pause_requested: bool,
    pub version: u64,
}

impl FlowSummary {
    pub fn of(state: &FlowState, pause_requested: bool) -> Self {
        Self {
            flow_id: state.flow_id,
            flow_type: state.flow_type.clone(),
            status: state.status,
            user_id: state.user_id.clone(),
            correlation_id: state.correlation_id.clone(),
            created_at: state.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            current_step_index: state.current_step_index,
            current_step_name: state.current_step_name.clone(),
            total_steps: state.steps.len(),
            completed_steps: state
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .count(),
            pause_reason: state.pause_reason,
            pause_message: state.pause_message.clone(),
            resume_after: state.resume_after,
            last_error: state.last_error.clone(),
            resolution_note: state.resolution_note.clone(),
            pause_requested,
            version: state.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: FlowEventType,
    pub description: String,
    pub data: BTreeMap<String, Value>,
}

/// Events in time order. Ties keep their recorded order.
pub fn timeline_of(state: &FlowState) -> Vec<TimelineEntry> {
    let mut entries: Vec<TimelineEntry> = state
        .events
        .iter()
        .map(|e| TimelineEntry {
            timestamp: e.timestamp,
            event_type: e.event_type,
            description: e.description.clone(),
            data: e.data.clone(),
        })
        .collect();
    entries.sort_by_key(|e| e.timestamp);
    entries
}

/// Why an operator command did not go through
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationError {
    #[error("Flow not found: {0}")]
    NotFound(FlowId),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Flow {0} was modified concurrently; try again")]
    Conflict(FlowId),

    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<FlowError> for OperationError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Store(StoreError::NotFound(flow_id)) => OperationError::NotFound(flow_id),
            FlowError::Store(StoreError::ConcurrencyConflict { flow_id, .. }) => OperationError::Conflict(flow_id),
            FlowError::InvalidOperation(message) => OperationError::InvalidTransition(message),
            e @ (FlowError::Definition(_) | FlowError::UnknownFlowType(_) | FlowError::UnknownStepType(_)) => {
                OperationError::Definition(e.to_string())
            }
            e => OperationError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for OperationError {
    fn from(err: StoreError) -> Self {
        FlowError::from(err).into()
    }
}

/// Command applied to every flow of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum BatchOperation {
    Pause {
        #[serde(default)]
        message: Option<String>,
    },
    Resume {
        #[serde(default)]
        data: Option<DataBag>,
    },
    Cancel {
        #[serde(default)]
        reason: Option<String>,
    },
    Resolve {
        note: String,
    },
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub flow_id: FlowId,
    pub outcome: Result<FlowSummary, OperationError>,
}

/// Per-flow outcomes, in the order the ids were given
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub items: Vec<BatchItemResult>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowStatistics {
    pub total: usize,
    pub by_status: BTreeMap<FlowStatus, usize>,
    pub by_flow_type: BTreeMap<String, usize>,
    /// Paused flows only.
    pub by_pause_reason: BTreeMap<PauseReason, usize>,
    /// Mean run time of completed flows, in milliseconds.
    pub average_duration_ms: Option<f64>,
    /// Completed flows over all flows in range; 0 when the range is empty.
    pub success_rate: f64,
}

impl FlowStatistics {
    pub fn compute(flows: &[FlowState]) -> Self {
        let mut stats = FlowStatistics {
            total: flows.len(),
            by_status: FlowStatus::ALL.iter().map(|s| (*s, 0)).collect(),
            ..Self::default()
        };
        let mut durations = Vec::new();

        for flow in flows {
            *stats.by_status.entry(flow.status).or_default() += 1;
            *stats.by_flow_type.entry(flow.flow_type.clone()).or_default() += 1;
            if flow.status == FlowStatus::Paused {
                if let Some(reason) = flow.pause_reason {
                    *stats.by_pause_reason.entry(reason).or_default() += 1;
                }
            }
            if flow.status == FlowStatus::Completed {
                if let Some(ms) = flow.duration_ms() {
                    durations.push(ms as f64);
                }
            }
        }

        if !durations.is_empty() {
            stats.average_duration_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        if stats.total > 0 {
            let completed = stats.by_status.get(&FlowStatus::Completed).copied().unwrap_or(0);
            stats.success_rate = completed as f64 / stats.total as f64;
        }
        stats
    }
}
