use crate::{FlowId, FlowState, FlowStatus, PauseReason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Externally visible status change, published after it has been persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub flow_id: FlowId,
    pub flow_type: String,
    pub status: FlowStatus,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub current_step_name: Option<String>,
    pub pause_reason: Option<PauseReason>,
    pub timestamp: DateTime<Utc>,
}

impl StatusChange {
    pub fn of(state: &FlowState) -> Self {
        Self {
            flow_id: state.flow_id,
            flow_type: state.flow_type.clone(),
            status: state.status,
            user_id: state.user_id.clone(),
            correlation_id: state.correlation_id.clone(),
            current_step_name: state.current_step_name.clone(),
            pause_reason: state.pause_reason,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
#[error("Notification failed: {0}")]
pub struct NotifyError(pub String);

/// Fire-and-forget channel informing clients of status changes.
///
/// Failures are logged by the engine and never undo a transition.
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify_status_changed(&self, change: &StatusChange) -> Result<(), NotifyError>;
}

/// Publish a change, logging and swallowing any notifier failure.
pub async fn notify_quietly(notifier: &dyn StatusNotifier, state: &FlowState) {
    let change = StatusChange::of(state);
    if let Err(e) = notifier.notify_status_changed(&change).await {
        tracing::warn!(flow_id = %state.flow_id, status = %state.status, "{}", e);
    }
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl StatusNotifier for NoopNotifier {
    async fn notify_status_changed(&self, _change: &StatusChange) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// In-process fan-out of status changes over a broadcast channel
pub struct BroadcastNotifier {
    sender: broadcast::Sender<StatusChange>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl StatusNotifier for BroadcastNotifier {
    async fn notify_status_changed(&self, change: &StatusChange) -> Result<(), NotifyError> {
        // No subscribers is not an error for a fire-and-forget channel.
        let _ = self.sender.send(change.clone());
        Ok(())
    }
}
