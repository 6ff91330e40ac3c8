//! Periodic sweep that resumes flows paused for reasons the engine can lift
//! on its own.

use crate::commands::resume_flow;
use crate::EngineContext;
use async_trait::async_trait;
use chrono::Utc;
use flowcore::{query_all, FlowError, FlowFilter, FlowState, FlowStatus, PauseReason};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Decides whether a paused flow is ready to continue.
#[async_trait]
pub trait ResumeCondition: Send + Sync {
    async fn should_resume(&self, state: &FlowState) -> bool;
}

#[async_trait]
impl<F> ResumeCondition for F
where
    F: Fn(&FlowState) -> bool + Send + Sync,
{
    async fn should_resume(&self, state: &FlowState) -> bool {
        self(state)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoResumeReport {
    pub examined: usize,
    pub resumed: usize,
    /// Not yet due, or lost a race with another writer.
    pub skipped: usize,
    pub errors: usize,
}

pub struct AutoResumeService {
    ctx: Arc<EngineContext>,
    conditions: HashMap<PauseReason, Arc<dyn ResumeCondition>>,
}

impl AutoResumeService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            conditions: HashMap::new(),
        }
    }

    pub fn with_condition(mut self, reason: PauseReason, condition: Arc<dyn ResumeCondition>) -> Self {
        self.conditions.insert(reason, condition);
        self
    }

    async fn is_due(&self, state: &FlowState) -> bool {
        let Some(reason) = state.pause_reason.filter(|r| r.is_auto_resumable()) else {
            return false;
        };
        if state.resume_after.is_some_and(|at| at > Utc::now()) {
            return false;
        }
        match self.conditions.get(&reason) {
            Some(condition) => condition.should_resume(state).await,
            None => state.resume_after.is_some() || reason == PauseReason::Shutdown,
        }
    }

    /// One sweep over every paused flow.
    pub async fn run_once(&self) -> Result<AutoResumeReport, FlowError> {
        let filter = FlowFilter {
            pause_reasons: vec![
                PauseReason::ExternalWait,
                PauseReason::ErrorThrottle,
                PauseReason::Scheduled,
                PauseReason::Shutdown,
            ],
            ..FlowFilter::with_status(FlowStatus::Paused)
        };
        let paused = query_all(self.ctx.store.as_ref(), &filter).await?;
        let mut report = AutoResumeReport {
            examined: paused.len(),
            ..AutoResumeReport::default()
        };

        for flow in paused {
            if !self.is_due(&flow).await {
                report.skipped += 1;
                continue;
            }
            match resume_flow(&self.ctx, flow.flow_id, None).await {
                Ok(_) => {
                    tracing::info!(flow_id = %flow.flow_id, "Auto-resumed flow paused for {:?}", flow.pause_reason);
                    report.resumed += 1;
                }
                Err(e) if matches!(e, FlowError::InvalidOperation(_)) || e.is_conflict() => {
                    tracing::debug!(flow_id = %flow.flow_id, "Auto-resume skipped: {}", e);
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(flow_id = %flow.flow_id, "Auto-resume failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        if report.resumed > 0 || report.errors > 0 {
            tracing::info!(
                "Auto-resume sweep: {} examined, {} resumed, {} skipped, {} errors",
                report.examined,
                report.resumed,
                report.skipped,
                report.errors
            );
        }
        Ok(report)
    }

    /// Sweep on an interval until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.ctx.config.auto_resume_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Auto-resume loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!("Auto-resume sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
