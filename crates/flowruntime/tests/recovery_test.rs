mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::{assert_status, Harness};
use flowcore::{
    DataBag, ErrorKind, FlowDefinition, FlowEventType, FlowId, FlowState, FlowStatus, FlowStore, PauseReason,
    StepSpec, StepStatus,
};
use flowruntime::{NewFlow, ResumeCondition};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn payment_flow(idempotent: bool) -> FlowDefinition {
    FlowDefinition::new("payment")
        .with_step(StepSpec::new("reserve", "test.ok"))
        .with_step(StepSpec::new("charge", "test.ok").idempotent(idempotent).depends_on("reserve"))
        .with_step(StepSpec::new("receipt", "test.ok").depends_on("charge"))
}

/// Leave a flow in the store the way a crash mid-step would: `Running`, with
/// `reserve` done and `charge` marked running, and no executor attached.
async fn crashed_flow(h: &Harness) -> FlowId {
    let flow_id = h.engine.create_flow("payment", NewFlow::default()).await.unwrap().flow_id;
    let mut state: FlowState = h.store.load(flow_id).await.unwrap();
    state.status = FlowStatus::Running;
    state.started_at = Some(Utc::now());
    state.step_mut("reserve").unwrap().status = StepStatus::Completed;
    let charge = state.step_mut("charge").unwrap();
    charge.status = StepStatus::Running;
    charge.started_at = Some(Utc::now());
    state.point_cursor_at_next_batch();
    h.store.save(&state).await.unwrap();
    flow_id
}

#[tokio::test]
async fn test_recovery_reruns_interrupted_idempotent_step() {
    let h = Harness::new();
    h.register(payment_flow(true)).await;
    let flow_id = crashed_flow(&h).await;

    let summary = h.engine.recover_crashed_flows().await.unwrap();
    assert_eq!(summary.recovered, vec![flow_id]);
    assert!(summary.failed.is_empty());

    let done = h.settle(flow_id).await;
    assert_status(&done, FlowStatus::Completed);
    assert_eq!(h.log.entries(), vec!["charge", "receipt"]);
    let state = h.state(flow_id).await;
    assert!(state.events.iter().any(|e| e.event_type == FlowEventType::FlowRecovered));
}

#[tokio::test]
async fn test_recovery_fails_unconfirmed_non_idempotent_step() {
    let h = Harness::new();
    h.register(payment_flow(false)).await;
    let flow_id = crashed_flow(&h).await;

    let summary = h.engine.recover_crashed_flows().await.unwrap();
    assert_eq!(summary.failed, vec![flow_id]);
    assert_eq!(summary.recovered_count(), 0);

    let state = h.state(flow_id).await;
    assert_eq!(state.status, FlowStatus::Failed);
    let error = state.last_error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::UnconfirmedStepOnCrash);
    assert_eq!(error.step_name.as_deref(), Some("charge"));
    assert_eq!(state.step("charge").unwrap().status, StepStatus::Failed);
    assert!(h.log.entries().is_empty());

    // An operator who checked the payment provider can retry or resolve it.
    h.engine.retry(flow_id).await.unwrap();
    assert_status(&h.settle(flow_id).await, FlowStatus::Completed);
}

#[tokio::test]
async fn test_recovery_ignores_flows_with_an_attached_executor() {
    let h = Harness::new();
    h.register(
        FlowDefinition::new("busy").with_step(StepSpec::new("a", "test.ok").with_config("delay_ms", 200.0)),
    )
    .await;
    let flow_id = h.run("busy", DataBag::new()).await;
    h.log.wait_for("a").await;

    let summary = h.engine.recover_crashed_flows().await.unwrap();
    assert!(summary.recovered.is_empty() && summary.failed.is_empty());
    assert_status(&h.settle(flow_id).await, FlowStatus::Completed);
    assert_eq!(h.log.count("a"), 1);
}

#[tokio::test]
async fn test_recovery_leaves_claimed_flows_alone() {
    let h = Harness::new();
    h.register(payment_flow(true)).await;
    let flow_id = crashed_flow(&h).await;

    let claim = h.engine.executors().claim(flow_id);
    let summary = h.engine.recover_crashed_flows().await.unwrap();
    assert!(summary.recovered.is_empty() && summary.failed.is_empty() && summary.errors.is_empty());
    let state = h.state(flow_id).await;
    assert!(!state.events.iter().any(|e| e.event_type == FlowEventType::FlowRecovered));
    assert_eq!(state.step("charge").unwrap().status, StepStatus::Running);

    drop(claim);
    let summary = h.engine.recover_crashed_flows().await.unwrap();
    assert_eq!(summary.recovered, vec![flow_id]);
    assert_status(&h.settle(flow_id).await, FlowStatus::Completed);
}

#[tokio::test]
async fn test_start_recovers_between_checkpoint_crash() {
    let h = Harness::new();
    h.register(payment_flow(true)).await;
    let flow_id = h.engine.create_flow("payment", NewFlow::default()).await.unwrap().flow_id;
    let mut state = h.store.load(flow_id).await.unwrap();
    state.status = FlowStatus::Running;
    h.store.save(&state).await.unwrap();

    let summary = h.engine.start().await.unwrap();
    assert_eq!(summary.recovered, vec![flow_id]);
    assert_status(&h.settle(flow_id).await, FlowStatus::Completed);
    assert!(h.engine.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_recovered_flow_with_a_failed_critical_step_fails_instead_of_completing() {
    let h = Harness::new();
    h.register(payment_flow(true)).await;
    let flow_id = h.engine.create_flow("payment", NewFlow::default()).await.unwrap().flow_id;
    let mut state = h.store.load(flow_id).await.unwrap();
    state.status = FlowStatus::Running;
    state.started_at = Some(Utc::now());
    state.step_mut("reserve").unwrap().status = StepStatus::Completed;
    state.step_mut("charge").unwrap().status = StepStatus::Failed;
    state.step_mut("receipt").unwrap().status = StepStatus::Skipped;
    h.store.save(&state).await.unwrap();

    let summary = h.engine.recover_crashed_flows().await.unwrap();
    assert_eq!(summary.recovered, vec![flow_id]);

    let settled = h.settle(flow_id).await;
    assert_status(&settled, FlowStatus::Failed);
    assert_eq!(settled.last_error.as_ref().unwrap().step_name.as_deref(), Some("charge"));
    assert!(settled.completed_at.is_none());
    assert!(h.log.entries().is_empty());
}

fn checkpoint_flow(resume_after_ms: Option<f64>) -> FlowDefinition {
    let mut first = StepSpec::new("a", "test.pause_after");
    if let Some(ms) = resume_after_ms {
        first = first.with_config("resume_after_ms", ms);
    }
    FlowDefinition::new("checkpoint")
        .with_step(first)
        .with_step(StepSpec::new("b", "test.ok").depends_on("a"))
}

#[tokio::test]
async fn test_auto_resume_waits_until_resume_after() {
    let h = Harness::new();
    h.register(checkpoint_flow(Some(100.0))).await;
    let paused = h.run_to_rest("checkpoint", DataBag::new()).await;
    assert_status(&paused, FlowStatus::Paused);
    assert!(paused.resume_after.is_some());

    let early = h.engine.run_auto_resume_once().await.unwrap();
    assert_eq!((early.examined, early.resumed, early.skipped), (1, 0, 1));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let due = h.engine.run_auto_resume_once().await.unwrap();
    assert_eq!(due.resumed, 1);
    assert_status(&h.settle(paused.flow_id).await, FlowStatus::Completed);
}

#[tokio::test]
async fn test_auto_resume_without_deadline_or_condition_leaves_flow_paused() {
    let h = Harness::new();
    h.register(checkpoint_flow(None)).await;
    let paused = h.run_to_rest("checkpoint", DataBag::new()).await;

    let report = h.engine.run_auto_resume_once().await.unwrap();
    assert_eq!(report.resumed, 0);
    assert_eq!(report.skipped, 1);
    assert_status(&h.engine.get_summary(paused.flow_id).await.unwrap(), FlowStatus::Paused);
}

#[tokio::test]
async fn test_registered_resume_condition_decides() {
    let ready = Arc::new(AtomicBool::new(false));
    let flag = ready.clone();
    let h = Harness::with(move |builder| {
        builder.resume_condition(
            PauseReason::ExternalWait,
            Arc::new(move |_state: &FlowState| flag.load(Ordering::SeqCst)),
        )
    });
    h.register(checkpoint_flow(None)).await;
    let paused = h.run_to_rest("checkpoint", DataBag::new()).await;

    assert_eq!(h.engine.run_auto_resume_once().await.unwrap().resumed, 0);
    ready.store(true, Ordering::SeqCst);
    assert_eq!(h.engine.run_auto_resume_once().await.unwrap().resumed, 1);
    assert_status(&h.settle(paused.flow_id).await, FlowStatus::Completed);
}

/// Holds the sweep between its decision and its resume until released.
#[derive(Default)]
struct HeldCondition {
    evaluated: Notify,
    release: Notify,
}

#[async_trait]
impl ResumeCondition for HeldCondition {
    async fn should_resume(&self, _state: &FlowState) -> bool {
        self.evaluated.notify_one();
        self.release.notified().await;
        true
    }
}

#[tokio::test]
async fn test_auto_resume_skips_a_flow_resumed_manually_in_the_meantime() {
    let condition = Arc::new(HeldCondition::default());
    let held: Arc<dyn ResumeCondition> = condition.clone();
    let h = Harness::with(move |builder| builder.resume_condition(PauseReason::ExternalWait, held));
    h.register(checkpoint_flow(None)).await;
    let paused = h.run_to_rest("checkpoint", DataBag::new()).await;
    assert_status(&paused, FlowStatus::Paused);

    let (sweep, manual) = tokio::join!(h.engine.run_auto_resume_once(), async {
        condition.evaluated.notified().await;
        let resumed = h.engine.resume(paused.flow_id, None).await;
        condition.release.notify_one();
        resumed
    });
    assert_status(&manual.unwrap(), FlowStatus::Running);
    let report = sweep.unwrap();
    assert_eq!((report.examined, report.resumed, report.skipped, report.errors), (1, 0, 1, 0));

    assert_status(&h.settle(paused.flow_id).await, FlowStatus::Completed);
    assert_eq!(h.log.count("a"), 1);
    assert_eq!(h.log.count("b"), 1);
    let state = h.state(paused.flow_id).await;
    let resumes = state.events.iter().filter(|e| e.event_type == FlowEventType::FlowResumed).count();
    assert_eq!(resumes, 1);
}

#[tokio::test]
async fn test_manual_pause_is_never_auto_resumed() {
    let h = Harness::with(|builder| builder.resume_condition(PauseReason::ManualIntervention, Arc::new(|_: &FlowState| true)));
    h.register(checkpoint_flow(None)).await;
    let created = h.engine.create_flow("checkpoint", NewFlow::default()).await.unwrap();
    let mut state = h.store.load(created.flow_id).await.unwrap();
    state.status = FlowStatus::Running;
    h.store.save(&state).await.unwrap();
    h.engine.pause(created.flow_id, Some("hold".into())).await.unwrap();

    let report = h.engine.run_auto_resume_once().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_status(&h.engine.get_summary(created.flow_id).await.unwrap(), FlowStatus::Paused);
}

#[tokio::test]
async fn test_background_loop_resumes_due_flows() {
    let h = Harness::new();
    h.register(checkpoint_flow(Some(30.0))).await;
    h.engine.start().await.unwrap();

    let flow_id = h.run("checkpoint", DataBag::new()).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let summary = h.engine.get_summary(flow_id).await.unwrap();
            if summary.status == FlowStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("auto-resume loop never completed the flow");
    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_parks_running_flows_for_later() {
    let h = Harness::new();
    h.register(
        FlowDefinition::new("nightly")
            .with_step(StepSpec::new("a", "test.ok").with_config("delay_ms", 100.0))
            .with_step(StepSpec::new("b", "test.ok").depends_on("a")),
    )
    .await;
    let flow_id = h.run("nightly", DataBag::new()).await;
    h.log.wait_for("a").await;

    let stragglers = h.engine.shutdown().await;
    assert!(stragglers.is_empty());
    let parked = h.engine.get_summary(flow_id).await.unwrap();
    assert_status(&parked, FlowStatus::Paused);
    assert_eq!(parked.pause_reason, Some(PauseReason::Shutdown));
    assert_eq!(h.log.count("b"), 0);

    let report = h.engine.run_auto_resume_once().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_status(&h.settle(flow_id).await, FlowStatus::Completed);
}
