mod common;

use common::{assert_status, bag, Harness};
use flowcore::{DataBag, FlowDefinition, FlowEventType, FlowId, FlowStatus, PauseReason, StepSpec, StepStatus, Value};
use flowruntime::{BatchOperation, NewFlow, OperationError};

fn slow_chain() -> FlowDefinition {
    FlowDefinition::new("slow_chain")
        .with_step(StepSpec::new("a", "test.ok").with_config("delay_ms", 100.0))
        .with_step(StepSpec::new("b", "test.ok").depends_on("a"))
        .with_step(StepSpec::new("c", "test.ok").depends_on("b"))
}

fn retryable() -> FlowDefinition {
    FlowDefinition::new("retryable")
        .with_step(StepSpec::new("a", "test.ok"))
        .with_step(StepSpec::new("b", "test.fail_first").depends_on("a"))
        .with_step(StepSpec::new("c", "test.ok").depends_on("b"))
}

#[tokio::test]
async fn test_pause_is_honoured_at_the_batch_boundary() {
    let h = Harness::new();
    h.register(slow_chain()).await;
    let flow_id = h.run("slow_chain", DataBag::new()).await;

    h.log.wait_for("a").await;
    let requested = h.engine.pause(flow_id, Some("audit".into())).await.unwrap();
    assert_eq!(requested.status, FlowStatus::Running);
    assert!(requested.pause_requested);

    let paused = h.settle(flow_id).await;
    assert_status(&paused, FlowStatus::Paused);
    assert_eq!(paused.pause_reason, Some(PauseReason::ManualIntervention));
    assert_eq!(paused.pause_message.as_deref(), Some("audit"));
    assert_eq!(paused.current_step_name.as_deref(), Some("b"));

    let state = h.state(flow_id).await;
    assert_eq!(state.step("a").unwrap().status, StepStatus::Completed);
    assert!(state.running_steps().is_empty());
    assert!(state.paused_at.is_some());
}

#[tokio::test]
async fn test_resume_merges_data_and_continues_from_the_paused_step() {
    let h = Harness::new();
    h.register(slow_chain()).await;
    let flow_id = h.run("slow_chain", DataBag::new()).await;
    h.log.wait_for("a").await;
    h.engine.pause(flow_id, None).await.unwrap();
    assert_status(&h.settle(flow_id).await, FlowStatus::Paused);

    let resumed = h
        .engine
        .resume(flow_id, Some(bag(&[("approved_by", Value::from("ops"))])))
        .await
        .unwrap();
    assert_eq!(resumed.pause_reason, None);

    let done = h.settle(flow_id).await;
    assert_status(&done, FlowStatus::Completed);
    assert_eq!(h.log.entries(), vec!["a", "b", "c"]);

    let state = h.state(flow_id).await;
    assert_eq!(state.data.get("approved_by"), Some(&Value::from("ops")));
    assert!(state.events.iter().any(|e| e.event_type == FlowEventType::FlowResumed));
}

#[tokio::test]
async fn test_waiting_step_reruns_after_resume() {
    let h = Harness::new();
    h.register(
        FlowDefinition::new("gate")
            .with_step(StepSpec::new("gate", "test.wait"))
            .with_step(StepSpec::new("after", "test.ok").depends_on("gate")),
    )
    .await;

    let paused = h.run_to_rest("gate", DataBag::new()).await;
    assert_status(&paused, FlowStatus::Paused);
    assert_eq!(paused.pause_reason, Some(PauseReason::ExternalWait));
    assert_eq!(paused.current_step_name.as_deref(), Some("gate"));
    assert_eq!(h.state(paused.flow_id).await.step("gate").unwrap().status, StepStatus::Pending);

    h.engine
        .resume(paused.flow_id, Some(bag(&[("go", Value::Bool(true))])))
        .await
        .unwrap();
    assert_status(&h.settle(paused.flow_id).await, FlowStatus::Completed);
    assert_eq!(h.log.count("gate"), 2);
}

#[tokio::test]
async fn test_cancel_stops_a_running_flow() {
    let h = Harness::new();
    h.register(
        FlowDefinition::new("long")
            .with_step(StepSpec::new("a", "test.ok").with_config("delay_ms", 10_000.0))
            .with_step(StepSpec::new("b", "test.ok").depends_on("a")),
    )
    .await;
    let flow_id = h.run("long", DataBag::new()).await;
    h.log.wait_for("a").await;

    let cancelled = h.engine.cancel(flow_id, Some("customer withdrew".into())).await.unwrap();
    assert_status(&cancelled, FlowStatus::Cancelled);

    let settled = h.settle(flow_id).await;
    assert_status(&settled, FlowStatus::Cancelled);
    assert!(settled.completed_at.is_some());
    assert_eq!(h.log.count("b"), 0);

    let err = h.engine.cancel(flow_id, None).await.unwrap_err();
    assert!(matches!(err, OperationError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_cancel_pending_flow() {
    let h = Harness::new();
    h.register(slow_chain()).await;
    let created = h.engine.create_flow("slow_chain", NewFlow::default()).await.unwrap();
    assert_status(&created, FlowStatus::Pending);

    let cancelled = h.engine.cancel(created.flow_id, None).await.unwrap();
    assert_status(&cancelled, FlowStatus::Cancelled);
    assert!(h.log.entries().is_empty());
}

#[tokio::test]
async fn test_retry_resets_only_the_failed_step() {
    let h = Harness::new();
    h.register(retryable()).await;

    let failed = h.run_to_rest("retryable", DataBag::new()).await;
    assert_status(&failed, FlowStatus::Failed);
    assert_eq!(failed.last_error.as_ref().unwrap().step_name.as_deref(), Some("b"));

    let retried = h.engine.retry(failed.flow_id).await.unwrap();
    assert!(retried.last_error.is_none());
    let done = h.settle(failed.flow_id).await;
    assert_status(&done, FlowStatus::Completed);

    assert_eq!(h.log.count("a"), 1);
    assert_eq!(h.log.count("b"), 2);
    assert_eq!(h.log.count("c"), 1);
    let state = h.state(failed.flow_id).await;
    assert!(state.events.iter().any(|e| e.event_type == FlowEventType::FlowRetried));
}

#[tokio::test]
async fn test_retry_resets_every_failed_critical_step_of_a_batch() {
    let h = Harness::new();
    h.register(
        FlowDefinition::new("pair")
            .with_step(StepSpec::new("a", "test.fail_first").parallel())
            .with_step(StepSpec::new("b", "test.fail_first").parallel())
            .with_step(StepSpec::new("join", "test.ok").depends_on("a").depends_on("b")),
    )
    .await;

    let failed = h.run_to_rest("pair", DataBag::new()).await;
    assert_status(&failed, FlowStatus::Failed);
    let state = h.state(failed.flow_id).await;
    assert_eq!(state.step("a").unwrap().status, StepStatus::Failed);
    assert_eq!(state.step("b").unwrap().status, StepStatus::Failed);

    h.engine.retry(failed.flow_id).await.unwrap();
    assert_status(&h.settle(failed.flow_id).await, FlowStatus::Completed);
    assert_eq!(h.log.count("a"), 2);
    assert_eq!(h.log.count("b"), 2);
    assert_eq!(h.log.count("join"), 1);
}

#[tokio::test]
async fn test_flow_with_a_failed_critical_step_never_completes() {
    let h = Harness::new();
    h.register(
        FlowDefinition::new("stubborn")
            .with_step(StepSpec::new("a", "test.fail_first").parallel())
            .with_step(StepSpec::new("b", "test.fail").parallel()),
    )
    .await;

    let failed = h.run_to_rest("stubborn", DataBag::new()).await;
    assert_status(&failed, FlowStatus::Failed);

    h.engine.retry(failed.flow_id).await.unwrap();
    let settled = h.settle(failed.flow_id).await;
    assert_status(&settled, FlowStatus::Failed);
    assert_eq!(settled.last_error.as_ref().unwrap().step_name.as_deref(), Some("b"));

    let state = h.state(failed.flow_id).await;
    assert_eq!(state.step("a").unwrap().status, StepStatus::Completed);
    assert_eq!(state.step("b").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_resolve_closes_a_failed_flow_without_running_steps() {
    let h = Harness::new();
    h.register(retryable()).await;
    let failed = h.run_to_rest("retryable", DataBag::new()).await;

    let resolved = h.engine.resolve(failed.flow_id, "refunded by hand").await.unwrap();
    assert_status(&resolved, FlowStatus::Resolved);
    assert_eq!(resolved.resolution_note.as_deref(), Some("refunded by hand"));
    assert_eq!(h.log.count("c"), 0);

    let state = h.state(failed.flow_id).await;
    assert_eq!(state.step("b").unwrap().status, StepStatus::Failed);

    let err = h.engine.retry(failed.flow_id).await.unwrap_err();
    assert!(matches!(err, OperationError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_illegal_commands_are_rejected() {
    let h = Harness::new();
    h.register(FlowDefinition::new("tiny").with_step(StepSpec::new("only", "test.ok"))).await;
    let done = h.run_to_rest("tiny", DataBag::new()).await;
    assert_status(&done, FlowStatus::Completed);

    for result in [
        h.engine.pause(done.flow_id, None).await,
        h.engine.resume(done.flow_id, None).await,
        h.engine.resolve(done.flow_id, "n/a").await,
        h.engine.retry(done.flow_id).await,
        h.engine.start_flow(done.flow_id).await,
    ] {
        assert!(matches!(result, Err(OperationError::InvalidTransition(_))), "{:?}", result);
    }
    assert_status(&h.engine.get_summary(done.flow_id).await.unwrap(), FlowStatus::Completed);

    let missing = FlowId::new_v4();
    assert_eq!(h.engine.resume(missing, None).await.unwrap_err(), OperationError::NotFound(missing));
    assert!(matches!(
        h.engine.create_flow("nope", NewFlow::default()).await,
        Err(OperationError::Definition(_))
    ));
}

#[tokio::test]
async fn test_batch_operation_reports_each_flow_in_order() {
    let h = Harness::new();
    h.register(retryable()).await;
    h.register(FlowDefinition::new("tiny").with_step(StepSpec::new("only", "test.ok"))).await;

    let failed = h.run_to_rest("retryable", DataBag::new()).await.flow_id;
    let completed = h.run_to_rest("tiny", DataBag::new()).await.flow_id;
    let missing = FlowId::new_v4();

    let report = h
        .engine
        .batch_operation(
            &[completed, failed, missing],
            BatchOperation::Resolve {
                note: "bulk cleanup".into(),
            },
        )
        .await;

    assert_eq!(report.items.len(), 3);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 2);
    let ids: Vec<FlowId> = report.items.iter().map(|i| i.flow_id).collect();
    assert_eq!(ids, vec![completed, failed, missing]);
    assert!(matches!(report.items[0].outcome, Err(OperationError::InvalidTransition(_))));
    assert_eq!(report.items[1].outcome.as_ref().unwrap().status, FlowStatus::Resolved);
    assert_eq!(report.items[2].outcome, Err(OperationError::NotFound(missing)));
}

#[tokio::test]
async fn test_batch_cancel_covers_mixed_states() {
    let h = Harness::new();
    h.register(slow_chain()).await;
    let pending = h.engine.create_flow("slow_chain", NewFlow::default()).await.unwrap().flow_id;
    let running = h.run("slow_chain", DataBag::new()).await;

    let report = h
        .engine
        .batch_operation(&[pending, running], BatchOperation::Cancel { reason: None })
        .await;
    assert_eq!(report.succeeded(), 2);
    assert_status(&h.settle(running).await, FlowStatus::Cancelled);
    assert_status(&h.settle(pending).await, FlowStatus::Cancelled);
}
