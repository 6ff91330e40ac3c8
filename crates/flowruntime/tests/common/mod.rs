#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use flowcore::{
    DataBag, FlowDefinition, FlowId, FlowState, FlowStatus, PauseCondition, PauseReason, PredicateRegistry, Step,
    StepContext, StepError, StepResult, Value,
};
use flowruntime::{EngineConfig, FlowEngine, FlowEngineBuilder, FlowSummary, InMemoryFlowStore, NewFlow, StepRegistry};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared record of which steps ran, in call order
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, step: &str) {
        self.0.lock().unwrap().push(step.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, step: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|s| *s == step).count()
    }

    /// Poll until `step` has been called at least once.
    pub async fn wait_for(&self, step: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.count(step) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("step '{}' never started", step));
    }
}

/// Test step whose behaviour is picked by its type name. Every call is
/// logged under the step name; `delay_ms` config delays the call.
pub struct TestStep {
    kind: &'static str,
    log: CallLog,
}

#[async_trait]
impl Step for TestStep {
    fn step_type(&self) -> &str {
        self.kind
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepResult, StepError> {
        self.log.push(&ctx.step_name);

        if let Some(ms) = ctx.config.get("delay_ms").and_then(|v| v.as_f64()) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => {}
                _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
            }
        }

        let done = || StepResult::success("ok").with_data(format!("{}_done", ctx.step_name), true);
        match self.kind {
            "test.ok" => Ok(done()),
            "test.fail" => Err(StepError::ExecutionFailed(format!("{} failed", ctx.step_name))),
            "test.fail_first" if self.log.count(&ctx.step_name) <= 1 => {
                Err(StepError::ExecutionFailed(format!("{} failed on first call", ctx.step_name)))
            }
            "test.fail_first" => Ok(done()),
            "test.emit" => {
                let key = ctx.require_config("key")?.as_str().unwrap_or("value").to_string();
                let value = ctx.get_config_or("value", Value::Null);
                Ok(StepResult::success("emitted").with_data(key, value))
            }
            "test.wait" if ctx.data.contains_key("go") => Ok(done()),
            "test.wait" => Ok(StepResult::wait(
                PauseCondition::new(PauseReason::ExternalWait).with_message("waiting for go"),
            )),
            "test.pause_after" => {
                let mut condition = PauseCondition::new(PauseReason::ExternalWait).with_message("checkpoint");
                if let Some(ms) = ctx.config.get("resume_after_ms").and_then(|v| v.as_f64()) {
                    condition = condition.until(Utc::now() + chrono::Duration::milliseconds(ms as i64));
                }
                Ok(done().then_pause(condition))
            }
            other => Err(StepError::Configuration(format!("unknown test step {}", other))),
        }
    }
}

pub const KINDS: [&str; 6] = [
    "test.ok",
    "test.fail",
    "test.fail_first",
    "test.emit",
    "test.wait",
    "test.pause_after",
];

pub fn test_steps(log: &CallLog) -> StepRegistry {
    let mut registry = StepRegistry::new();
    for kind in KINDS {
        registry.register_step(Arc::new(TestStep { kind, log: log.clone() }));
    }
    registry
}

pub fn test_predicates() -> PredicateRegistry {
    let mut predicates = PredicateRegistry::new();
    predicates.register("is_vip", |data: &DataBag| {
        data.get("tier").and_then(|v| v.as_str()) == Some("vip")
    });
    predicates
}

/// Honours `RUST_LOG` when a test needs the engine's logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        auto_resume_interval_ms: 20,
        shutdown_grace_ms: 2_000,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: FlowEngine,
    pub store: Arc<InMemoryFlowStore>,
    pub log: CallLog,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    pub fn with(customize: impl FnOnce(FlowEngineBuilder) -> FlowEngineBuilder) -> Self {
        init_tracing();
        let log = CallLog::default();
        let store = Arc::new(InMemoryFlowStore::new());
        let builder = FlowEngine::builder()
            .store(store.clone())
            .steps(test_steps(&log))
            .predicates(test_predicates())
            .config(fast_config());
        Self {
            engine: customize(builder).build(),
            store,
            log,
        }
    }

    pub async fn register(&self, definition: FlowDefinition) {
        self.engine.register_definition(definition).await.unwrap();
    }

    pub async fn run(&self, flow_type: &str, data: DataBag) -> FlowId {
        self.engine
            .run_flow(flow_type, NewFlow::with_data(data))
            .await
            .unwrap()
            .flow_id
    }

    /// Run to the next resting point.
    pub async fn run_to_rest(&self, flow_type: &str, data: DataBag) -> FlowSummary {
        let flow_id = self.run(flow_type, data).await;
        self.settle(flow_id).await
    }

    pub async fn settle(&self, flow_id: FlowId) -> FlowSummary {
        tokio::time::timeout(Duration::from_secs(10), self.engine.wait_for_settle(flow_id))
            .await
            .expect("flow did not settle")
            .unwrap()
    }

    pub async fn state(&self, flow_id: FlowId) -> FlowState {
        self.engine.get_by_id(flow_id).await.unwrap()
    }
}

pub fn bag(pairs: &[(&str, Value)]) -> DataBag {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub fn assert_status(summary: &FlowSummary, status: FlowStatus) {
    assert_eq!(
        summary.status, status,
        "flow {} is {} (last error: {:?})",
        summary.flow_id, summary.status, summary.last_error
    );
}
