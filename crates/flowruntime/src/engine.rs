use crate::{
    commands, report::timeline_of, AutoResumeReport, AutoResumeService, BatchItemResult, BatchOperation,
    BatchReport, DefinitionRegistry, EngineConfig, EngineContext, ExecutorRegistry, FlowRecovery,
    FlowStatistics, FlowSummary, InMemoryFlowStore, NewFlow, OperationError, RecoverySummary,
    RegisteredDefinition, ResumeCondition, StepRegistry, TimelineEntry,
};
use flowcore::{
    notify_quietly, query_all, BroadcastNotifier, DataBag, DateRange, ExecutionPlan, FlowDefinition, FlowError,
    FlowFilter, FlowId, FlowState, FlowStore, PageRequest, PagedResult, PauseCondition, PauseReason,
    PredicateRegistry, StatusChange, StatusNotifier,
};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Entry point for embedding the engine: definitions, flow lifecycle,
/// operator commands and reporting.
pub struct FlowEngine {
    ctx: Arc<EngineContext>,
    definitions: RwLock<DefinitionRegistry>,
    auto_resume: Arc<AutoResumeService>,
    background: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    status_feed: Option<Arc<BroadcastNotifier>>,
}

/// Builder for [`FlowEngine`]. Unset parts fall back to an in-memory store,
/// empty registries and a broadcast notifier.
#[derive(Default)]
pub struct FlowEngineBuilder {
    store: Option<Arc<dyn FlowStore>>,
    steps: StepRegistry,
    predicates: PredicateRegistry,
    notifier: Option<Arc<dyn StatusNotifier>>,
    config: EngineConfig,
    resume_conditions: Vec<(PauseReason, Arc<dyn ResumeCondition>)>,
}

impl FlowEngineBuilder {
    pub fn store(mut self, store: Arc<dyn FlowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn predicates(mut self, predicates: PredicateRegistry) -> Self {
        self.predicates = predicates;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn StatusNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Decide auto-resume for flows paused with `reason`.
    pub fn resume_condition(mut self, reason: PauseReason, condition: Arc<dyn ResumeCondition>) -> Self {
        self.resume_conditions.push((reason, condition));
        self
    }

    pub fn build(self) -> FlowEngine {
        let (notifier, status_feed) = match self.notifier {
            Some(notifier) => (notifier, None),
            None => {
                let feed = Arc::new(BroadcastNotifier::new(self.config.event_buffer_size));
                let notifier: Arc<dyn StatusNotifier> = feed.clone();
                (notifier, Some(feed))
            }
        };
        let ctx = Arc::new(EngineContext {
            store: self.store.unwrap_or_else(|| Arc::new(InMemoryFlowStore::new())),
            steps: Arc::new(self.steps),
            predicates: Arc::new(self.predicates),
            notifier,
            executors: Arc::new(ExecutorRegistry::new()),
            config: self.config,
        });
        let auto_resume = self
            .resume_conditions
            .into_iter()
            .fold(AutoResumeService::new(Arc::clone(&ctx)), |service, (reason, condition)| {
                service.with_condition(reason, condition)
            });

        FlowEngine {
            ctx,
            definitions: RwLock::new(DefinitionRegistry::new()),
            auto_resume: Arc::new(auto_resume),
            background: Mutex::new(None),
            status_feed,
        }
    }
}

impl FlowEngine {
    pub fn builder() -> FlowEngineBuilder {
        FlowEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.ctx.steps
    }

    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.ctx.executors
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.ctx.store
    }

    /// Status changes, when the engine owns its notifier.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<StatusChange>> {
        self.status_feed.as_ref().map(|feed| feed.subscribe())
    }

    fn summarize(&self, state: &FlowState) -> FlowSummary {
        let pause_requested = self
            .ctx
            .executors
            .control(state.flow_id)
            .is_some_and(|control| control.pause_requested());
        FlowSummary::of(state, pause_requested)
    }

    // Definitions

    pub async fn register_definition(&self, definition: FlowDefinition) -> Result<ExecutionPlan, OperationError> {
        let plan = self.definitions.write().await.register(definition, &self.ctx.steps)?;
        Ok(plan)
    }

    pub async fn definition(&self, flow_type: &str) -> Option<RegisteredDefinition> {
        self.definitions.read().await.get(flow_type).cloned()
    }

    pub async fn list_flow_types(&self) -> Vec<String> {
        self.definitions.read().await.list_flow_types()
    }

    // Lifecycle

    #[instrument(skip(self, input))]
    pub async fn create_flow(&self, flow_type: &str, input: NewFlow) -> Result<FlowSummary, OperationError> {
        let mut state = {
            let definitions = self.definitions.read().await;
            let registered = definitions
                .get(flow_type)
                .ok_or_else(|| FlowError::UnknownFlowType(flow_type.to_string()))?;
            FlowState::instantiate(&registered.definition, registered.plan.clone(), input.data)
        };
        state.user_id = input.user_id;
        state.correlation_id = input.correlation_id;
        state.version = self.ctx.store.save(&state).await?;
        tracing::info!(flow_id = %state.flow_id, "Created flow '{}'", flow_type);
        notify_quietly(self.ctx.notifier.as_ref(), &state).await;
        Ok(self.summarize(&state))
    }

    pub async fn start_flow(&self, flow_id: FlowId) -> Result<FlowSummary, OperationError> {
        let state = commands::start_flow(&self.ctx, flow_id).await?;
        Ok(self.summarize(&state))
    }

    /// Create and start in one call.
    pub async fn run_flow(&self, flow_type: &str, input: NewFlow) -> Result<FlowSummary, OperationError> {
        let created = self.create_flow(flow_type, input).await?;
        self.start_flow(created.flow_id).await
    }

    /// Recover crashed flows (if configured) and start the auto-resume loop.
    pub async fn start(&self) -> Result<RecoverySummary, OperationError> {
        let summary = if self.ctx.config.recover_on_start {
            self.recover_crashed_flows().await?
        } else {
            RecoverySummary::default()
        };

        let mut background = self.background.lock().await;
        if background.is_none() {
            let token = CancellationToken::new();
            let handle = Arc::clone(&self.auto_resume).spawn(token.clone());
            *background = Some((token, handle));
            tracing::info!(
                "Flow engine started (auto-resume every {}ms)",
                self.ctx.config.auto_resume_interval_ms
            );
        }
        Ok(summary)
    }

    /// Stop auto-resume and park every attached flow with reason `Shutdown`.
    ///
    /// Returns the flows whose executors did not settle within the grace period.
    pub async fn shutdown(&self) -> Vec<FlowId> {
        if let Some((token, handle)) = self.background.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("Auto-resume task ended abnormally: {}", e);
            }
        }

        let attached = self.ctx.executors.attached();
        for flow_id in &attached {
            if let Some(control) = self.ctx.executors.control(*flow_id) {
                control.request_pause(PauseCondition::new(PauseReason::Shutdown).with_message("engine shutting down"));
            }
        }
        tracing::info!("Shutting down; waiting for {} executor(s)", attached.len());

        let executors = Arc::clone(&self.ctx.executors);
        let waits = attached.iter().map(|id| executors.wait(*id));
        if tokio::time::timeout(self.ctx.config.shutdown_grace(), futures::future::join_all(waits))
            .await
            .is_err()
        {
            tracing::warn!("Shutdown grace period elapsed with executors still attached");
        }
        self.ctx.executors.attached()
    }

    // Queries

    pub async fn query(&self, filter: &FlowFilter, page: PageRequest) -> Result<PagedResult<FlowSummary>, OperationError> {
        let result = self.ctx.store.query(filter, page).await?;
        Ok(result.map(|state| self.summarize(&state)))
    }

    pub async fn get_by_id(&self, flow_id: FlowId) -> Result<FlowState, OperationError> {
        Ok(self.ctx.store.load(flow_id).await?)
    }

    pub async fn get_summary(&self, flow_id: FlowId) -> Result<FlowSummary, OperationError> {
        let state = self.ctx.store.load(flow_id).await?;
        Ok(self.summarize(&state))
    }

    pub async fn get_timeline(&self, flow_id: FlowId) -> Result<Vec<TimelineEntry>, OperationError> {
        let state = self.ctx.store.load(flow_id).await?;
        Ok(timeline_of(&state))
    }

    /// Wait until no executor is attached to the flow, then report where it stands.
    pub async fn wait_for_settle(&self, flow_id: FlowId) -> Result<FlowSummary, OperationError> {
        self.ctx.executors.wait(flow_id).await;
        self.get_summary(flow_id).await
    }

    pub async fn compute_statistics(&self, range: DateRange) -> Result<FlowStatistics, OperationError> {
        let filter = FlowFilter {
            created: range,
            ..FlowFilter::default()
        };
        let flows = query_all(self.ctx.store.as_ref(), &filter).await?;
        Ok(FlowStatistics::compute(&flows))
    }

    // Commands

    pub async fn pause(&self, flow_id: FlowId, message: Option<String>) -> Result<FlowSummary, OperationError> {
        let condition = match message {
            Some(message) => PauseCondition::manual(message),
            None => PauseCondition::new(PauseReason::ManualIntervention),
        };
        self.pause_with(flow_id, condition).await
    }

    pub async fn pause_with(&self, flow_id: FlowId, condition: PauseCondition) -> Result<FlowSummary, OperationError> {
        let state = commands::pause_flow(&self.ctx, flow_id, condition).await?;
        Ok(self.summarize(&state))
    }

    pub async fn resume(&self, flow_id: FlowId, data: Option<DataBag>) -> Result<FlowSummary, OperationError> {
        let state = commands::resume_flow(&self.ctx, flow_id, data).await?;
        Ok(self.summarize(&state))
    }

    pub async fn cancel(&self, flow_id: FlowId, reason: Option<String>) -> Result<FlowSummary, OperationError> {
        let state = commands::cancel_flow(&self.ctx, flow_id, reason).await?;
        Ok(self.summarize(&state))
    }

    pub async fn resolve(&self, flow_id: FlowId, note: impl Into<String>) -> Result<FlowSummary, OperationError> {
        let state = commands::resolve_flow(&self.ctx, flow_id, note.into()).await?;
        Ok(self.summarize(&state))
    }

    pub async fn retry(&self, flow_id: FlowId) -> Result<FlowSummary, OperationError> {
        let state = commands::retry_flow(&self.ctx, flow_id).await?;
        Ok(self.summarize(&state))
    }

    /// Apply one command to many flows. Every id gets an outcome, in order.
    pub async fn batch_operation(&self, flow_ids: &[FlowId], operation: BatchOperation) -> BatchReport {
        let mut report = BatchReport::default();
        for &flow_id in flow_ids {
            let outcome = match &operation {
                BatchOperation::Pause { message } => self.pause(flow_id, message.clone()).await,
                BatchOperation::Resume { data } => self.resume(flow_id, data.clone()).await,
                BatchOperation::Cancel { reason } => self.cancel(flow_id, reason.clone()).await,
                BatchOperation::Resolve { note } => self.resolve(flow_id, note.clone()).await,
                BatchOperation::Retry => self.retry(flow_id).await,
            };
            if let Err(e) = &outcome {
                tracing::warn!(%flow_id, "Batch item failed: {}", e);
            }
            report.items.push(BatchItemResult { flow_id, outcome });
        }
        tracing::info!(
            "Batch {:?}: {} succeeded, {} failed",
            operation,
            report.succeeded(),
            report.failed()
        );
        report
    }

    // Maintenance

    pub async fn recover_crashed_flows(&self) -> Result<RecoverySummary, OperationError> {
        Ok(FlowRecovery::new(Arc::clone(&self.ctx)).recover_crashed_flows().await?)
    }

    pub async fn run_auto_resume_once(&self) -> Result<AutoResumeReport, OperationError> {
        Ok(self.auto_resume.run_once().await?)
    }
}
