use flowcore::{
    resolve_execution_order, ExecutionPlan, FlowDefinition, FlowError, Step, StepError, Value,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating step instances
pub trait StepFactory: Send + Sync {
    /// Create a step instance for the given step configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Step>, StepError>;

    /// Get step type identifier
    fn step_type(&self) -> &str;

    /// Optional: Get step metadata (description, data keys read and written)
    fn metadata(&self) -> StepMetadata {
        StepMetadata::default()
    }
}

/// Metadata about a step type
#[derive(Debug, Clone)]
pub struct StepMetadata {
    pub description: String,
    pub category: String,
    pub reads: Vec<KeyDefinition>,
    pub writes: Vec<KeyDefinition>,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }
}

/// A data-bag key a step reads or writes
#[derive(Debug, Clone)]
pub struct KeyDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Wraps one shared instance; every flow gets the same step object.
struct SharedStepFactory {
    step_type: String,
    step: Arc<dyn Step>,
}

impl StepFactory for SharedStepFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Step>, StepError> {
        self.step.validate_config(config)?;
        Ok(Arc::clone(&self.step))
    }

    fn step_type(&self) -> &str {
        &self.step_type
    }
}

/// Registry of available step types
#[derive(Default)]
pub struct StepRegistry {
    factories: HashMap<String, Arc<dyn StepFactory>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a step factory
    pub fn register(&mut self, factory: Arc<dyn StepFactory>) {
        let step_type = factory.step_type().to_string();
        tracing::info!("Registering step type: {}", step_type);
        self.factories.insert(step_type, factory);
    }

    /// Register a ready-made step instance under its own type name
    pub fn register_step(&mut self, step: Arc<dyn Step>) {
        let step_type = step.step_type().to_string();
        self.register(Arc::new(SharedStepFactory { step_type, step }));
    }

    /// Create a step instance from a step type and config
    pub fn create_step(
        &self,
        step_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<Arc<dyn Step>, FlowError> {
        let factory = self
            .factories
            .get(step_type)
            .ok_or_else(|| FlowError::UnknownStepType(step_type.to_string()))?;

        factory
            .create(config)
            .map_err(|e| FlowError::Execution(format!("Failed to create step '{}': {}", step_type, e)))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.contains_key(step_type)
    }

    /// Get all registered step types
    pub fn list_step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a step type
    pub fn get_metadata(&self, step_type: &str) -> Option<StepMetadata> {
        self.factories.get(step_type).map(|f| f.metadata())
    }

    /// Check that every step of a definition can be instantiated.
    pub fn validate(&self, definition: &FlowDefinition) -> Result<(), FlowError> {
        for spec in &definition.steps {
            self.create_step(&spec.step_type, &spec.config)?;
        }
        Ok(())
    }
}

/// A definition that passed load-time validation, with its resolved plan
#[derive(Debug, Clone)]
pub struct RegisteredDefinition {
    pub definition: FlowDefinition,
    pub plan: ExecutionPlan,
}

/// Flow definitions keyed by flow type
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, RegisteredDefinition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a definition against the step registry and store it.
    ///
    /// Graph validation happens here, once, rather than on every run.
    pub fn register(
        &mut self,
        definition: FlowDefinition,
        steps: &StepRegistry,
    ) -> Result<ExecutionPlan, FlowError> {
        let plan = resolve_execution_order(&definition)?;
        steps.validate(&definition)?;
        tracing::info!(
            "Registering flow definition: {} ({} steps, {} batches)",
            definition.flow_type,
            definition.steps.len(),
            plan.len()
        );
        self.definitions.insert(
            definition.flow_type.clone(),
            RegisteredDefinition {
                definition,
                plan: plan.clone(),
            },
        );
        Ok(plan)
    }

    pub fn get(&self, flow_type: &str) -> Option<&RegisteredDefinition> {
        self.definitions.get(flow_type)
    }

    pub fn list_flow_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }
}
