use crate::{Condition, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Complete flow definition, instantiated into a `FlowState` by flow type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub flow_type: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
}

impl FlowDefinition {
    pub fn new(flow_type: impl Into<String>) -> Self {
        Self {
            flow_type: flow_type.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn find_step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Step specification in a flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub step_type: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub step_dependencies: BTreeSet<String>,
    /// Required input key -> name of the step producing it.
    #[serde(default)]
    pub data_dependencies: BTreeMap<String, String>,
    /// Result keys merged into the data bag. Empty merges every key.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub is_critical: bool,
    #[serde(default = "default_true")]
    pub is_idempotent: bool,
    #[serde(default)]
    pub can_run_in_parallel: bool,
    #[serde(default)]
    pub branches: Vec<Branch>,
}

fn default_true() -> bool {
    true
}

impl StepSpec {
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            config: HashMap::new(),
            step_dependencies: BTreeSet::new(),
            data_dependencies: BTreeMap::new(),
            outputs: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_ms: None,
            is_critical: true,
            is_idempotent: true,
            can_run_in_parallel: false,
            branches: Vec::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.step_dependencies.insert(step.into());
        self
    }

    pub fn requires_data(mut self, key: impl Into<String>, producer: impl Into<String>) -> Self {
        self.data_dependencies.insert(key.into(), producer.into());
        self
    }

    pub fn with_output(mut self, key: impl Into<String>) -> Self {
        self.outputs.push(key.into());
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.retry = RetryPolicy {
            max_retries,
            retry_delay_ms,
            ..RetryPolicy::default()
        };
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn critical(mut self, is_critical: bool) -> Self {
        self.is_critical = is_critical;
        self
    }

    pub fn idempotent(mut self, is_idempotent: bool) -> Self {
        self.is_idempotent = is_idempotent;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.can_run_in_parallel = true;
        self
    }

    pub fn with_branch(mut self, branch: Branch) -> Self {
        self.branches.push(branch);
        self
    }
}

/// Retry policy for a single step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: Option<u64>,
}

impl RetryPolicy {
    /// Delay before the retry that follows the given (0-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let delay = (self.retry_delay_ms as f64 * factor).min(u64::MAX as f64) as u64;
        match self.max_delay_ms {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: None,
        }
    }
}

/// Conditional continuation attached to a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub condition: Condition,
    pub steps: Vec<String>,
    #[serde(default)]
    pub is_default: bool,
}

impl Branch {
    pub fn when(condition: Condition, steps: &[&str]) -> Self {
        Self {
            condition,
            steps: steps.iter().map(|s| s.to_string()).collect(),
            is_default: false,
        }
    }

    pub fn otherwise(steps: &[&str]) -> Self {
        Self {
            condition: Condition::Always,
            steps: steps.iter().map(|s| s.to_string()).collect(),
            is_default: true,
        }
    }
}
