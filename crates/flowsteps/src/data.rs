use async_trait::async_trait;
use flowcore::{bag_from_json, DataBag, Step, StepContext, StepError, StepResult, Value};
use flowruntime::{KeyDefinition, StepFactory, StepMetadata};
use std::collections::HashMap;
use std::sync::Arc;

/// Writes fixed values into the data bag
pub struct SetDataStep {
    values: DataBag,
}

#[async_trait]
impl Step for SetDataStep {
    fn step_type(&self) -> &str {
        "data.set"
    }

    async fn execute(&self, _ctx: StepContext) -> Result<StepResult, StepError> {
        let mut result = StepResult::success(format!("set {} key(s)", self.values.len()));
        result.data = self.values.clone();
        Ok(result)
    }
}

pub struct SetDataStepFactory;

impl StepFactory for SetDataStepFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Step>, StepError> {
        let values = match config.get("values") {
            None => DataBag::new(),
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Some(other) => bag_from_json(other.to_json())
                .ok_or_else(|| StepError::Configuration("values must be an object".to_string()))?,
        };
        Ok(Arc::new(SetDataStep { values }))
    }

    fn step_type(&self) -> &str {
        "data.set"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Write the configured `values` object into the data bag".to_string(),
            category: "data".to_string(),
            ..StepMetadata::default()
        }
    }
}

/// Parse a JSON string held in the bag
pub struct JsonParseStep {
    source: String,
    target: String,
}

#[async_trait]
impl Step for JsonParseStep {
    fn step_type(&self) -> &str {
        "data.json_parse"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepResult, StepError> {
        let input = ctx
            .require_input(&self.source)?
            .as_str()
            .ok_or_else(|| StepError::InvalidInput {
                field: self.source.clone(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?;

        let parsed: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| StepError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(StepResult::success(format!("parsed '{}'", self.source)).with_data(self.target.clone(), Value::Json(parsed)))
    }
}

pub struct JsonParseStepFactory;

impl StepFactory for JsonParseStepFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn Step>, StepError> {
        let key = |name: &str, default: &str| {
            config
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or(default)
                .to_string()
        };
        Ok(Arc::new(JsonParseStep {
            source: key("source", "json"),
            target: key("target", "parsed"),
        }))
    }

    fn step_type(&self) -> &str {
        "data.json_parse"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Parse JSON string".to_string(),
            category: "data".to_string(),
            reads: vec![KeyDefinition {
                name: "json".to_string(),
                description: "Source key (config `source`)".to_string(),
                required: true,
            }],
            writes: vec![KeyDefinition {
                name: "parsed".to_string(),
                description: "Target key (config `target`)".to_string(),
                required: false,
            }],
        }
    }
}
