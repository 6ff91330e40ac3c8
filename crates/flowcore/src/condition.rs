use crate::{DataBag, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Serializable branch condition evaluated against the data bag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Exists { key: String },
    Equals { key: String, value: Value },
    NotEquals { key: String, value: Value },
    GreaterThan { key: String, value: f64 },
    LessThan { key: String, value: f64 },
    IsTrue { key: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    /// Predicate registered by name in a [`PredicateRegistry`].
    Named { name: String },
}

impl Condition {
    pub fn evaluate(&self, data: &DataBag, predicates: &PredicateRegistry) -> bool {
        match self {
            Condition::Always => true,
            Condition::Exists { key } => data.get(key).is_some_and(|v| !v.is_null()),
            Condition::Equals { key, value } => data.get(key).is_some_and(|v| loosely_equal(v, value)),
            Condition::NotEquals { key, value } => !data.get(key).is_some_and(|v| loosely_equal(v, value)),
            Condition::GreaterThan { key, value } => {
                data.get(key).and_then(Value::as_f64).is_some_and(|n| n > *value)
            }
            Condition::LessThan { key, value } => {
                data.get(key).and_then(Value::as_f64).is_some_and(|n| n < *value)
            }
            Condition::IsTrue { key } => data.get(key).and_then(Value::as_bool).unwrap_or(false),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(data, predicates)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(data, predicates)),
            Condition::Not { condition } => !condition.evaluate(data, predicates),
            Condition::Named { name } => match predicates.get(name) {
                Some(predicate) => predicate(data),
                None => {
                    tracing::warn!("Branch predicate '{}' is not registered; treating as false", name);
                    false
                }
            },
        }
    }
}

// `Value::Json` and the typed variants compare through their plain JSON form.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    left == right || left.to_json() == right.to_json()
}

pub type Predicate = Arc<dyn Fn(&DataBag) -> bool + Send + Sync>;

/// Named predicates referenced by `Condition::Named`.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: HashMap<String, Predicate>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&DataBag) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::info!("Registering branch predicate: {}", name);
        self.predicates.insert(name, Arc::new(predicate));
    }

    pub fn get(&self, name: &str) -> Option<&Predicate> {
        self.predicates.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.predicates.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag() -> DataBag {
        let mut data = DataBag::new();
        data.insert("risk".into(), Value::Number(72.0));
        data.insert("country".into(), Value::from("SE"));
        data.insert("verified".into(), Value::Bool(true));
        data
    }

    #[test]
    fn comparison_conditions() {
        let predicates = PredicateRegistry::new();
        let data = bag();
        assert!(Condition::GreaterThan { key: "risk".into(), value: 50.0 }.evaluate(&data, &predicates));
        assert!(!Condition::LessThan { key: "risk".into(), value: 50.0 }.evaluate(&data, &predicates));
        assert!(Condition::Equals { key: "country".into(), value: "SE".into() }.evaluate(&data, &predicates));
        assert!(Condition::NotEquals { key: "missing".into(), value: "SE".into() }.evaluate(&data, &predicates));
        assert!(Condition::IsTrue { key: "verified".into() }.evaluate(&data, &predicates));
    }

    #[test]
    fn equality_ignores_value_representation() {
        let predicates = PredicateRegistry::new();
        let mut data = DataBag::new();
        data.insert("tier".into(), Value::Json(serde_json::json!("gold")));
        assert!(Condition::Equals { key: "tier".into(), value: "gold".into() }.evaluate(&data, &predicates));
    }

    #[test]
    fn combinators_and_named_predicates() {
        let mut predicates = PredicateRegistry::new();
        predicates.register("high_risk", |data: &DataBag| {
            data.get("risk").and_then(Value::as_f64).unwrap_or(0.0) > 70.0
        });
        let data = bag();
        let condition = Condition::All {
            conditions: vec![
                Condition::Named { name: "high_risk".into() },
                Condition::Not { condition: Box::new(Condition::Exists { key: "override".into() }) },
            ],
        };
        assert!(condition.evaluate(&data, &predicates));
        assert!(!Condition::Named { name: "unknown".into() }.evaluate(&data, &predicates));
    }

    #[test]
    fn conditions_round_trip_through_json() {
        let condition = Condition::Any {
            conditions: vec![Condition::Always, Condition::IsTrue { key: "x".into() }],
        };
        let json = serde_json::to_string(&condition).unwrap();
        let back: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(condition, back);
    }
}
