//! Static resolution of a definition's step graph into ordered batches.

use crate::{DefinitionError, FlowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordered batches of step names. Members of one batch may run concurrently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub batches: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batch_of(&self, step: &str) -> Option<usize> {
        self.batches.iter().position(|b| b.iter().any(|s| s == step))
    }
}

/// Validate the definition and compute its execution order.
///
/// Data-dependency producers and branch owners are treated as ordering edges,
/// so a step never lands in a batch before the steps it reads from or the step
/// that gates it.
///
/// # Errors
/// - [`DefinitionError::Validation`] for malformed definitions (empty, duplicate
///   names, several default branches, ambiguous branch ownership).
/// - [`DefinitionError::UnknownDependency`] for references to missing steps or
///   undeclared data keys.
/// - [`DefinitionError::CycleDetected`] if the graph is not acyclic.
pub fn resolve_execution_order(definition: &FlowDefinition) -> Result<ExecutionPlan, DefinitionError> {
    if definition.steps.is_empty() {
        return Err(DefinitionError::Validation(format!(
            "flow '{}' has no steps",
            definition.flow_type
        )));
    }

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for (position, step) in definition.steps.iter().enumerate() {
        if step.name.trim().is_empty() {
            return Err(DefinitionError::Validation(format!("step #{} has an empty name", position)));
        }
        let idx = graph.add_node(position);
        if index.insert(step.name.as_str(), idx).is_some() {
            return Err(DefinitionError::Validation(format!("duplicate step name '{}'", step.name)));
        }
    }

    let lookup = |step: &str, what: &'static str, name: &str| {
        index.get(name).copied().ok_or_else(|| DefinitionError::UnknownDependency {
            step: step.to_string(),
            what,
            name: name.to_string(),
        })
    };

    let mut branch_owner: HashMap<&str, &str> = HashMap::new();

    for step in &definition.steps {
        let this = index[step.name.as_str()];

        for dep in &step.step_dependencies {
            let from = lookup(&step.name, "step", dep)?;
            graph.add_edge(from, this, ());
        }

        for (key, producer) in &step.data_dependencies {
            let from = lookup(&step.name, "producing step", producer)?;
            let producer_spec = &definition.steps[graph[from]];
            if !producer_spec.outputs.is_empty() && !producer_spec.outputs.contains(key) {
                return Err(DefinitionError::UnknownDependency {
                    step: step.name.clone(),
                    what: "data key",
                    name: format!("{}.{}", producer, key),
                });
            }
            graph.add_edge(from, this, ());
        }

        if step.branches.iter().filter(|b| b.is_default).count() > 1 {
            return Err(DefinitionError::Validation(format!(
                "step '{}' declares more than one default branch",
                step.name
            )));
        }

        for branch in &step.branches {
            for target in &branch.steps {
                let to = lookup(&step.name, "branch step", target)?;
                if target == &step.name {
                    return Err(DefinitionError::Validation(format!(
                        "step '{}' branches to itself",
                        step.name
                    )));
                }
                match branch_owner.insert(target.as_str(), step.name.as_str()) {
                    Some(owner) if owner != step.name => {
                        return Err(DefinitionError::Validation(format!(
                            "step '{}' is a branch target of both '{}' and '{}'",
                            target, owner, step.name
                        )));
                    }
                    _ => {}
                }
                graph.add_edge(this, to, ());
            }
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        let position = graph[cycle.node_id()];
        DefinitionError::CycleDetected(definition.steps[position].name.clone())
    })?;

    // Longest distance from a root decides the level.
    let mut level = vec![0usize; definition.steps.len()];
    for idx in &order {
        let lvl = graph
            .neighbors_directed(*idx, Direction::Incoming)
            .map(|pred| level[graph[pred]] + 1)
            .max()
            .unwrap_or(0);
        level[graph[*idx]] = lvl;
    }

    let max_level = level.iter().copied().max().unwrap_or(0);
    let mut batches = Vec::new();
    for lvl in 0..=max_level {
        let mut parallel_slot: Option<usize> = None;
        for (position, step) in definition.steps.iter().enumerate() {
            if level[position] != lvl {
                continue;
            }
            if step.can_run_in_parallel {
                match parallel_slot {
                    Some(slot) => {
                        let batch: &mut Vec<String> = &mut batches[slot];
                        batch.push(step.name.clone());
                    }
                    None => {
                        parallel_slot = Some(batches.len());
                        batches.push(vec![step.name.clone()]);
                    }
                }
            } else {
                batches.push(vec![step.name.clone()]);
            }
        }
    }

    Ok(ExecutionPlan { batches })
}
