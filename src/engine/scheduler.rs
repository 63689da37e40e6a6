//! Dependency-aware step scheduling.
//!
//! Models step dependencies as a `petgraph` directed graph. Topological sort
//! confirms acyclicity (the validator has already reported any cycle with its
//! full path), and depth-based grouping produces execution waves: every step
//! in a wave has all its dependencies in strictly earlier waves.
//!
//! Within a wave, steps sharing a `parallel_group` are batched together so a
//! concurrency cap never splits a group.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::domain::StepDefinition;
use crate::error::EngineError;

/// Ordered waves of steps; wave 0 runs first.
pub type ExecutionPlan<'a> = Vec<Vec<&'a StepDefinition>>;

/// Build an execution plan, grouping steps into parallel waves.
///
/// Each wave contains steps whose dependencies are all satisfied by prior
/// waves. Fails on unknown dependencies or cycles; callers validate first,
/// so these are defensive failures with plain messages.
pub fn build_execution_plan(steps: &[StepDefinition]) -> Result<ExecutionPlan<'_>, EngineError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let id_to_step: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.name.as_str(), s)).collect();
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    // Edge from dependency -> dependent.
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps
        .iter()
        .map(|s| graph.add_node(s.name.as_str()))
        .collect();

    for step in steps {
        let to_idx = id_to_idx[step.name.as_str()];
        for dep in &step.dependencies {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                EngineError::Validation(crate::error::ValidationFailure {
                    result: undefined_dependency_result(&step.name, dep),
                })
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node = graph[cycle.node_id()];
        EngineError::Validation(crate::error::ValidationFailure {
            result: cycle_result(node),
        })
    })?;

    // Depth per node: max dependency depth + 1, roots at 0.
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for &node_idx in &sorted {
        let name = graph[node_idx];
        let step = id_to_step[name];
        let depth = step
            .dependencies
            .iter()
            .filter_map(|dep| depths.get(dep.as_str()).map(|d| d + 1))
            .max()
            .unwrap_or(0);
        depths.insert(name, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: ExecutionPlan<'_> = vec![vec![]; max_depth + 1];
    for step in steps {
        waves[depths[step.name.as_str()]].push(step);
    }

    Ok(waves)
}

/// Split one wave into launch batches under a concurrency cap.
///
/// Steps sharing a `parallel_group` stay in one batch even when the cap
/// would split them; ungrouped steps fill batches up to the cap. A cap of
/// `usize::MAX` yields a single batch.
pub fn batch_wave<'a>(
    wave: &[&'a StepDefinition],
    concurrency: usize,
) -> Vec<Vec<&'a StepDefinition>> {
    // Strictly sequential execution runs one step at a time, parallel
    // groups included: a group only promises no ordering constraint, it
    // does not override the strategy.
    if concurrency <= 1 {
        return wave.iter().map(|&s| vec![s]).collect();
    }
    if wave.len() <= concurrency {
        return vec![wave.to_vec()];
    }

    // Group members first, in first-appearance order.
    let mut group_order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&StepDefinition>> = HashMap::new();
    let mut singles: Vec<&StepDefinition> = Vec::new();

    for &step in wave {
        match step.parallel_group.as_deref() {
            Some(group) => {
                if !groups.contains_key(group) {
                    group_order.push(group);
                }
                groups.entry(group).or_default().push(step);
            }
            None => singles.push(step),
        }
    }

    let mut batches: Vec<Vec<&StepDefinition>> = Vec::new();
    for group in group_order {
        batches.push(groups.remove(group).unwrap_or_default());
    }
    for chunk in singles.chunks(concurrency) {
        batches.push(chunk.to_vec());
    }

    batches
}

fn cycle_result(node: &str) -> crate::engine::validator::ValidationResult {
    let mut result = crate::engine::validator::ValidationResult::default();
    result.push_step(
        "circular_dependency",
        node,
        "dependency cycle detected at schedule time",
    );
    result
}

fn undefined_dependency_result(step: &str, dep: &str) -> crate::engine::validator::ValidationResult {
    let mut result = crate::engine::validator::ValidationResult::default();
    result.push_step(
        "undefined_reference",
        step,
        format!("depends on undefined step '{}'", dep),
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StepDefinition;

    fn step(name: &str, deps: Vec<&str>) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            component: "component".to_string(),
            operation: "operation".to_string(),
            description: String::new(),
            parameters: Default::default(),
            dependencies: deps.into_iter().map(String::from).collect(),
            on_success: vec![],
            on_failure: vec![],
            critical: false,
            retry: Default::default(),
            timeout_seconds: 300,
            parallel_group: None,
        }
    }

    fn grouped(name: &str, deps: Vec<&str>, group: &str) -> StepDefinition {
        let mut s = step(name, deps);
        s.parallel_group = Some(group.to_string());
        s
    }

    #[test]
    fn test_independent_steps_single_wave() {
        let steps = vec![step("a", vec![]), step("b", vec![]), step("c", vec![])];
        let waves = build_execution_plan(&steps).unwrap();
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].len(), 3);
    }

    #[test]
    fn test_linear_chain_one_wave_per_step() {
        let steps = vec![step("a", vec![]), step("b", vec!["a"]), step("c", vec!["b"])];
        let waves = build_execution_plan(&steps).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0][0].name, "a");
        assert_eq!(waves[1][0].name, "b");
        assert_eq!(waves[2][0].name, "c");
    }

    #[test]
    fn test_diamond_three_waves() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("d", vec!["b", "c"]),
        ];
        let waves = build_execution_plan(&steps).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[1].len(), 2);
        assert_eq!(waves[2][0].name, "d");
    }

    #[test]
    fn test_cycle_fails_at_schedule_time() {
        let steps = vec![step("a", vec!["b"]), step("b", vec!["a"])];
        let err = build_execution_plan(&steps).unwrap_err();
        assert!(err.to_string().contains("circular_dependency"));
    }

    #[test]
    fn test_unknown_dependency_fails() {
        let steps = vec![step("a", vec!["missing"])];
        let err = build_execution_plan(&steps).unwrap_err();
        assert!(err.to_string().contains("undefined"));
    }

    #[test]
    fn test_empty_plan() {
        let waves = build_execution_plan(&[]).unwrap();
        assert!(waves.is_empty());
    }

    #[test]
    fn test_batch_wave_respects_cap() {
        let steps = vec![step("a", vec![]), step("b", vec![]), step("c", vec![])];
        let wave: Vec<&StepDefinition> = steps.iter().collect();

        let batches = batch_wave(&wave, 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn test_batch_wave_keeps_group_together() {
        let steps = vec![
            grouped("a", vec![], "candidates"),
            grouped("b", vec![], "candidates"),
            grouped("c", vec![], "candidates"),
            step("d", vec![]),
        ];
        let wave: Vec<&StepDefinition> = steps.iter().collect();

        // Cap of 2 would split the group of 3; it must not.
        let batches = batch_wave(&wave, 2);
        assert_eq!(batches[0].len(), 3, "group launches as one batch");
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn test_batch_wave_unbounded() {
        let steps = vec![step("a", vec![]), step("b", vec![])];
        let wave: Vec<&StepDefinition> = steps.iter().collect();
        let batches = batch_wave(&wave, usize::MAX);
        assert_eq!(batches.len(), 1);
    }
}
