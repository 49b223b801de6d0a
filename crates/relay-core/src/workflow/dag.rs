//! Dependency graph scheduling primitives.
//!
//! Uses `petgraph` to model step dependencies as a directed graph.
//! Topological sort validates acyclicity at publish and instantiation time;
//! the ready-set and deadlock predicates drive the controller's run loop.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use relay_types::error::EngineError;
use relay_types::workflow::{StepDefinition, StepStatus, WorkflowExecution};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Topological validation
// ---------------------------------------------------------------------------

/// Validate that step definitions form a DAG and return a topological order
/// of step ids.
///
/// Errors with [`EngineError::UnknownDependency`] when a `depends_on` entry
/// references no sibling, and [`EngineError::CycleDetected`] when the graph
/// contains a cycle.
pub fn topological_order(steps: &[StepDefinition]) -> Result<Vec<String>, EngineError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    // Edge from dependency -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for step in steps {
        let to_idx = id_to_idx[step.id.as_str()];
        for dep in &step.depends_on {
            let from_idx =
                id_to_idx
                    .get(dep.as_str())
                    .ok_or_else(|| EngineError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let start = graph[cycle.node_id()].to_string();
        // Report the offending node plus everything reachable back to it so
        // the error names the cycle's participants.
        let members = cycle_members(steps, &start);
        EngineError::CycleDetected(members)
    })?;

    Ok(sorted.into_iter().map(|n| graph[n].to_string()).collect())
}

/// Collect the ids on the dependency cycle that `start` participates in.
fn cycle_members(steps: &[StepDefinition], start: &str) -> Vec<String> {
    let deps: HashMap<&str, &[String]> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
        .collect();

    // Walk backwards from `start`; every visited node that can reach `start`
    // again is part of a cycle through it.
    let mut visited = HashSet::new();
    let mut stack = vec![start.to_string()];
    while let Some(current) = stack.pop() {
        if let Some(ds) = deps.get(current.as_str()) {
            for dep in ds.iter() {
                if visited.insert(dep.clone()) {
                    stack.push(dep.clone());
                }
            }
        }
    }
    let mut members: Vec<String> = visited
        .into_iter()
        .filter(|id| id == start || reaches(&deps, id, start))
        .collect();
    if !members.contains(&start.to_string()) {
        members.push(start.to_string());
    }
    members.sort();
    members
}

/// Whether `from` is reachable from `to` by following `depends_on` edges.
fn reaches(deps: &HashMap<&str, &[String]>, from: &str, to: &str) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![to.to_string()];
    while let Some(current) = stack.pop() {
        if current == from {
            return true;
        }
        if let Some(ds) = deps.get(current.as_str()) {
            for dep in ds.iter() {
                if visited.insert(dep.clone()) {
                    stack.push(dep.clone());
                }
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Instance ids of every PENDING step whose every dependency is COMPLETED,
/// in definition order.
pub fn ready_steps(execution: &WorkflowExecution) -> Vec<Uuid> {
    let completed: HashSet<Uuid> = execution
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| s.id)
        .collect();

    execution
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| s.depends_on.iter().all(|d| completed.contains(d)))
        .map(|s| s.id)
        .collect()
}

/// Whether any step is still PENDING.
pub fn has_pending(execution: &WorkflowExecution) -> bool {
    execution
        .steps
        .iter()
        .any(|s| s.status == StepStatus::Pending)
}

/// True iff pending steps exist and none can ever become ready.
///
/// Never reports true while a step is RUNNING: a blocked-on-in-flight
/// sibling is not a deadlock.
pub fn is_deadlocked(execution: &WorkflowExecution) -> bool {
    if execution
        .steps
        .iter()
        .any(|s| s.status == StepStatus::Running)
    {
        return false;
    }
    has_pending(execution) && ready_steps(execution).is_empty()
}

/// Definition ids of the permanently blocked PENDING steps, for the
/// deadlock report.
pub fn blocked_steps(execution: &WorkflowExecution) -> Vec<String> {
    execution
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .map(|s| s.definition_id.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_types::workflow::{ExecutionStatus, ParallelMode, Step};
    use serde_json::Map;

    fn def(id: &str, depends_on: Vec<&str>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            service: "crm".to_string(),
            action: "noop".to_string(),
            parameters: Map::new(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            parallel: false,
            parallel_group: None,
            parallel_mode: ParallelMode::All,
            condition: None,
            timeout_secs: None,
            retry: None,
        }
    }

    fn instance(definition_id: &str, depends_on: Vec<Uuid>, status: StepStatus) -> Step {
        Step {
            id: Uuid::now_v7(),
            definition_id: definition_id.to_string(),
            name: definition_id.to_string(),
            service: "crm".to_string(),
            action: "noop".to_string(),
            parameters: Map::new(),
            depends_on,
            parallel: false,
            parallel_group: None,
            parallel_mode: ParallelMode::All,
            condition: None,
            timeout_secs: None,
            retry: None,
            status,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn execution(steps: Vec<Step>) -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::now_v7(),
            template_id: None,
            name: "test".to_string(),
            steps,
            context: Map::new(),
            status: ExecutionStatus::Running,
            parallel_groups: std::collections::HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output: Map::new(),
            error: None,
        }
    }

    // -----------------------------------------------------------------------
    // Topological order
    // -----------------------------------------------------------------------

    #[test]
    fn linear_chain_sorts_in_dependency_order() {
        // a -> b -> c
        let steps = vec![def("c", vec!["b"]), def("a", vec![]), def("b", vec!["a"])];
        let order = topological_order(&steps).unwrap();
        let pos = |id: &str| order.iter().position(|s| s == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn cycle_is_rejected_with_member_ids() {
        // a -> b -> c -> a
        let steps = vec![def("a", vec!["c"]), def("b", vec!["a"]), def("c", vec!["b"])];
        let err = topological_order(&steps).unwrap_err();
        match err {
            EngineError::CycleDetected(members) => {
                assert!(members.contains(&"a".to_string()));
                assert!(members.contains(&"b".to_string()));
                assert!(members.contains(&"c".to_string()));
            }
            other => panic!("expected CycleDetected, got {other}"),
        }
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let steps = vec![def("a", vec!["missing"])];
        let err = topological_order(&steps).unwrap_err();
        assert!(err.to_string().contains("unknown step 'missing'"));
    }

    #[test]
    fn diamond_is_valid() {
        // a -> {b, c} -> d
        let steps = vec![
            def("a", vec![]),
            def("b", vec!["a"]),
            def("c", vec!["a"]),
            def("d", vec!["b", "c"]),
        ];
        let order = topological_order(&steps).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order.last().map(String::as_str), Some("d"));
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    #[test]
    fn roots_are_ready_dependents_are_not() {
        let a = instance("a", vec![], StepStatus::Pending);
        let c = instance("c", vec![], StepStatus::Pending);
        let b = instance("b", vec![a.id, c.id], StepStatus::Pending);
        let exec = execution(vec![a, b, c]);

        let ready = ready_steps(&exec);
        assert_eq!(ready.len(), 2, "only the roots are ready");
        let ready_defs: Vec<&str> = ready
            .iter()
            .map(|id| exec.step(*id).unwrap().definition_id.as_str())
            .collect();
        assert_eq!(ready_defs, vec!["a", "c"], "definition order preserved");
    }

    #[test]
    fn dependent_becomes_ready_once_all_deps_completed() {
        let a = instance("a", vec![], StepStatus::Completed);
        let c = instance("c", vec![], StepStatus::Pending);
        let b = instance("b", vec![a.id, c.id], StepStatus::Pending);
        let mut exec = execution(vec![a, b, c.clone()]);

        // c still pending -- b not ready
        let ready = ready_steps(&exec);
        assert_eq!(ready.len(), 1);

        exec.step_mut(c.id).unwrap().status = StepStatus::Completed;
        let ready = ready_steps(&exec);
        assert_eq!(ready.len(), 1);
        assert_eq!(exec.step(ready[0]).unwrap().definition_id, "b");
    }

    #[test]
    fn skipped_dependency_does_not_satisfy_readiness() {
        let a = instance("a", vec![], StepStatus::Skipped);
        let b = instance("b", vec![a.id], StepStatus::Pending);
        let exec = execution(vec![a, b]);
        assert!(ready_steps(&exec).is_empty());
        assert!(is_deadlocked(&exec));
    }

    // -----------------------------------------------------------------------
    // Deadlock
    // -----------------------------------------------------------------------

    #[test]
    fn no_deadlock_while_a_step_is_running() {
        let a = instance("a", vec![], StepStatus::Running);
        let b = instance("b", vec![a.id], StepStatus::Pending);
        let exec = execution(vec![a, b]);
        assert!(!is_deadlocked(&exec), "blocked on in-flight is not deadlock");
    }

    #[test]
    fn failed_dependency_blocks_dependents_into_deadlock() {
        let a = instance("a", vec![], StepStatus::Failed);
        let b = instance("b", vec![a.id], StepStatus::Pending);
        let exec = execution(vec![a, b]);
        assert!(has_pending(&exec));
        assert!(ready_steps(&exec).is_empty());
        assert!(is_deadlocked(&exec));
        assert_eq!(blocked_steps(&exec), vec!["b"]);
    }

    #[test]
    fn no_deadlock_when_nothing_pending() {
        let a = instance("a", vec![], StepStatus::Completed);
        let exec = execution(vec![a]);
        assert!(!has_pending(&exec));
        assert!(!is_deadlocked(&exec));
    }
}
