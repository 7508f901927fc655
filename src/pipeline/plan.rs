//! Layered topological ordering of pipeline tasks.

use super::types::TaskConfig;
use crate::error::{ModelOpsError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Group tasks into waves: each wave holds every task whose dependencies all
/// sit in earlier waves. Task ids inside a wave are sorted.
///
/// Fails with `Cycle` when tasks remain but none is ready, which covers both
/// dependency cycles and dependencies on unknown tasks.
pub fn build_execution_plan(tasks: &BTreeMap<String, TaskConfig>) -> Result<Vec<Vec<String>>> {
    let mut plan = Vec::new();
    let mut completed: BTreeSet<&str> = BTreeSet::new();
    let mut remaining: BTreeSet<&str> = tasks.keys().map(String::as_str).collect();

    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|task_id| {
                tasks[*task_id]
                    .dependencies
                    .iter()
                    .all(|dep| completed.contains(dep.as_str()))
            })
            .collect();

        if ready.is_empty() {
            return Err(ModelOpsError::Cycle(describe_unresolvable(tasks, &remaining)));
        }

        for task_id in &ready {
            remaining.remove(task_id);
            completed.insert(*task_id);
        }
        plan.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(plan)
}

fn describe_unresolvable(
    tasks: &BTreeMap<String, TaskConfig>,
    remaining: &BTreeSet<&str>,
) -> String {
    let missing: Vec<String> = remaining
        .iter()
        .flat_map(|task_id| {
            tasks[*task_id]
                .dependencies
                .iter()
                .filter(|dep| !tasks.contains_key(dep.as_str()))
                .map(move |dep| format!("{task_id} -> {dep}"))
        })
        .collect();

    let stuck = remaining.iter().copied().collect::<Vec<_>>().join(", ");
    if missing.is_empty() {
        format!("cannot resolve dependencies for [{stuck}]")
    } else {
        format!(
            "cannot resolve dependencies for [{stuck}]; unknown dependencies: {}",
            missing.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks(specs: &[(&str, &[&str])]) -> BTreeMap<String, TaskConfig> {
        specs
            .iter()
            .map(|(id, deps)| {
                (
                    id.to_string(),
                    TaskConfig::new(*id).depends_on(deps.iter().copied()),
                )
            })
            .collect()
    }

    #[test]
    fn test_waves_follow_dependencies() {
        let plan = build_execution_plan(&tasks(&[
            ("collect", &[]),
            ("profile", &[]),
            ("validate", &["collect"]),
            ("train", &["validate", "profile"]),
        ]))
        .unwrap();

        assert_eq!(
            plan,
            vec![
                vec!["collect".to_string(), "profile".to_string()],
                vec!["validate".to_string()],
                vec!["train".to_string()],
            ]
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = build_execution_plan(&tasks(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]))
            .unwrap_err();
        match err {
            ModelOpsError::Cycle(message) => assert!(message.contains("a, b"), "{message}"),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let err = build_execution_plan(&tasks(&[("train", &["ghost"])])).unwrap_err();
        assert!(err.to_string().contains("train -> ghost"));
    }

    #[test]
    fn test_empty_plan() {
        assert!(build_execution_plan(&BTreeMap::new()).unwrap().is_empty());
    }
}
