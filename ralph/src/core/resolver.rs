//! Dependency ordering and runnable-task selection.
//!
//! Selection is deterministic: ties between ready tasks always go to the task
//! that appears first in the plan document.

use std::collections::HashSet;

use thiserror::Error;

use crate::core::types::{Plan, Task};

/// Tasks that could not be ordered because they depend on each other.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle among {}", .0.join(", "))]
pub struct CycleError(pub Vec<String>);

/// Order tasks so each appears after all of its dependencies.
///
/// Stable: among tasks that are ready at the same time, document order wins.
/// Dependencies on ids outside `tasks` are ignored (validation reports them).
pub fn topological_sort(tasks: &[Task]) -> Result<Vec<&Task>, CycleError> {
    let known: HashSet<&str> = tasks.iter().map(|task| task.id.as_str()).collect();
    let mut placed: HashSet<&str> = HashSet::with_capacity(tasks.len());
    let mut ordered: Vec<&Task> = Vec::with_capacity(tasks.len());

    while ordered.len() < tasks.len() {
        let next = tasks.iter().find(|task| {
            !placed.contains(task.id.as_str())
                && task
                    .dependencies
                    .iter()
                    .all(|dep| placed.contains(dep.as_str()) || !known.contains(dep.as_str()))
        });
        match next {
            Some(task) => {
                placed.insert(task.id.as_str());
                ordered.push(task);
            }
            None => {
                let stuck = tasks
                    .iter()
                    .filter(|task| !placed.contains(task.id.as_str()))
                    .map(|task| task.id.clone())
                    .collect();
                return Err(CycleError(stuck));
            }
        }
    }
    Ok(ordered)
}

fn is_runnable(task: &Task, completed: &HashSet<String>) -> bool {
    !task.status.is_done()
        && !completed.contains(&task.id)
        && task.dependencies.iter().all(|dep| completed.contains(dep))
}

/// First task in document order that is not done and whose dependencies are all
/// in `completed`. `None` means everything is done or everything left is blocked.
pub fn next_task<'a>(plan: &'a Plan, completed: &HashSet<String>) -> Option<&'a Task> {
    plan.tasks.iter().find(|task| is_runnable(task, completed))
}

/// All runnable tasks in document order, minus `exclude` (in-flight or failed).
pub fn ready_tasks<'a>(
    plan: &'a Plan,
    completed: &HashSet<String>,
    exclude: &HashSet<String>,
) -> Vec<&'a Task> {
    plan.tasks
        .iter()
        .filter(|task| !exclude.contains(&task.id) && is_runnable(task, completed))
        .collect()
}

/// Unfinished tasks that can never run because a dependency failed, directly or
/// through another blocked task. Returned in document order.
pub fn blocked_tasks(
    plan: &Plan,
    completed: &HashSet<String>,
    failed: &HashSet<String>,
) -> Vec<String> {
    let mut dead: HashSet<&str> = failed.iter().map(String::as_str).collect();
    loop {
        let mut changed = false;
        for task in &plan.tasks {
            if dead.contains(task.id.as_str())
                || completed.contains(&task.id)
                || task.status.is_done()
            {
                continue;
            }
            if task.dependencies.iter().any(|dep| dead.contains(dep.as_str())) {
                dead.insert(task.id.as_str());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    plan.tasks
        .iter()
        .filter(|task| dead.contains(task.id.as_str()) && !failed.contains(&task.id))
        .map(|task| task.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::test_support::{plan_of, task};

    fn ids(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|task| task.id.clone()).collect()
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn sort_places_dependencies_first() {
        let tasks = vec![
            task("task-003", &["task-002"]),
            task("task-001", &[]),
            task("task-002", &["task-001"]),
        ];
        let ordered = topological_sort(&tasks).expect("acyclic");
        assert_eq!(ids(&ordered), vec!["task-001", "task-002", "task-003"]);
    }

    #[test]
    fn sort_breaks_ties_by_document_order() {
        let tasks = vec![
            task("task-002", &[]),
            task("task-004", &["task-001"]),
            task("task-001", &[]),
            task("task-003", &[]),
        ];
        let ordered = topological_sort(&tasks).expect("acyclic");
        assert_eq!(
            ids(&ordered),
            vec!["task-002", "task-001", "task-004", "task-003"]
        );
    }

    #[test]
    fn sort_output_respects_every_dependency() {
        let tasks = vec![
            task("task-005", &["task-004", "task-001"]),
            task("task-004", &["task-002", "task-003"]),
            task("task-003", &["task-001"]),
            task("task-002", &[]),
            task("task-001", &[]),
        ];
        let ordered = topological_sort(&tasks).expect("acyclic");
        assert_eq!(ordered.len(), tasks.len());
        for (pos, task) in ordered.iter().enumerate() {
            for dep in &task.dependencies {
                let dep_pos = ordered
                    .iter()
                    .position(|t| &t.id == dep)
                    .expect("dependency present");
                assert!(dep_pos < pos, "{dep} must precede {}", task.id);
            }
        }
    }

    #[test]
    fn sort_reports_cycle_members() {
        let tasks = vec![
            task("task-001", &[]),
            task("task-002", &["task-003"]),
            task("task-003", &["task-002"]),
        ];
        let err = topological_sort(&tasks).expect_err("cycle");
        assert_eq!(err.0, vec!["task-002", "task-003"]);
    }

    #[test]
    fn next_task_requires_all_dependencies() {
        let plan = plan_of(vec![
            task("task-001", &[]),
            task("task-002", &["task-001", "task-003"]),
            task("task-003", &[]),
        ]);
        let next = next_task(&plan, &set(&["task-001"])).expect("task-003 ready");
        assert_eq!(next.id, "task-003");

        let next = next_task(&plan, &set(&["task-001", "task-003"])).expect("task-002 ready");
        assert_eq!(next.id, "task-002");

        assert!(next_task(&plan, &set(&["task-001", "task-002", "task-003"])).is_none());
    }

    #[test]
    fn next_task_skips_tasks_done_in_document() {
        let mut done = task("task-001", &[]);
        done.status = TaskStatus::Verified;
        let plan = plan_of(vec![done, task("task-002", &[])]);
        assert_eq!(next_task(&plan, &HashSet::new()).map(|t| t.id.as_str()), Some("task-002"));
    }

    #[test]
    fn next_task_never_returns_task_with_missing_dependency() {
        let plan = plan_of(vec![task("task-002", &["task-001"]), task("task-001", &[])]);
        let next = next_task(&plan, &HashSet::new()).expect("ready");
        assert_eq!(next.id, "task-001");
        for dep in &next.dependencies {
            assert!(HashSet::<String>::new().contains(dep));
        }
    }

    #[test]
    fn ready_tasks_excludes_in_flight() {
        let plan = plan_of(vec![task("task-001", &[]), task("task-002", &[])]);
        let ready = ready_tasks(&plan, &HashSet::new(), &set(&["task-001"]));
        assert_eq!(ids(&ready), vec!["task-002"]);
    }

    #[test]
    fn blocked_propagates_through_chains() {
        let plan = plan_of(vec![
            task("task-001", &[]),
            task("task-002", &["task-001"]),
            task("task-003", &["task-002"]),
            task("task-004", &[]),
        ]);
        let blocked = blocked_tasks(&plan, &HashSet::new(), &set(&["task-001"]));
        assert_eq!(blocked, vec!["task-002", "task-003"]);
    }
}
