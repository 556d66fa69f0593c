//! Structural validation of a parsed plan.
//!
//! Errors make a plan unrunnable: malformed or duplicate ids, dependencies on
//! unknown tasks, dependency cycles, or no tasks at all. Warnings are advisory.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::Plan;

static TASK_ID_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^task-\d{3,}$").expect("valid regex"));

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// True if `id` has the canonical `task-NNN` shape.
pub fn is_valid_task_id(id: &str) -> bool {
    TASK_ID_FORMAT.is_match(id)
}

pub fn validate(plan: &Plan) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if plan.tasks.is_empty() {
        errors.push("plan has no tasks".to_string());
    }

    let mut seen = HashSet::new();
    for task in &plan.tasks {
        if !is_valid_task_id(&task.id) {
            errors.push(format!(
                "{}: malformed task id (expected task-NNN)",
                task.id
            ));
        }
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("{}: duplicate task id", task.id));
        }
        if task.acceptance_criteria.is_empty() {
            warnings.push(format!("{}: no acceptance criteria", task.id));
        }
    }

    for task in &plan.tasks {
        for dep in &task.dependencies {
            if !seen.contains(dep.as_str()) {
                errors.push(format!("{}: unknown dependency '{}'", task.id, dep));
            }
        }
    }

    for cycle in find_cycles(plan) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search with an explicit recursion stack. Each reported cycle
/// starts and ends with the same id, e.g. `[a, b, a]`.
fn find_cycles(plan: &Plan) -> Vec<Vec<String>> {
    let index: HashMap<&str, usize> = plan
        .tasks
        .iter()
        .enumerate()
        .map(|(i, task)| (task.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; plan.tasks.len()];
    let mut stack = Vec::new();
    let mut cycles = Vec::new();

    for start in 0..plan.tasks.len() {
        if marks[start] == Mark::Unvisited {
            visit(plan, &index, start, &mut marks, &mut stack, &mut cycles);
        }
    }
    cycles
}

fn visit(
    plan: &Plan,
    index: &HashMap<&str, usize>,
    node: usize,
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
    cycles: &mut Vec<Vec<String>>,
) {
    marks[node] = Mark::OnStack;
    stack.push(node);
    for dep in &plan.tasks[node].dependencies {
        let Some(&next) = index.get(dep.as_str()) else {
            continue;
        };
        match marks[next] {
            Mark::Unvisited => visit(plan, index, next, marks, stack, cycles),
            Mark::OnStack => {
                let from = stack.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<String> = stack[from..]
                    .iter()
                    .map(|&n| plan.tasks[n].id.clone())
                    .collect();
                cycle.push(plan.tasks[next].id.clone());
                cycles.push(cycle);
            }
            Mark::Done => {}
        }
    }
    stack.pop();
    marks[node] = Mark::Done;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_of, task};

    #[test]
    fn valid_plan_passes() {
        let plan = plan_of(vec![task("task-001", &[]), task("task-002", &["task-001"])]);
        let report = validate(&plan);
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn empty_plan_is_invalid() {
        let report = validate(&plan_of(Vec::new()));
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("no tasks")));
    }

    #[test]
    fn reports_format_duplicate_and_unknown_dependency() {
        let plan = plan_of(vec![
            task("task-1", &[]),
            task("task-002", &["task-404"]),
            task("task-002", &[]),
        ]);
        let report = validate(&plan);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("malformed task id")));
        assert!(report.errors.iter().any(|e| e.contains("duplicate task id")));
        assert!(report.errors.iter().any(|e| e.contains("unknown dependency 'task-404'")));
    }

    #[test]
    fn reports_cycle_path() {
        let plan = plan_of(vec![
            task("task-001", &["task-003"]),
            task("task-002", &["task-001"]),
            task("task-003", &["task-002"]),
        ]);
        let report = validate(&plan);
        assert!(!report.valid);
        assert!(
            report
                .errors
                .iter()
                .any(|e| e == "dependency cycle: task-001 -> task-003 -> task-002 -> task-001"),
            "{:?}",
            report.errors
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let report = validate(&plan_of(vec![task("task-001", &["task-001"])]));
        assert!(report.errors.iter().any(|e| e.contains("task-001 -> task-001")));
    }

    #[test]
    fn missing_criteria_is_a_warning_only() {
        let mut bare = task("task-001", &[]);
        bare.acceptance_criteria.clear();
        let report = validate(&plan_of(vec![bare]));
        assert!(report.valid);
        assert_eq!(report.warnings, vec!["task-001: no acceptance criteria"]);
    }
}
