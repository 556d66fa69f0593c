//! Merges the plan document, a session, and commit history into one runtime
//! status per task.
//!
//! Precedence, highest first: document marks the task done, session has it
//! current, session completed/skipped it, session failed it, commit history
//! mentions it (only when no session exists), otherwise pending. A second pass
//! turns `pending` into `blocked` when any dependency is not completed.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::core::resolver::next_task;
use crate::core::session::Session;
use crate::core::types::{Plan, Task, TaskStatus};

/// Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Failed,
}

/// Base status for one task, before blocked derivation.
///
/// `committed` holds task ids found in commit history; it is consulted only
/// when `session` is `None`.
pub fn runtime_status(
    task: &Task,
    session: Option<&Session>,
    committed: &HashSet<String>,
) -> RuntimeStatus {
    if task.status.is_done() {
        return RuntimeStatus::Completed;
    }
    match session {
        Some(session) => {
            if session.current_task_id.as_deref() == Some(task.id.as_str())
                || session.in_flight().contains(&task.id.as_str())
            {
                RuntimeStatus::InProgress
            } else if session.is_settled(&task.id) {
                RuntimeStatus::Completed
            } else if session.failed_tasks.contains(&task.id) {
                RuntimeStatus::Failed
            } else {
                RuntimeStatus::Pending
            }
        }
        None if committed.contains(&task.id) => RuntimeStatus::Completed,
        None => RuntimeStatus::Pending,
    }
}

/// Per-task view returned to status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRuntime {
    pub id: String,
    pub title: String,
    pub document_status: TaskStatus,
    pub status: RuntimeStatus,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRuntimeSummary {
    pub project_name: String,
    pub total: usize,
    pub counts: StatusCounts,
    /// Whole percent of completed tasks; 0 for an empty plan.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Task the next run would start first.
    pub next_task: Option<String>,
    pub tasks: Vec<TaskRuntime>,
}

/// Runtime status for every task, including the blocked pass.
pub fn reconcile(
    plan: &Plan,
    session: Option<&Session>,
    committed: &HashSet<String>,
) -> Vec<TaskRuntime> {
    let base: HashMap<&str, RuntimeStatus> = plan
        .tasks
        .iter()
        .map(|task| (task.id.as_str(), runtime_status(task, session, committed)))
        .collect();

    plan.tasks
        .iter()
        .map(|task| {
            let mut status = base[task.id.as_str()];
            if status == RuntimeStatus::Pending
                && task
                    .dependencies
                    .iter()
                    .any(|dep| base.get(dep.as_str()) != Some(&RuntimeStatus::Completed))
            {
                status = RuntimeStatus::Blocked;
            }
            TaskRuntime {
                id: task.id.clone(),
                title: task.title.clone(),
                document_status: task.status,
                status,
                dependencies: task.dependencies.clone(),
            }
        })
        .collect()
}

pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (completed as f64 * 100.0 / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

pub fn summarize(
    plan: &Plan,
    session: Option<&Session>,
    committed: &HashSet<String>,
) -> PlanRuntimeSummary {
    let tasks = reconcile(plan, session, committed);
    let mut counts = StatusCounts::default();
    for task in &tasks {
        match task.status {
            RuntimeStatus::Pending => counts.pending += 1,
            RuntimeStatus::InProgress => counts.in_progress += 1,
            RuntimeStatus::Completed => counts.completed += 1,
            RuntimeStatus::Blocked => counts.blocked += 1,
            RuntimeStatus::Failed => counts.failed += 1,
        }
    }
    let completed: HashSet<String> = tasks
        .iter()
        .filter(|task| task.status == RuntimeStatus::Completed)
        .map(|task| task.id.clone())
        .collect();
    PlanRuntimeSummary {
        project_name: plan.project_name.clone(),
        total: tasks.len(),
        progress: progress_percent(counts.completed, tasks.len()),
        counts,
        session_id: session.map(|s| s.session_id.clone()),
        next_task: next_task(plan, &completed).map(|task| task.id.clone()),
        tasks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::{CompletionSource, TaskResult};
    use crate::test_support::{plan_of, task};
    use chrono::Utc;

    fn status_of(rows: &[TaskRuntime], id: &str) -> RuntimeStatus {
        rows.iter().find(|row| row.id == id).map(|row| row.status).expect("task row")
    }

    fn ok() -> TaskResult {
        TaskResult {
            completion: CompletionSource::Signal,
            summary: None,
            commit: None,
            agent_session_id: None,
            duration_ms: 1,
        }
    }

    #[test]
    fn document_status_wins_without_session() {
        let mut done = task("task-001", &[]);
        done.status = TaskStatus::Implemented;
        let plan = plan_of(vec![done]);
        let rows = reconcile(&plan, None, &HashSet::new());
        assert_eq!(status_of(&rows, "task-001"), RuntimeStatus::Completed);
    }

    #[test]
    fn document_status_wins_over_failed_session() {
        let mut done = task("task-001", &[]);
        done.status = TaskStatus::Verified;
        let plan = plan_of(vec![done]);
        let mut session = Session::new("s", "plan.md", Utc::now());
        session.record_task_start("task-001", 1, None, Utc::now());
        session.record_task_result("task-001", Err("x".into()), Utc::now());
        let rows = reconcile(&plan, Some(&session), &HashSet::new());
        assert_eq!(status_of(&rows, "task-001"), RuntimeStatus::Completed);
    }

    #[test]
    fn session_sets_drive_status() {
        let plan = plan_of(vec![
            task("task-001", &[]),
            task("task-002", &[]),
            task("task-003", &[]),
            task("task-004", &[]),
        ]);
        let mut session = Session::new("s", "plan.md", Utc::now());
        session.record_task_start("task-001", 1, None, Utc::now());
        session.record_task_result("task-001", Ok(ok()), Utc::now());
        session.record_task_start("task-002", 1, None, Utc::now());
        session.record_task_result("task-002", Err("boom".into()), Utc::now());
        session.record_skip("task-003", Utc::now());
        session.record_task_start("task-004", 1, None, Utc::now());

        let rows = reconcile(&plan, Some(&session), &HashSet::new());
        assert_eq!(status_of(&rows, "task-001"), RuntimeStatus::Completed);
        assert_eq!(status_of(&rows, "task-002"), RuntimeStatus::Failed);
        assert_eq!(status_of(&rows, "task-003"), RuntimeStatus::Completed);
        assert_eq!(status_of(&rows, "task-004"), RuntimeStatus::InProgress);
    }

    #[test]
    fn commit_history_only_used_without_session() {
        let plan = plan_of(vec![task("task-001", &[])]);
        let committed: HashSet<String> = ["task-001".to_string()].into();
        let rows = reconcile(&plan, None, &committed);
        assert_eq!(status_of(&rows, "task-001"), RuntimeStatus::Completed);

        let session = Session::new("s", "plan.md", Utc::now());
        let rows = reconcile(&plan, Some(&session), &committed);
        assert_eq!(status_of(&rows, "task-001"), RuntimeStatus::Pending);
    }

    #[test]
    fn pending_with_incomplete_dependency_is_blocked() {
        let plan = plan_of(vec![
            task("task-001", &[]),
            task("task-002", &["task-001"]),
            task("task-003", &["task-002"]),
        ]);
        let rows = reconcile(&plan, None, &HashSet::new());
        assert_eq!(status_of(&rows, "task-001"), RuntimeStatus::Pending);
        assert_eq!(status_of(&rows, "task-002"), RuntimeStatus::Blocked);
        assert_eq!(status_of(&rows, "task-003"), RuntimeStatus::Blocked);
    }

    #[test]
    fn failed_dependency_blocks_dependents() {
        let plan = plan_of(vec![task("task-001", &[]), task("task-002", &["task-001"])]);
        let mut session = Session::new("s", "plan.md", Utc::now());
        session.record_task_start("task-001", 2, None, Utc::now());
        session.record_task_result("task-001", Err("gave up".into()), Utc::now());
        let rows = reconcile(&plan, Some(&session), &HashSet::new());
        assert_eq!(status_of(&rows, "task-001"), RuntimeStatus::Failed);
        assert_eq!(status_of(&rows, "task-002"), RuntimeStatus::Blocked);
    }

    #[test]
    fn progress_rounds_completed_share() {
        let tasks = (1..=10).map(|n| task(&format!("task-{n:03}"), &[])).collect();
        let plan = plan_of(tasks);
        let mut session = Session::new("s", "plan.md", Utc::now());
        for n in 1..=4 {
            let id = format!("task-{n:03}");
            session.record_task_start(&id, 1, None, Utc::now());
            session.record_task_result(&id, Ok(ok()), Utc::now());
        }
        session.record_task_start("task-005", 1, None, Utc::now());
        session.record_task_result("task-005", Err("no".into()), Utc::now());

        let summary = summarize(&plan, Some(&session), &HashSet::new());
        assert_eq!(summary.counts.completed, 4);
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(summary.counts.pending, 5);
        assert_eq!(summary.counts.blocked, 0);
        assert_eq!(summary.progress, 40);
    }

    #[test]
    fn next_task_follows_completed_dependencies() {
        let plan = plan_of(vec![task("task-001", &[]), task("task-002", &["task-001"])]);
        assert_eq!(
            summarize(&plan, None, &HashSet::new()).next_task.as_deref(),
            Some("task-001")
        );

        let committed: HashSet<String> = ["task-001".to_string()].into();
        assert_eq!(
            summarize(&plan, None, &committed).next_task.as_deref(),
            Some("task-002")
        );

        let all: HashSet<String> = ["task-001".to_string(), "task-002".to_string()].into();
        assert_eq!(summarize(&plan, None, &all).next_task, None);
    }

    #[test]
    fn empty_plan_has_zero_progress() {
        let summary = summarize(&plan_of(Vec::new()), None, &HashSet::new());
        assert_eq!(summary.total, 0);
        assert_eq!(summary.progress, 0);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
    }
}
