//! Runtime status for a plan on disk.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, instrument};

use super::git::Git;
use super::paths::RalphPaths;
use super::plan_store::load_plan;
use super::session_store::SessionStore;
use crate::core::reconcile::{PlanRuntimeSummary, summarize};

/// Reconcile the plan document with its latest session.
///
/// Commit history is read only when no session exists for the plan.
#[instrument(skip_all, fields(plan = %plan_path.display()))]
pub fn plan_runtime_status(project_root: &Path, plan_path: &Path) -> Result<PlanRuntimeSummary> {
    let plan = load_plan(plan_path)?;
    let store = SessionStore::new(&RalphPaths::new(project_root));
    let session = store.load(plan_path)?;
    let committed = match &session {
        Some(_) => HashSet::new(),
        None => Git::new(project_root).task_ids_in_log()?,
    };
    debug!(
        session = ?session.as_ref().map(|s| &s.session_id),
        committed = committed.len(),
        "reconciling plan status"
    );
    Ok(summarize(&plan, session.as_ref(), &committed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reconcile::RuntimeStatus;
    use crate::io::git::task_commit_message;
    use crate::test_support::TestProject;
    use chrono::Utc;

    fn status_of(summary: &PlanRuntimeSummary, id: &str) -> RuntimeStatus {
        summary
            .tasks
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.status)
            .expect("task")
    }

    #[test]
    fn falls_back_to_commit_history_without_session() {
        let project = TestProject::new(&[("task-001", &[]), ("task-002", &["task-001"])]);
        project.commit_file("a.txt", &task_commit_message("task-001", "First"));

        let summary = plan_runtime_status(project.root(), &project.plan_path()).expect("status");
        assert_eq!(status_of(&summary, "task-001"), RuntimeStatus::Completed);
        assert_eq!(status_of(&summary, "task-002"), RuntimeStatus::Pending);
        assert_eq!(summary.progress, 50);
    }

    #[test]
    fn history_fallback_ignores_commits_that_only_mention_tasks() {
        let project = TestProject::new(&[("task-001", &[]), ("task-002", &[])]);
        project.commit_file("notes.md", "docs: outline plan for task-001 and task-002");

        let summary = plan_runtime_status(project.root(), &project.plan_path()).expect("status");
        assert_eq!(status_of(&summary, "task-001"), RuntimeStatus::Pending);
        assert_eq!(status_of(&summary, "task-002"), RuntimeStatus::Pending);
        assert_eq!(summary.progress, 0);
    }

    #[test]
    fn session_takes_precedence_over_history() {
        let project = TestProject::new(&[("task-001", &[]), ("task-002", &["task-001"])]);
        project.commit_file("a.txt", &task_commit_message("task-001", "First"));
        let store = SessionStore::new(&RalphPaths::new(project.root()));
        let mut session = store.create(&project.plan_path());
        session.record_task_start("task-001", 1, None, Utc::now());
        store.persist(&session).expect("persist");

        let summary = plan_runtime_status(project.root(), &project.plan_path()).expect("status");
        assert_eq!(summary.session_id.as_deref(), Some(session.session_id.as_str()));
        assert_eq!(status_of(&summary, "task-001"), RuntimeStatus::InProgress);
        assert_eq!(status_of(&summary, "task-002"), RuntimeStatus::Blocked);
    }
}
