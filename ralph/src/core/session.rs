//! Execution session model.
//!
//! A [`Session`] records what one run has done to a plan. Mutation methods are
//! pure (callers pass `now`), so the same rules apply in tests and at runtime.
//! Invariants maintained here:
//!
//! - a task id is in at most one of `completed_tasks`/`failed_tasks`/`skipped_tasks`;
//! - `current_task_id`, when set, names a task whose latest execution is `in_progress`;
//! - `task_history` is append-only.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one [`TaskExecution`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// How the engine learned that the agent finished a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    /// The agent called the `task_complete` side-channel tool.
    Signal,
    /// The agent's stream ended with a successful `result` message only.
    ResultMessage,
}

/// Payload stored on a completed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub completion: CompletionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Commit hash captured after the task was checkpointed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    pub duration_ms: u64,
}

/// One append-only history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub task_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted record of one execution run against one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub plan_path: PathBuf,
    pub completed_tasks: BTreeSet<String>,
    pub skipped_tasks: BTreeSet<String>,
    pub failed_tasks: BTreeSet<String>,
    pub current_task_id: Option<String>,
    pub task_history: Vec<TaskExecution>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Agent conversation to resume for the next task (session continuity).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, plan_path: impl Into<PathBuf>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            plan_path: plan_path.into(),
            completed_tasks: BTreeSet::new(),
            skipped_tasks: BTreeSet::new(),
            failed_tasks: BTreeSet::new(),
            current_task_id: None,
            task_history: Vec::new(),
            started_at: now,
            last_activity: now,
            agent_session_id: None,
        }
    }

    /// Latest history entry for a task.
    pub fn latest_execution(&self, task_id: &str) -> Option<&TaskExecution> {
        self.task_history
            .iter()
            .rev()
            .find(|entry| entry.task_id == task_id)
    }

    /// Tasks whose latest entry is `in_progress`, in first-start order.
    pub fn in_flight(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for entry in &self.task_history {
            let id = entry.task_id.as_str();
            if !seen.insert(id) {
                continue;
            }
            if self
                .latest_execution(id)
                .is_some_and(|latest| latest.status == ExecutionStatus::InProgress)
            {
                out.push(id);
            }
        }
        out
    }

    /// Completed or skipped: the task satisfies its dependents.
    pub fn is_settled(&self, task_id: &str) -> bool {
        self.completed_tasks.contains(task_id) || self.skipped_tasks.contains(task_id)
    }

    fn clear_sets(&mut self, task_id: &str) {
        self.completed_tasks.remove(task_id);
        self.failed_tasks.remove(task_id);
        self.skipped_tasks.remove(task_id);
    }

    fn release_current(&mut self, task_id: &str) {
        if self.current_task_id.as_deref() == Some(task_id) {
            self.current_task_id = self.in_flight().last().map(|id| (*id).to_string());
        }
    }

    /// Append an `in_progress` entry for attempt `attempt` and make it current.
    ///
    /// A task restarted on resume leaves `failed_tasks` here.
    pub fn record_task_start(
        &mut self,
        task_id: &str,
        attempt: u32,
        previous_error: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.clear_sets(task_id);
        self.task_history.push(TaskExecution {
            task_id: task_id.to_string(),
            status: ExecutionStatus::InProgress,
            started_at: now,
            completed_at: None,
            attempts: attempt,
            result: None,
            error: previous_error,
        });
        self.current_task_id = Some(task_id.to_string());
        self.last_activity = now;
    }

    /// Append the terminal entry for a task and move it into the matching set.
    pub fn record_task_result(
        &mut self,
        task_id: &str,
        outcome: Result<TaskResult, String>,
        now: DateTime<Utc>,
    ) {
        let (started_at, attempts) = self
            .latest_execution(task_id)
            .map_or((now, 1), |entry| (entry.started_at, entry.attempts));
        self.clear_sets(task_id);
        let (status, result, error) = match outcome {
            Ok(result) => {
                self.completed_tasks.insert(task_id.to_string());
                (ExecutionStatus::Completed, Some(result), None)
            }
            Err(error) => {
                self.failed_tasks.insert(task_id.to_string());
                (ExecutionStatus::Failed, None, Some(error))
            }
        };
        self.task_history.push(TaskExecution {
            task_id: task_id.to_string(),
            status,
            started_at,
            completed_at: Some(now),
            attempts,
            result,
            error,
        });
        self.release_current(task_id);
        self.last_activity = now;
    }

    pub fn record_skip(&mut self, task_id: &str, now: DateTime<Utc>) {
        self.clear_sets(task_id);
        self.skipped_tasks.insert(task_id.to_string());
        self.task_history.push(TaskExecution {
            task_id: task_id.to_string(),
            status: ExecutionStatus::Skipped,
            started_at: now,
            completed_at: Some(now),
            attempts: 0,
            result: None,
            error: None,
        });
        self.release_current(task_id);
        self.last_activity = now;
    }

    /// Check the set/current invariants; returns human-readable violations.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for id in &self.completed_tasks {
            if self.failed_tasks.contains(id) || self.skipped_tasks.contains(id) {
                errors.push(format!("{id}: recorded in more than one outcome set"));
            }
        }
        for id in self.failed_tasks.intersection(&self.skipped_tasks) {
            errors.push(format!("{id}: recorded as both failed and skipped"));
        }
        if let Some(current) = &self.current_task_id {
            let in_progress = self
                .latest_execution(current)
                .is_some_and(|entry| entry.status == ExecutionStatus::InProgress);
            if !in_progress {
                errors.push(format!("{current}: current task is not in progress"));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid time")
    }

    fn ok_result() -> TaskResult {
        TaskResult {
            completion: CompletionSource::Signal,
            summary: Some("done".to_string()),
            commit: None,
            agent_session_id: None,
            duration_ms: 10,
        }
    }

    #[test]
    fn start_then_complete_moves_task_into_completed() {
        let mut session = Session::new("s-1", "plan.md", at(0));
        session.record_task_start("task-001", 1, None, at(1));
        assert_eq!(session.current_task_id.as_deref(), Some("task-001"));
        assert_eq!(session.in_flight(), vec!["task-001"]);

        session.record_task_result("task-001", Ok(ok_result()), at(5));
        assert!(session.completed_tasks.contains("task-001"));
        assert!(session.current_task_id.is_none());
        assert_eq!(session.task_history.len(), 2);
        let last = session.latest_execution("task-001").expect("entry");
        assert_eq!(last.status, ExecutionStatus::Completed);
        assert_eq!(last.started_at, at(1));
        assert_eq!(last.completed_at, Some(at(5)));
        assert_eq!(session.last_activity, at(5));
        assert!(session.invariant_violations().is_empty());
    }

    #[test]
    fn restart_after_failure_leaves_failed_set() {
        let mut session = Session::new("s-1", "plan.md", at(0));
        session.record_task_start("task-001", 1, None, at(1));
        session.record_task_result("task-001", Err("boom".to_string()), at(2));
        assert!(session.failed_tasks.contains("task-001"));

        session.record_task_start("task-001", 1, None, at(3));
        assert!(!session.failed_tasks.contains("task-001"));
        assert!(session.invariant_violations().is_empty());
    }

    #[test]
    fn retry_entry_carries_attempt_and_previous_error() {
        let mut session = Session::new("s-1", "plan.md", at(0));
        session.record_task_start("task-001", 1, None, at(1));
        session.record_task_start("task-001", 2, Some("timed out".to_string()), at(2));
        session.record_task_result("task-001", Err("timed out".to_string()), at(3));
        let last = session.latest_execution("task-001").expect("entry");
        assert_eq!(last.attempts, 2);
        assert_eq!(last.started_at, at(2));
        assert_eq!(session.task_history[1].error.as_deref(), Some("timed out"));
    }

    #[test]
    fn current_moves_to_remaining_in_flight_task() {
        let mut session = Session::new("s-1", "plan.md", at(0));
        session.record_task_start("task-001", 1, None, at(1));
        session.record_task_start("task-002", 1, None, at(2));
        assert_eq!(session.current_task_id.as_deref(), Some("task-002"));

        session.record_task_result("task-002", Ok(ok_result()), at(3));
        assert_eq!(session.current_task_id.as_deref(), Some("task-001"));
        assert!(session.invariant_violations().is_empty());
    }

    #[test]
    fn skip_settles_task() {
        let mut session = Session::new("s-1", "plan.md", at(0));
        session.record_skip("task-003", at(1));
        assert!(session.is_settled("task-003"));
        assert_eq!(
            session.latest_execution("task-003").map(|e| e.status),
            Some(ExecutionStatus::Skipped)
        );
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let session = Session::new("s-1", "plan.md", at(0));
        let value = serde_json::to_value(&session).expect("serialize");
        for key in [
            "sessionId",
            "planPath",
            "completedTasks",
            "skippedTasks",
            "failedTasks",
            "currentTaskId",
            "taskHistory",
            "startedAt",
            "lastActivity",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }
}
