//! Typed errors for the cases callers branch on.
//!
//! Everything else is `anyhow::Error` with context; these types are returned
//! inside `anyhow::Error` and recovered with `downcast_ref`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The plan cannot be run. Raised before any task starts.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("plan {} contains no tasks", .0.display())]
    Empty(PathBuf),
    #[error("plan failed validation:\n  {}", .errors.join("\n  "))]
    Invalid { errors: Vec<String> },
}

/// Why one task attempt did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("agent stream error: {0}")]
    Stream(String),
    #[error("agent reported an error: {0}")]
    AgentReported(String),
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("acceptance criteria not checked: {}", .0.join("; "))]
    CriteriaUnmet(Vec<String>),
    #[error("agent finished without calling task_complete")]
    MissingCompletionSignal,
    #[error("agent exited without a result (exit status {0})")]
    AgentExited(String),
    #[error("could not checkpoint task: {0}")]
    Checkpoint(String),
}

impl TaskError {
    /// Soft failures and hard failures alike are retried until attempts run out;
    /// only checkpoint failures are terminal immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Checkpoint(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_error_survives_anyhow_round_trip() {
        let err: anyhow::Error = PlanError::Invalid {
            errors: vec!["a".into(), "b".into()],
        }
        .into();
        let plan_err = err.downcast_ref::<PlanError>().expect("downcast");
        assert!(matches!(plan_err, PlanError::Invalid { errors } if errors.len() == 2));
        assert!(err.to_string().contains("\n  b"));
    }

    #[test]
    fn timeout_message_names_seconds() {
        let err = TaskError::Timeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "timed out after 90s");
        assert!(err.is_retryable());
        assert!(!TaskError::Checkpoint("x".into()).is_retryable());
    }
}
