//! Plan and task types shared by the parser, resolver, and reconciler.
//!
//! A [`Plan`] is parsed fresh from its backing document on every load and is
//! never mutated in place. Task status changes flow back into the document
//! through the plan store, not through these structs.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scheduling hint attached to a task. Defaults to `Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" | "critical" | "p0" | "p1" => Ok(Self::High),
            "medium" | "normal" | "p2" => Ok(Self::Medium),
            "low" | "p3" => Ok(Self::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Hand-editable status recorded in the plan document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    ToDo,
    InProgress,
    Implemented,
    NeedsRework,
    Verified,
}

impl TaskStatus {
    /// `Implemented` and `Verified` are terminal: the document says the work is done.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Implemented | Self::Verified)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToDo => "ToDo",
            Self::InProgress => "InProgress",
            Self::Implemented => "Implemented",
            Self::NeedsRework => "NeedsRework",
            Self::Verified => "Verified",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    /// Accepts the canonical spelling plus common variants ("To Do", "in-progress", "done").
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "todo" | "pending" | "open" => Ok(Self::ToDo),
            "inprogress" | "wip" | "started" => Ok(Self::InProgress),
            "implemented" | "done" | "complete" | "completed" => Ok(Self::Implemented),
            "needsrework" | "rework" => Ok(Self::NeedsRework),
            "verified" => Ok(Self::Verified),
            _ => Err(format!("unknown status '{}'", value.trim())),
        }
    }
}

/// One checkbox item under a task's acceptance criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub text: String,
    pub completed: bool,
}

/// A unit of work driven through the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique id of the form `task-NNN`.
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    /// Ids of tasks that must complete first, in authoring order.
    pub dependencies: Vec<String>,
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_reference: Option<String>,
    /// Estimated effort, 1..=5.
    pub complexity: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub status: TaskStatus,
}

impl Task {
    /// True when every acceptance criterion is checked (vacuously true with none).
    pub fn criteria_met(&self) -> bool {
        self.acceptance_criteria.iter().all(|c| c.completed)
    }

    pub fn unmet_criteria(&self) -> Vec<String> {
        self.acceptance_criteria
            .iter()
            .filter(|c| !c.completed)
            .map(|c| c.text.clone())
            .collect()
    }
}

/// A parsed task plan. Task order is authoring order, not dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub project_name: String,
    pub description: String,
    pub tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    pub total_tasks: usize,
}

impl Plan {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Ids the document itself marks as done (`Implemented`/`Verified`).
    pub fn done_in_document(&self) -> HashSet<String> {
        self.tasks
            .iter()
            .filter(|task| task.status.is_done())
            .map(|task| task.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_loose_spellings() {
        assert_eq!("To Do".parse::<TaskStatus>(), Ok(TaskStatus::ToDo));
        assert_eq!("in-progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert_eq!("Needs Rework".parse::<TaskStatus>(), Ok(TaskStatus::NeedsRework));
        assert_eq!("done".parse::<TaskStatus>(), Ok(TaskStatus::Implemented));
        assert!("shipped".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert!("urgent-ish".parse::<Priority>().is_err());
    }

    #[test]
    fn status_serializes_in_document_spelling() {
        let json = serde_json::to_string(&TaskStatus::NeedsRework).expect("serialize");
        assert_eq!(json, "\"NeedsRework\"");
    }
}
