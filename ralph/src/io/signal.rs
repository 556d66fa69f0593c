//! Task completion signals exchanged between the side-channel server and the engine.
//!
//! The engine spawns the agent with a [`TaskBinding`] in its environment; the
//! agent's MCP server inherits it and, when `task_complete` is called, writes a
//! [`CompletionSignal`] to `.ralph/signals/<session-id>/<task-id>.json`. The
//! binding comes only from the environment, never from tool arguments.

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::paths::{RalphPaths, write_atomic};

pub const ENV_SESSION_ID: &str = "SESSION_ID";
pub const ENV_PLAN_PATH: &str = "PLAN_PATH";
pub const ENV_PROJECT_ROOT: &str = "PROJECT_ROOT";
pub const ENV_CURRENT_TASK_ID: &str = "CURRENT_TASK_ID";

/// Which session/task an agent process is working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBinding {
    pub session_id: String,
    pub plan_path: PathBuf,
    pub project_root: PathBuf,
    pub task_id: String,
}

impl TaskBinding {
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_SESSION_ID, self.session_id.clone()),
            (ENV_PLAN_PATH, self.plan_path.display().to_string()),
            (ENV_PROJECT_ROOT, self.project_root.display().to_string()),
            (ENV_CURRENT_TASK_ID, self.task_id.clone()),
        ]
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| anyhow!("{key} is not set; not running under ralph"))
        };
        Ok(Self {
            session_id: get(ENV_SESSION_ID)?,
            plan_path: PathBuf::from(get(ENV_PLAN_PATH)?),
            project_root: PathBuf::from(get(ENV_PROJECT_ROOT)?),
            task_id: get(ENV_CURRENT_TASK_ID)?,
        })
    }

    pub fn signal_path(&self) -> PathBuf {
        RalphPaths::new(&self.project_root).signal_file(&self.session_id, &self.task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub session_id: String,
    pub task_id: String,
    pub plan_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Record that the bound task is complete.
pub fn write_signal(binding: &TaskBinding, summary: Option<String>) -> Result<CompletionSignal> {
    let signal = CompletionSignal {
        session_id: binding.session_id.clone(),
        task_id: binding.task_id.clone(),
        plan_path: binding.plan_path.clone(),
        summary: summary.filter(|s| !s.trim().is_empty()),
        completed_at: Utc::now(),
    };
    let mut buf = serde_json::to_string_pretty(&signal).context("serialize completion signal")?;
    buf.push('\n');
    write_atomic(&binding.signal_path(), buf.as_bytes())?;
    debug!(session_id = %signal.session_id, task_id = %signal.task_id, "completion signal written");
    Ok(signal)
}

/// Remove a stale signal before a new attempt starts.
pub fn clear_signal(binding: &TaskBinding) -> Result<()> {
    let path = binding.signal_path();
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove signal {}", path.display())),
    }
}

/// The signal for `binding`, if one exists and names the same session and task.
pub fn read_signal(binding: &TaskBinding) -> Option<CompletionSignal> {
    let path = binding.signal_path();
    let contents = fs::read_to_string(&path).ok()?;
    let signal: CompletionSignal = match serde_json::from_str(&contents) {
        Ok(signal) => signal,
        Err(err) => {
            warn!(path = %path.display(), %err, "unreadable completion signal, ignoring");
            return None;
        }
    };
    if signal.session_id != binding.session_id || signal.task_id != binding.task_id {
        warn!(
            expected_task = %binding.task_id,
            signal_task = %signal.task_id,
            signal_session = %signal.session_id,
            "completion signal does not match binding, ignoring"
        );
        return None;
    }
    Some(signal)
}
