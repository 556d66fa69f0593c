//! In-process event bus for live progress.
//!
//! The bus is constructed by the process entry point and handed to the engine
//! and the server; there is no global instance. Publishing never blocks: slow
//! subscribers lag and lose events rather than stalling the engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::session::CompletionSource;

/// Events published while a plan runs. Serialized as `{"type": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RalphEvent {
    #[serde(rename = "task.started", rename_all = "camelCase")]
    TaskStarted {
        session_id: String,
        task_id: String,
        title: String,
        attempt: u32,
    },
    #[serde(rename = "task.retrying", rename_all = "camelCase")]
    TaskRetrying {
        session_id: String,
        task_id: String,
        attempt: u32,
        error: String,
    },
    #[serde(rename = "task.completed", rename_all = "camelCase")]
    TaskCompleted {
        session_id: String,
        task_id: String,
        completion: CompletionSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
        duration_ms: u64,
    },
    #[serde(rename = "task.failed", rename_all = "camelCase")]
    TaskFailed {
        session_id: String,
        task_id: String,
        attempts: u32,
        error: String,
    },
    #[serde(rename = "session.changed", rename_all = "camelCase")]
    SessionChanged {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_root: Option<PathBuf>,
    },
    #[serde(rename = "checkpoint.created", rename_all = "camelCase")]
    CheckpointCreated {
        session_id: String,
        task_id: String,
        commit: String,
    },
    #[serde(rename = "run.progress", rename_all = "camelCase")]
    RunProgress {
        session_id: String,
        completed: usize,
        failed: usize,
        total: usize,
        progress: u8,
    },
    #[serde(rename = "run.finished", rename_all = "camelCase")]
    RunFinished {
        session_id: String,
        completed: Vec<String>,
        failed: Vec<String>,
        blocked: Vec<String>,
        cancelled: bool,
    },
}

impl RalphEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task.started",
            Self::TaskRetrying { .. } => "task.retrying",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::SessionChanged { .. } => "session.changed",
            Self::CheckpointCreated { .. } => "checkpoint.created",
            Self::RunProgress { .. } => "run.progress",
            Self::RunFinished { .. } => "run.finished",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::TaskStarted { session_id, .. }
            | Self::TaskRetrying { session_id, .. }
            | Self::TaskCompleted { session_id, .. }
            | Self::TaskFailed { session_id, .. }
            | Self::SessionChanged { session_id, .. }
            | Self::CheckpointCreated { session_id, .. }
            | Self::RunProgress { session_id, .. }
            | Self::RunFinished { session_id, .. } => session_id,
        }
    }
}

/// Cloneable handle to one broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RalphEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send to current subscribers; having none is not an error.
    pub fn publish(&self, event: RalphEvent) {
        trace!(kind = event.kind(), session_id = event.session_id(), "publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RalphEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
