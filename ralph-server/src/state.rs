//! Shared application state for the server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ralph::engine::{CancelToken, Engine, RunSummary};
use ralph::events::EventBus;
use ralph::io::config::RalphConfig;
use ralph::io::registry::Registry;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

/// How long a finished execution stays answerable through `/status`.
pub const FINISHED_RETENTION: Duration = Duration::from_secs(15 * 60);

/// Builds the engine for one run. Swapped out in tests.
pub type EngineFactory = Arc<dyn Fn(&RalphConfig, EventBus) -> Engine + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// One run started through `POST /execute`.
#[derive(Debug, Clone)]
pub struct Execution {
    pub session_id: String,
    pub plan_path: PathBuf,
    pub project_root: PathBuf,
    pub status: ExecutionStatus,
    pub result: Option<RunSummary>,
    pub error: Option<String>,
    pub cancel: CancelToken,
    /// Flips to `true` once the run task has stored its outcome.
    pub finished: watch::Receiver<bool>,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub bus: EventBus,
    pub engine_factory: EngineFactory,
    pub executions: Arc<Mutex<HashMap<String, Execution>>>,
    pub finished_retention: Duration,
    /// Project roots the session watcher should pick up.
    watch_tx: Option<mpsc::UnboundedSender<PathBuf>>,
}

impl AppState {
    pub fn new(registry: Registry, bus: EventBus, engine_factory: EngineFactory) -> Self {
        Self {
            registry: Arc::new(registry),
            bus,
            engine_factory,
            executions: Arc::new(Mutex::new(HashMap::new())),
            finished_retention: FINISHED_RETENTION,
            watch_tx: None,
        }
    }

    /// The `claude` agent and the configured verification command.
    pub fn default_engine_factory() -> EngineFactory {
        Arc::new(|config: &RalphConfig, bus: EventBus| Engine::for_config(config, bus))
    }

    pub fn with_watcher(mut self, watch_tx: mpsc::UnboundedSender<PathBuf>) -> Self {
        self.watch_tx = Some(watch_tx);
        self
    }

    pub fn with_finished_retention(mut self, retention: Duration) -> Self {
        self.finished_retention = retention;
        self
    }

    /// Ask the watcher to follow sessions under `project_root`.
    pub fn watch_project(&self, project_root: &Path) {
        if let Some(tx) = &self.watch_tx {
            let _ = tx.send(project_root.to_path_buf());
        }
    }

    pub fn with_executions<T>(&self, f: impl FnOnce(&mut HashMap<String, Execution>) -> T) -> T {
        let mut executions = self
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut executions)
    }

    pub fn execution(&self, session_id: &str) -> Option<Execution> {
        self.with_executions(|executions| executions.get(session_id).cloned())
    }

    /// Drop a finished execution once `finished_retention` has passed.
    pub async fn expire_finished(&self, session_id: &str) {
        tokio::time::sleep(self.finished_retention).await;
        self.with_executions(|executions| {
            if executions
                .get(session_id)
                .is_some_and(|e| e.status != ExecutionStatus::Running)
            {
                executions.remove(session_id);
            }
        });
    }

    /// Running execution for `plan_path`, if any.
    pub fn running_for_plan(&self, plan_path: &Path) -> Option<String> {
        self.with_executions(|executions| {
            executions
                .values()
                .find(|e| e.status == ExecutionStatus::Running && e.plan_path == plan_path)
                .map(|e| e.session_id.clone())
        })
    }

    /// Project roots known from the registry and from executions.
    pub fn known_project_roots(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut roots: Vec<PathBuf> = self
            .registry
            .list()?
            .into_iter()
            .map(|plan| plan.project_root)
            .collect();
        roots.extend(self.with_executions(|executions| {
            executions
                .values()
                .map(|e| e.project_root.clone())
                .collect::<Vec<_>>()
        }));
        roots.sort();
        roots.dedup();
        Ok(roots)
    }
}
