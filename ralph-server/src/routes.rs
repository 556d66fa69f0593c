//! HTTP route handlers for the plan API.

use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{delete, get, post};
use ralph::core::reconcile::{PlanRuntimeSummary, StatusCounts};
use ralph::engine::{CancelToken, ConfigOverrides, PreparedRun, RunOptions, RunSummary};
use ralph::io::paths::RalphPaths;
use ralph::io::registry::RegisteredPlan;
use ralph::io::session_store::SessionStore;
use ralph::io::status::plan_runtime_status;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, Execution, ExecutionStatus};

/// How long `DELETE /sessions/:id` waits for a cancelled run to wind down.
const CANCEL_WAIT: Duration = Duration::from_secs(10);

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/plans", get(list_plans))
        .route("/plans/{plan_id}", get(get_plan))
        .route("/plans/{plan_id}/restart", post(restart_plan))
        .route("/execute", post(execute))
        .route("/status/{session_id}", get(get_status))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}", delete(delete_session))
}

pub async fn health() -> &'static str {
    "ok"
}

/// Counts without per-task rows.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanProgress {
    pub total: usize,
    pub counts: StatusCounts,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl From<PlanRuntimeSummary> for PlanProgress {
    fn from(summary: PlanRuntimeSummary) -> Self {
        Self {
            total: summary.total,
            counts: summary.counts,
            progress: summary.progress,
            session_id: summary.session_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanListing {
    #[serde(flatten)]
    pub plan: RegisteredPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PlanProgress>,
    /// Set when the plan could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_session_id: Option<String>,
}

/// GET /api/plans - registered plans with their progress.
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<PlanListing>>> {
    let plans = state.registry.list()?;
    let listings = plans
        .into_iter()
        .map(|plan| {
            let (status, error) = match plan_runtime_status(&plan.project_root, &plan.plan_path) {
                Ok(summary) => (Some(PlanProgress::from(summary)), None),
                Err(err) => {
                    warn!(plan_id = %plan.plan_id, error = %format!("{err:#}"), "plan unreadable");
                    (None, Some(format!("{err:#}")))
                }
            };
            let running_session_id = state.running_for_plan(&plan.plan_path);
            PlanListing {
                plan,
                status,
                error,
                running_session_id,
            }
        })
        .collect();
    Ok(Json(listings))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDetail {
    #[serde(flatten)]
    pub plan: RegisteredPlan,
    pub status: PlanRuntimeSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_session_id: Option<String>,
}

/// GET /api/plans/:id - one plan with per-task runtime status.
pub async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
) -> ApiResult<Json<PlanDetail>> {
    let plan = state
        .registry
        .get(&plan_id)?
        .ok_or_else(|| ApiError::not_found(format!("no registered plan with id {plan_id}")))?;
    let status = plan_runtime_status(&plan.project_root, &plan.plan_path)
        .map_err(|err| ApiError::from_plan_load(&err))?;
    let running_session_id = state.running_for_plan(&plan.plan_path);
    Ok(Json(PlanDetail {
        plan,
        status,
        running_session_id,
    }))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub plan: PathBuf,
    /// Project root; defaults to the plan's directory for an absolute plan
    /// path and to the server's working directory otherwise.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub skip: Vec<String>,
    #[serde(flatten)]
    pub overrides: ConfigOverrides,
}

impl ExecuteRequest {
    fn run_options(&self) -> RunOptions {
        let project_root = match (&self.directory, self.plan.parent()) {
            (Some(directory), _) => directory.clone(),
            (None, Some(parent)) if self.plan.is_absolute() => parent.to_path_buf(),
            (None, _) => PathBuf::from("."),
        };
        RunOptions {
            plan_path: self.plan.clone(),
            project_root,
            resume: self.resume,
            skip: self.skip.clone(),
            overrides: self.overrides.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInfo {
    pub title: String,
    pub total_tasks: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub session_id: String,
    pub status: &'static str,
    pub plan: PlanInfo,
}

/// POST /api/execute - start a run in the background.
pub async fn execute(
    State(state): State<AppState>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<Json<ExecuteResponse>> {
    let Json(request) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    if request.plan.as_os_str().is_empty() {
        return Err(ApiError::bad_request("plan is required"));
    }
    start_run(&state, &request.run_options()).map(Json)
}

/// Body of `POST /plans/:id/restart`; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestartRequest {
    pub resume: bool,
    pub skip: Vec<String>,
    #[serde(flatten)]
    pub overrides: ConfigOverrides,
}

/// POST /api/plans/:id/restart - run a registered plan again.
pub async fn restart_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ExecuteResponse>> {
    let request: RestartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RestartRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))?
    };
    let plan = state
        .registry
        .get(&plan_id)?
        .ok_or_else(|| ApiError::not_found(format!("no registered plan with id {plan_id}")))?;
    let options = RunOptions {
        plan_path: plan.plan_path,
        project_root: plan.project_root,
        resume: request.resume,
        skip: request.skip,
        overrides: request.overrides,
    };
    start_run(&state, &options).map(Json)
}

fn start_run(state: &AppState, options: &RunOptions) -> ApiResult<ExecuteResponse> {
    let prepared = PreparedRun::load(options).map_err(|err| ApiError::from_plan_load(&err))?;
    let session_id = prepared.session_id().to_string();
    let plan_path = prepared.plan_path.clone();
    let project_root = prepared.project_root.clone();
    RalphPaths::new(&project_root).ensure_layout()?;

    let cancel = CancelToken::new();
    let (finished_tx, finished_rx) = watch::channel(false);
    let conflict = state.with_executions(|executions| {
        if let Some(running) = executions
            .values()
            .find(|e| e.status == ExecutionStatus::Running && e.plan_path == plan_path)
        {
            return Some(running.session_id.clone());
        }
        executions.insert(
            session_id.clone(),
            Execution {
                session_id: session_id.clone(),
                plan_path: plan_path.clone(),
                project_root: project_root.clone(),
                status: ExecutionStatus::Running,
                result: None,
                error: None,
                cancel: cancel.clone(),
                finished: finished_rx,
            },
        );
        None
    });
    if let Some(running) = conflict {
        return Err(ApiError::conflict(format!(
            "plan {} is already running as {running}",
            plan_path.display()
        )));
    }

    let title = match state.registry.register(&project_root, &plan_path) {
        Ok(entry) => entry.title,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "could not register plan");
            prepared.plan.project_name.clone()
        }
    };
    let total_tasks = prepared.plan.tasks.len();
    state.watch_project(&project_root);

    let engine = (state.engine_factory)(&prepared.config, state.bus.clone());
    let run_state = state.clone();
    let run_session = session_id.clone();
    info!(session_id = %session_id, plan = %plan_path.display(), "execution started");
    tokio::spawn(async move {
        let outcome = engine.run(prepared, cancel).await;
        run_state.with_executions(|executions| {
            let Some(execution) = executions.get_mut(&run_session) else {
                return;
            };
            match outcome {
                Ok(summary) => {
                    execution.status = if summary.succeeded() {
                        ExecutionStatus::Completed
                    } else {
                        ExecutionStatus::Failed
                    };
                    execution.result = Some(summary);
                }
                Err(err) => {
                    warn!(session_id = %run_session, error = %format!("{err:#}"), "execution aborted");
                    execution.status = ExecutionStatus::Failed;
                    execution.error = Some(format!("{err:#}"));
                }
            }
        });
        let _ = finished_tx.send(true);
        run_state.expire_finished(&run_session).await;
    });

    Ok(ExecuteResponse {
        session_id,
        status: "started",
        plan: PlanInfo { title, total_tasks },
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub session_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RunSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /api/status/:session_id - state of a run started by this server.
pub async fn get_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let execution = state
        .execution(&session_id)
        .ok_or_else(|| ApiError::not_found(format!("no execution {session_id}")))?;
    Ok(Json(StatusResponse {
        session_id: execution.session_id,
        status: execution.status,
        result: execution.result,
        error: execution.error,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub session_id: String,
    pub project_root: PathBuf,
    pub plan_path: PathBuf,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub last_activity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionStatus>,
}

/// GET /api/sessions - sessions of every known project, newest first.
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionRow>>> {
    let mut rows = Vec::new();
    for root in state.known_project_roots()? {
        let sessions = SessionStore::new(&RalphPaths::new(&root)).list()?;
        for session in sessions {
            let execution = state.execution(&session.session_id).map(|e| e.status);
            rows.push((
                session.last_activity,
                SessionRow {
                    session_id: session.session_id,
                    project_root: root.clone(),
                    plan_path: session.plan_path,
                    completed: session.completed_tasks.len(),
                    failed: session.failed_tasks.len(),
                    skipped: session.skipped_tasks.len(),
                    current_task_id: session.current_task_id,
                    last_activity: session.last_activity.to_rfc3339(),
                    execution,
                },
            ));
        }
    }
    rows.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(Json(rows.into_iter().map(|(_, row)| row).collect()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub session_id: String,
    pub cancelled: bool,
    pub deleted: bool,
}

/// DELETE /api/sessions/:id - cancel a running execution and remove its session file.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let execution = state.execution(&session_id);
    let mut cancelled = false;
    if let Some(execution) = &execution
        && execution.status == ExecutionStatus::Running
    {
        execution.cancel.cancel();
        cancelled = true;
        if tokio::time::timeout(CANCEL_WAIT, wait_finished(execution.finished.clone()))
            .await
            .is_err()
        {
            warn!(session_id = %session_id, "run did not stop in time, deleting anyway");
        }
    }

    let roots = match &execution {
        Some(execution) => vec![execution.project_root.clone()],
        None => state.known_project_roots()?,
    };
    let deleted = delete_session_file(&roots, &session_id)?;
    state.with_executions(|executions| executions.remove(&session_id));
    if !deleted && execution.is_none() {
        return Err(ApiError::not_found(format!("no session {session_id}")));
    }
    info!(session_id = %session_id, cancelled, deleted, "session removed");
    Ok(Json(DeleteResponse {
        session_id,
        cancelled,
        deleted,
    }))
}

fn delete_session_file(roots: &[PathBuf], session_id: &str) -> anyhow::Result<bool> {
    for root in roots {
        if SessionStore::new(&RalphPaths::new(root)).delete(session_id)? {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn wait_finished(mut finished: watch::Receiver<bool>) {
    loop {
        let done = *finished.borrow_and_update();
        if done || finished.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::http::StatusCode;
    use ralph::engine::Engine;
    use ralph::events::EventBus;
    use ralph::io::config::RalphConfig;
    use ralph::io::registry::Registry;
    use ralph::test_support::{ScriptedAgent, ScriptedVerifier, Step, TestProject, system_message};

    use crate::state::EngineFactory;

    const TWO_TASKS: &[(&str, &[&str])] = &[("task-001", &[]), ("task-002", &["task-001"])];

    struct Fixture {
        state: AppState,
        _home: tempfile::TempDir,
    }

    fn fixture(agent: Arc<ScriptedAgent>) -> Fixture {
        let home = tempfile::tempdir().expect("tempdir");
        let factory: EngineFactory = Arc::new(move |_config: &RalphConfig, bus: EventBus| {
            Engine::new(agent.clone(), ScriptedVerifier::new(vec![]), bus)
        });
        let state = AppState::new(
            Registry::at(home.path().join("registry.json")),
            EventBus::default(),
            factory,
        );
        Fixture { state, _home: home }
    }

    fn project() -> TestProject {
        let project = TestProject::new(TWO_TASKS);
        project.write_config(&RalphConfig {
            completion_grace_secs: 0,
            max_retries: 1,
            ..RalphConfig::default()
        });
        project
    }

    fn request_for(project: &TestProject) -> ExecuteRequest {
        ExecuteRequest {
            plan: project.plan_path(),
            ..ExecuteRequest::default()
        }
    }

    async fn wait_done(state: &AppState, session_id: &str) -> StatusResponse {
        let finished = state.execution(session_id).expect("execution").finished;
        tokio::time::timeout(Duration::from_secs(10), wait_finished(finished))
            .await
            .expect("run finished in time");
        let Json(status) = get_status(State(state.clone()), Path(session_id.to_string()))
            .await
            .expect("status");
        status
    }

    #[tokio::test]
    async fn execute_runs_plan_and_reports_completion() {
        let project = project();
        let fx = fixture(ScriptedAgent::new());

        let Json(started) = execute(State(fx.state.clone()), Ok(Json(request_for(&project))))
            .await
            .expect("execute");
        assert_eq!(started.status, "started");
        assert_eq!(started.plan.title, "Test Project");
        assert_eq!(started.plan.total_tasks, 2);

        let status = wait_done(&fx.state, &started.session_id).await;
        assert_eq!(status.status, ExecutionStatus::Completed);
        let result = status.result.expect("result");
        assert_eq!(result.completed_tasks, vec!["task-001", "task-002"]);

        let Json(plans) = list_plans(State(fx.state.clone())).await.expect("plans");
        assert_eq!(plans.len(), 1);
        let progress = plans[0].status.as_ref().expect("progress");
        assert_eq!(progress.progress, 100);
        assert_eq!(progress.session_id.as_deref(), Some(started.session_id.as_str()));

        let Json(detail) = get_plan(State(fx.state.clone()), Path(plans[0].plan.plan_id.clone()))
            .await
            .expect("plan detail");
        assert_eq!(detail.status.tasks.len(), 2);
        assert!(detail.running_session_id.is_none());
    }

    #[tokio::test]
    async fn failed_task_marks_execution_failed() {
        let project = project();
        let agent = ScriptedAgent::new();
        agent.script(
            "task-001",
            vec![vec![Step::Emit(ralph::test_support::error_result("boom"))]],
        );
        let fx = fixture(agent);

        let Json(started) = execute(State(fx.state.clone()), Ok(Json(request_for(&project))))
            .await
            .expect("execute");
        let status = wait_done(&fx.state, &started.session_id).await;

        assert_eq!(status.status, ExecutionStatus::Failed);
        let result = status.result.expect("result");
        assert_eq!(result.failed_tasks, vec!["task-001"]);
        assert_eq!(result.blocked_tasks, vec!["task-002"]);
    }

    #[tokio::test]
    async fn execute_rejects_missing_and_empty_plans() {
        let fx = fixture(ScriptedAgent::new());
        let temp = tempfile::tempdir().expect("tempdir");

        let missing = ExecuteRequest {
            plan: temp.path().join("missing.md"),
            ..ExecuteRequest::default()
        };
        let err = execute(State(fx.state.clone()), Ok(Json(missing)))
            .await
            .expect_err("missing plan");
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = execute(State(fx.state.clone()), Ok(Json(ExecuteRequest::default())))
            .await
            .expect_err("empty plan path");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn second_execute_of_a_running_plan_conflicts() {
        let project = project();
        let fx = fixture(ScriptedAgent::with_default(vec![
            Step::Emit(system_message("agent-1")),
            Step::Hang,
        ]));

        let Json(started) = execute(State(fx.state.clone()), Ok(Json(request_for(&project))))
            .await
            .expect("execute");
        let err = execute(State(fx.state.clone()), Ok(Json(request_for(&project))))
            .await
            .expect_err("conflict");
        assert_eq!(err.status, StatusCode::CONFLICT);

        let Json(deleted) = delete_session(State(fx.state.clone()), Path(started.session_id.clone()))
            .await
            .expect("delete");
        assert!(deleted.cancelled);
        assert!(deleted.deleted);
        assert!(fx.state.execution(&started.session_id).is_none());
        assert!(
            !project
                .paths()
                .session_file(&started.session_id)
                .exists()
        );
    }

    #[tokio::test]
    async fn finished_executions_expire_after_retention() {
        let project = project();
        let fx = fixture(ScriptedAgent::new());
        let state = fx
            .state
            .clone()
            .with_finished_retention(Duration::from_millis(50));

        let Json(started) = execute(State(state.clone()), Ok(Json(request_for(&project))))
            .await
            .expect("execute");
        let finished = state.execution(&started.session_id).expect("execution").finished;
        tokio::time::timeout(Duration::from_secs(10), wait_finished(finished))
            .await
            .expect("run finished in time");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(state.execution(&started.session_id).is_none());
        let err = get_status(State(state.clone()), Path(started.session_id.clone()))
            .await
            .expect_err("expired");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert!(project.paths().session_file(&started.session_id).exists());
    }

    #[tokio::test]
    async fn restart_runs_a_registered_plan_again() {
        let project = project();
        let fx = fixture(ScriptedAgent::new());
        let plan_id = fx
            .state
            .registry
            .register(project.root(), &project.plan_path())
            .expect("register")
            .plan_id;

        let Json(started) = restart_plan(
            State(fx.state.clone()),
            Path(plan_id),
            Bytes::from_static(br#"{"noCommit": true}"#),
        )
        .await
        .expect("restart");
        let status = wait_done(&fx.state, &started.session_id).await;
        assert_eq!(status.status, ExecutionStatus::Completed);
        assert_eq!(project.log_subjects(), vec!["configure ralph", "initial plan"]);

        let Json(sessions) = list_sessions(State(fx.state.clone())).await.expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, started.session_id);
        assert_eq!(sessions[0].completed, 2);
        assert_eq!(sessions[0].execution, Some(ExecutionStatus::Completed));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let fx = fixture(ScriptedAgent::new());
        let err = get_plan(State(fx.state.clone()), Path("deadbeef".into()))
            .await
            .expect_err("plan");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = get_status(State(fx.state.clone()), Path("session-x".into()))
            .await
            .expect_err("status");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = restart_plan(State(fx.state.clone()), Path("deadbeef".into()), Bytes::new())
            .await
            .expect_err("restart");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = delete_session(State(fx.state.clone()), Path("session-x".into()))
            .await
            .expect_err("delete");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn execute_request_reads_camel_case_overrides() {
        let request: ExecuteRequest = serde_json::from_str(
            r#"{"plan":"/work/app/plan.md","noCommit":true,"maxParallel":2}"#,
        )
        .expect("json");
        assert!(request.overrides.no_commit);
        assert_eq!(request.overrides.max_parallel, Some(2));
        let options = request.run_options();
        assert_eq!(options.project_root, PathBuf::from("/work/app"));
    }
}
