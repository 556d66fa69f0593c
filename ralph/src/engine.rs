//! Execution engine: drives the agent through a plan's tasks.
//!
//! Per task the engine walks `dispatched -> awaiting completion -> verifying ->
//! committing -> completed`, looping back to `dispatched` for a retry while
//! attempts remain. A task that exhausts its attempts is recorded as failed and
//! the run moves on; its dependents are reported as blocked.
//!
//! Ready tasks are dispatched up to `max_parallel_tasks` at a time. All session
//! mutations go through [`LiveSession`], and everything that touches the git
//! worktree (plan write-back, commit, retry stash) runs under one lock.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, error, info, instrument, warn};

use crate::core::message::AgentMessage;
use crate::core::reconcile::progress_percent;
use crate::core::resolver::{CycleError, blocked_tasks, ready_tasks, topological_sort};
use crate::core::session::{CompletionSource, Session, TaskResult};
use crate::core::types::{Plan, Task, TaskStatus};
use crate::error::TaskError;
use crate::events::{EventBus, RalphEvent};
use crate::exit_codes;
use crate::io::agent::{Agent, AgentRequest, AgentSession, ClaudeAgent};
use crate::io::config::{RalphConfig, RetryCleanup, load_config};
use crate::io::git::{Git, task_commit_message};
use crate::io::paths::{RalphPaths, resolve_path};
use crate::io::plan_store::{load_plan, load_valid_plan, write_task_status};
use crate::io::prompt::{DEFAULT_PROMPT_BUDGET, PromptInputs, render_task_prompt};
use crate::io::session_store::{LiveSession, SessionStore};
use crate::io::signal::{CompletionSignal, TaskBinding, clear_signal, read_signal};
use crate::io::verify::{CommandVerifier, Verifier, VerifyOutcome, VerifyRequest};

const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CHECKPOINT_SHA_LEN: usize = 7;

/// Per-run overrides of `.ralph/config.toml` (CLI flags, `POST /execute`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigOverrides {
    pub no_commit: bool,
    pub auto_test: Option<bool>,
    pub max_retries: Option<u32>,
    pub max_parallel: Option<usize>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut RalphConfig) {
        if self.no_commit {
            config.auto_commit = false;
        }
        if let Some(auto_test) = self.auto_test {
            config.auto_test = auto_test;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(max_parallel) = self.max_parallel {
            config.max_parallel_tasks = max_parallel;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Plan document; relative paths are taken from `project_root`.
    pub plan_path: PathBuf,
    pub project_root: PathBuf,
    /// Continue the latest session for this plan instead of starting a new one.
    pub resume: bool,
    /// Task ids to mark skipped before dispatch. Skipped tasks satisfy dependents.
    pub skip: Vec<String>,
    pub overrides: ConfigOverrides,
}

/// A validated plan, effective config, and the session it will run under.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub plan: Plan,
    pub plan_path: PathBuf,
    pub project_root: PathBuf,
    pub config: RalphConfig,
    pub session: Session,
    pub resumed: bool,
    pub skip: Vec<String>,
}

impl PreparedRun {
    /// Load config, plan, and session. No files are written.
    ///
    /// Fails with [`crate::error::PlanError`] when the plan cannot run.
    #[instrument(skip_all, fields(plan = %options.plan_path.display()))]
    pub fn load(options: &RunOptions) -> Result<Self> {
        let project_root = resolve_path(&options.project_root);
        let plan_path = resolve_path(&project_root.join(&options.plan_path));
        let paths = RalphPaths::new(&project_root);

        let mut config = load_config(&paths.config_path)?;
        options.overrides.apply(&mut config);
        config.validate().context("invalid run options")?;

        let plan = load_valid_plan(&plan_path)?;
        for id in &options.skip {
            if plan.task(id).is_none() {
                warn!(task_id = %id, "skip list names a task that is not in the plan");
            }
        }

        let store = SessionStore::new(&paths);
        let mut resumed = false;
        let session = if options.resume {
            match store.load(&plan_path)? {
                Some(session) => {
                    info!(session_id = %session.session_id, "resuming session");
                    resumed = true;
                    session
                }
                None => {
                    info!("no session to resume, starting a new one");
                    store.create(&plan_path)
                }
            }
        } else {
            store.create(&plan_path)
        };

        Ok(Self {
            plan,
            plan_path,
            project_root,
            config,
            session,
            resumed,
            skip: options.skip.clone(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Dependency order the run would follow (used by `--dry-run`).
    pub fn execution_order(&self) -> Result<Vec<&Task>, CycleError> {
        topological_sort(&self.plan.tasks)
    }
}

/// Final state of a run. Always produced, even when tasks failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub session_id: String,
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
    pub skipped_tasks: Vec<String>,
    /// Unfinished tasks whose dependencies failed.
    pub blocked_tasks: Vec<String>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.failed_tasks.is_empty() && !self.cancelled
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            exit_codes::OK
        } else {
            exit_codes::TASKS_FAILED
        }
    }
}

/// Cooperative cancellation shared by a run and whoever may stop it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let cancelled = *rx.borrow_and_update();
            // The sender lives in `self`, so `changed` cannot fail here.
            if cancelled || rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed,
    /// Stopped by cancellation; the session still shows it in progress.
    Cancelled,
}

enum AttemptOutcome {
    Completed(TaskResult),
    Failed(TaskError),
    Cancelled,
}

enum StreamEnd {
    Result(crate::core::message::ResultInfo),
    Eof,
    /// Completion signal seen and the grace period ran out.
    Signalled,
    TimedOut(Duration),
    Cancelled,
    Error(String),
}

struct StreamReport {
    end: StreamEnd,
    signal: Option<CompletionSignal>,
    agent_session_id: Option<String>,
}

struct RunContext {
    plan: Plan,
    plan_path: PathBuf,
    project_root: PathBuf,
    paths: RalphPaths,
    config: RalphConfig,
    session_id: String,
    live: LiveSession,
    agent: Arc<dyn Agent>,
    verifier: Arc<dyn Verifier>,
    bus: EventBus,
    worktree: Mutex<()>,
}

pub struct Engine {
    agent: Arc<dyn Agent>,
    verifier: Arc<dyn Verifier>,
    bus: EventBus,
}

impl Engine {
    pub fn new(agent: Arc<dyn Agent>, verifier: Arc<dyn Verifier>, bus: EventBus) -> Self {
        Self {
            agent,
            verifier,
            bus,
        }
    }

    /// The `claude` agent and the configured verification command.
    pub fn for_config(config: &RalphConfig, bus: EventBus) -> Self {
        Self::new(
            Arc::new(ClaudeAgent::new(config.agent.clone())),
            Arc::new(CommandVerifier::from_config(&config.verify)),
            bus,
        )
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Run until no task is runnable and none is in flight, or until cancelled.
    #[instrument(skip_all, fields(session_id = %prepared.session.session_id))]
    pub async fn run(&self, prepared: PreparedRun, cancel: CancelToken) -> Result<RunSummary> {
        let PreparedRun {
            plan,
            plan_path,
            project_root,
            config,
            session,
            skip,
            ..
        } = prepared;
        let paths = RalphPaths::new(&project_root);
        paths.ensure_layout()?;
        let session_id = session.session_id.clone();
        let live = LiveSession::new(SessionStore::new(&paths), session);

        live.update(|session| {
            let now = Utc::now();
            for id in &skip {
                if plan.task(id).is_some() && !session.is_settled(id) {
                    session.record_skip(id, now);
                }
            }
        })?;
        self.bus.publish(RalphEvent::SessionChanged {
            session_id: session_id.clone(),
            project_root: Some(project_root.clone()),
        });
        info!(
            tasks = plan.tasks.len(),
            max_parallel = config.max_parallel_tasks,
            "run started"
        );

        let ctx = Arc::new(RunContext {
            plan,
            plan_path,
            project_root,
            paths,
            config,
            session_id: session_id.clone(),
            live,
            agent: Arc::clone(&self.agent),
            verifier: Arc::clone(&self.verifier),
            bus: self.bus.clone(),
            worktree: Mutex::new(()),
        });

        let max_parallel = ctx.config.max_parallel_tasks;
        let mut running: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            if !cancel.is_cancelled() {
                let settled = ctx.live.read(|session| settled_ids(&ctx.plan, session));
                let exclude: HashSet<String> = running.union(&failed).cloned().collect();
                let ready: Vec<Task> = ready_tasks(&ctx.plan, &settled, &exclude)
                    .into_iter()
                    .take(max_parallel.saturating_sub(in_flight.len()))
                    .cloned()
                    .collect();
                for task in ready {
                    debug!(task_id = %task.id, "dispatching task");
                    running.insert(task.id.clone());
                    in_flight.push(drive_task(Arc::clone(&ctx), task, cancel.clone()));
                }
            }

            let Some((task_id, outcome)) = in_flight.next().await else {
                break;
            };
            running.remove(&task_id);
            if outcome == TaskOutcome::Failed {
                failed.insert(task_id);
            }
            publish_progress(&ctx);
        }

        let session = ctx.live.snapshot();
        let settled = settled_ids(&ctx.plan, &session);
        let failed_all: HashSet<String> = session.failed_tasks.iter().cloned().collect();
        let summary = RunSummary {
            session_id,
            completed_tasks: session.completed_tasks.iter().cloned().collect(),
            failed_tasks: session.failed_tasks.iter().cloned().collect(),
            skipped_tasks: session.skipped_tasks.iter().cloned().collect(),
            blocked_tasks: blocked_tasks(&ctx.plan, &settled, &failed_all),
            cancelled: cancel.is_cancelled(),
        };
        info!(
            completed = summary.completed_tasks.len(),
            failed = summary.failed_tasks.len(),
            blocked = summary.blocked_tasks.len(),
            cancelled = summary.cancelled,
            "run finished"
        );
        self.bus.publish(RalphEvent::RunFinished {
            session_id: summary.session_id.clone(),
            completed: summary.completed_tasks.clone(),
            failed: summary.failed_tasks.clone(),
            blocked: summary.blocked_tasks.clone(),
            cancelled: summary.cancelled,
        });
        Ok(summary)
    }
}

/// Ids that satisfy dependents: done in the document, completed, or skipped.
fn settled_ids(plan: &Plan, session: &Session) -> HashSet<String> {
    let mut settled = plan.done_in_document();
    settled.extend(session.completed_tasks.iter().cloned());
    settled.extend(session.skipped_tasks.iter().cloned());
    settled
}

fn publish_progress(ctx: &RunContext) {
    let (completed, failed) = ctx.live.read(|session| {
        let settled = settled_ids(&ctx.plan, session);
        let completed = ctx
            .plan
            .tasks
            .iter()
            .filter(|task| settled.contains(&task.id))
            .count();
        (completed, session.failed_tasks.len())
    });
    let total = ctx.plan.tasks.len();
    ctx.bus.publish(RalphEvent::RunProgress {
        session_id: ctx.session_id.clone(),
        completed,
        failed,
        total,
        progress: progress_percent(completed, total),
    });
}

async fn drive_task(ctx: Arc<RunContext>, task: Task, cancel: CancelToken) -> (String, TaskOutcome) {
    let outcome = match run_attempts(&ctx, &task, &cancel).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let message = format!("{err:#}");
            error!(task_id = %task.id, error = %message, "task aborted");
            let recorded = ctx.live.update(|session| {
                session.record_task_result(&task.id, Err(message.clone()), Utc::now());
                session.latest_execution(&task.id).map_or(0, |entry| entry.attempts)
            });
            let attempts = match recorded {
                Ok(attempts) => attempts,
                Err(err) => {
                    error!(task_id = %task.id, error = %format!("{err:#}"), "could not record task failure");
                    0
                }
            };
            ctx.bus.publish(RalphEvent::TaskFailed {
                session_id: ctx.session_id.clone(),
                task_id: task.id.clone(),
                attempts,
                error: message,
            });
            TaskOutcome::Failed
        }
    };
    (task.id, outcome)
}

#[instrument(skip_all, fields(session_id = %ctx.session_id, task_id = %task.id))]
async fn run_attempts(ctx: &RunContext, task: &Task, cancel: &CancelToken) -> Result<TaskOutcome> {
    let started = std::time::Instant::now();
    let max_attempts = ctx.config.max_retries;
    let mut previous_error: Option<String> = None;

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Ok(TaskOutcome::Cancelled);
        }
        ctx.live.update(|session| {
            session.record_task_start(&task.id, attempt, previous_error.clone(), Utc::now());
        })?;
        info!(attempt, title = %task.title, "task started");
        ctx.bus.publish(RalphEvent::TaskStarted {
            session_id: ctx.session_id.clone(),
            task_id: task.id.clone(),
            title: task.title.clone(),
            attempt,
        });

        let error = match run_attempt(ctx, task, attempt, previous_error.as_deref(), cancel).await {
            AttemptOutcome::Cancelled => {
                info!(attempt, "task cancelled, left in progress");
                return Ok(TaskOutcome::Cancelled);
            }
            AttemptOutcome::Completed(mut result) => {
                result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                let completion = result.completion;
                let commit = result.commit.clone();
                let duration_ms = result.duration_ms;
                ctx.live.update(|session| {
                    session.record_task_result(&task.id, Ok(result), Utc::now());
                })?;
                info!(?completion, commit = ?commit, duration_ms, "task completed");
                ctx.bus.publish(RalphEvent::TaskCompleted {
                    session_id: ctx.session_id.clone(),
                    task_id: task.id.clone(),
                    completion,
                    commit,
                    duration_ms,
                });
                return Ok(TaskOutcome::Completed);
            }
            AttemptOutcome::Failed(error) => error,
        };

        let message = error.to_string();
        if !error.is_retryable() || attempt == max_attempts {
            ctx.live.update(|session| {
                session.record_task_result(&task.id, Err(message.clone()), Utc::now());
            })?;
            warn!(attempts = attempt, error = %message, "task failed");
            ctx.bus.publish(RalphEvent::TaskFailed {
                session_id: ctx.session_id.clone(),
                task_id: task.id.clone(),
                attempts: attempt,
                error: message,
            });
            return Ok(TaskOutcome::Failed);
        }

        warn!(attempt, error = %message, "attempt failed, retrying");
        ctx.bus.publish(RalphEvent::TaskRetrying {
            session_id: ctx.session_id.clone(),
            task_id: task.id.clone(),
            attempt: attempt + 1,
            error: message.clone(),
        });
        clean_up_before_retry(ctx, task, attempt).await;
        previous_error = Some(message);
    }

    // `max_retries >= 1` is enforced by config validation.
    Ok(TaskOutcome::Failed)
}

async fn run_attempt(
    ctx: &RunContext,
    task: &Task,
    attempt: u32,
    previous_error: Option<&str>,
    cancel: &CancelToken,
) -> AttemptOutcome {
    match try_attempt(ctx, task, attempt, previous_error, cancel).await {
        Ok(outcome) => outcome,
        Err(err) => AttemptOutcome::Failed(TaskError::Stream(format!("{err:#}"))),
    }
}

async fn try_attempt(
    ctx: &RunContext,
    task: &Task,
    attempt: u32,
    previous_error: Option<&str>,
    cancel: &CancelToken,
) -> Result<AttemptOutcome> {
    let binding = TaskBinding {
        session_id: ctx.session_id.clone(),
        plan_path: ctx.plan_path.clone(),
        project_root: ctx.project_root.clone(),
        task_id: task.id.clone(),
    };
    clear_signal(&binding)?;

    let inputs = PromptInputs::for_task(
        &ctx.plan,
        task,
        &ctx.project_root,
        &ctx.plan_path,
        attempt,
        previous_error,
    );
    let prompt = render_task_prompt(&inputs, DEFAULT_PROMPT_BUDGET)?;
    // Parallel tasks cannot share one agent conversation.
    let resume = if ctx.config.max_parallel_tasks == 1 {
        ctx.live.read(|session| session.agent_session_id.clone())
    } else {
        None
    };

    let mut agent = ctx
        .agent
        .start(AgentRequest {
            prompt,
            workdir: ctx.project_root.clone(),
            binding: binding.clone(),
            resume,
            attempt,
        })
        .await?;
    let mut log = AttemptLog::create(ctx.paths.attempt_log(&ctx.session_id, &task.id, attempt));
    let report = watch_stream(ctx, &binding, agent.as_mut(), &mut log, cancel).await;

    if let Some(id) = &report.agent_session_id {
        ctx.live.update(|session| session.agent_session_id = Some(id.clone()))?;
    }

    let completion = if report.signal.is_some() {
        CompletionSource::Signal
    } else {
        CompletionSource::ResultMessage
    };
    let mut result_text = None;
    let failure = match report.end {
        StreamEnd::Cancelled => {
            stop_agent(agent.as_mut()).await;
            return Ok(AttemptOutcome::Cancelled);
        }
        _ if report.signal.is_some() => None,
        StreamEnd::Result(info) if info.is_error => Some(TaskError::AgentReported(
            info.result
                .or(info.subtype)
                .unwrap_or_else(|| "unspecified error".to_string()),
        )),
        StreamEnd::Result(_) if ctx.config.require_completion_signal => {
            Some(TaskError::MissingCompletionSignal)
        }
        StreamEnd::Result(info) => {
            result_text = info.result;
            None
        }
        StreamEnd::Eof => {
            let status = agent.wait().await.unwrap_or_else(|err| format!("{err:#}"));
            Some(TaskError::AgentExited(status))
        }
        StreamEnd::TimedOut(limit) => Some(TaskError::Timeout(limit)),
        StreamEnd::Error(message) => Some(TaskError::Stream(message)),
        StreamEnd::Signalled => None,
    };
    stop_agent(agent.as_mut()).await;
    if let Some(error) = failure {
        return Ok(AttemptOutcome::Failed(error));
    }

    if cancel.is_cancelled() {
        return Ok(AttemptOutcome::Cancelled);
    }
    if ctx.config.auto_test {
        tokio::select! {
            () = cancel.cancelled() => return Ok(AttemptOutcome::Cancelled),
            failure = verify(ctx, task, attempt) => if let Some(error) = failure {
                return Ok(AttemptOutcome::Failed(error));
            },
        }
    }

    if ctx.config.require_acceptance_criteria {
        let plan = load_plan(&ctx.plan_path)?;
        let unmet = plan
            .task(&task.id)
            .map(Task::unmet_criteria)
            .unwrap_or_default();
        if !unmet.is_empty() {
            return Ok(AttemptOutcome::Failed(TaskError::CriteriaUnmet(unmet)));
        }
    }

    let commit = match checkpoint(ctx, task, cancel).await {
        Ok(Checkpoint::Written { commit }) => commit,
        Ok(Checkpoint::Cancelled) => return Ok(AttemptOutcome::Cancelled),
        Err(err) => return Ok(AttemptOutcome::Failed(TaskError::Checkpoint(format!("{err:#}")))),
    };
    if let Some(commit) = &commit {
        ctx.bus.publish(RalphEvent::CheckpointCreated {
            session_id: ctx.session_id.clone(),
            task_id: task.id.clone(),
            commit: commit.clone(),
        });
    }

    Ok(AttemptOutcome::Completed(TaskResult {
        completion,
        summary: report.signal.and_then(|signal| signal.summary).or(result_text),
        commit,
        agent_session_id: report.agent_session_id,
        duration_ms: 0,
    }))
}

/// Pump agent messages until the attempt is decided.
async fn watch_stream(
    ctx: &RunContext,
    binding: &TaskBinding,
    agent: &mut dyn AgentSession,
    log: &mut AttemptLog,
    cancel: &CancelToken,
) -> StreamReport {
    let timeout = Duration::from_secs(ctx.config.task_timeout_secs);
    let deadline = Instant::now() + timeout;
    let grace = Duration::from_secs(ctx.config.completion_grace_secs);
    let mut poll = interval(SIGNAL_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut signal: Option<CompletionSignal> = None;
    let mut grace_deadline: Option<Instant> = None;
    let mut agent_session_id: Option<String> = None;

    let end = loop {
        tokio::select! {
            () = cancel.cancelled() => break StreamEnd::Cancelled,
            () = sleep_until(deadline) => {
                if signal.is_none() {
                    signal = read_signal(binding);
                }
                if signal.is_some() {
                    break StreamEnd::Signalled;
                }
                break StreamEnd::TimedOut(timeout);
            }
            () = wait_until(grace_deadline) => break StreamEnd::Signalled,
            _ = poll.tick(), if signal.is_none() => {
                if let Some(found) = read_signal(binding) {
                    debug!("completion signal received");
                    signal = Some(found);
                    grace_deadline = Some(Instant::now() + grace);
                }
            }
            next = agent.next_message() => match next {
                Ok(Some(message)) => {
                    log.record(&message);
                    if let Some(id) = message.session_id()
                        && matches!(message, AgentMessage::System(_))
                    {
                        agent_session_id = Some(id.to_string());
                    }
                    if let AgentMessage::Result(info) = message {
                        break StreamEnd::Result(info);
                    }
                }
                Ok(None) => break StreamEnd::Eof,
                Err(err) => break StreamEnd::Error(format!("{err:#}")),
            },
        }
    };

    if signal.is_none() {
        signal = read_signal(binding);
    }
    StreamReport {
        end,
        signal,
        agent_session_id,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn stop_agent(agent: &mut dyn AgentSession) {
    if let Err(err) = agent.terminate().await {
        warn!(error = %format!("{err:#}"), "could not stop agent");
    }
}

/// Run the verifier off the async runtime. `None` means it passed.
async fn verify(ctx: &RunContext, task: &Task, attempt: u32) -> Option<TaskError> {
    let request = VerifyRequest {
        workdir: ctx.project_root.clone(),
        log_path: ctx.paths.verify_log(&ctx.session_id, &task.id, attempt),
        timeout: Duration::from_secs(ctx.config.verify.timeout_secs),
        output_limit_bytes: ctx.config.verify.output_limit_bytes,
    };
    let verifier = Arc::clone(&ctx.verifier);
    match tokio::task::spawn_blocking(move || verifier.run(&request)).await {
        Ok(Ok(VerifyOutcome::Pass)) => {
            debug!("verification passed");
            None
        }
        Ok(Ok(VerifyOutcome::Fail { summary })) => Some(TaskError::VerificationFailed(summary)),
        Ok(Err(err)) => Some(TaskError::VerificationFailed(format!("{err:#}"))),
        Err(err) => Some(TaskError::VerificationFailed(format!("verifier panicked: {err}"))),
    }
}

enum Checkpoint {
    /// `commit` is the short hash, or `None` when nothing was committed.
    Written { commit: Option<String> },
    /// Cancelled while waiting for the worktree; nothing was written.
    Cancelled,
}

/// Write `Implemented` back into the plan and commit the worktree.
async fn checkpoint(ctx: &RunContext, task: &Task, cancel: &CancelToken) -> Result<Checkpoint> {
    let _worktree = ctx.worktree.lock().await;
    if cancel.is_cancelled() {
        return Ok(Checkpoint::Cancelled);
    }
    let plan_path = ctx.plan_path.clone();
    let root = ctx.project_root.clone();
    let update_plan = ctx.config.update_plan_status;
    let auto_commit = ctx.config.auto_commit;
    let task_id = task.id.clone();
    let title = task.title.clone();

    tokio::task::spawn_blocking(move || -> Result<Option<String>> {
        if update_plan {
            write_task_status(&plan_path, &task_id, TaskStatus::Implemented)?;
        }
        if !auto_commit {
            return Ok(None);
        }
        let git = Git::new(root);
        if !git.is_repo() {
            warn!("project is not a git repository, skipping commit");
            return Ok(None);
        }
        git.add_all()?;
        if !git.commit_staged(&task_commit_message(&task_id, &title))? {
            return Ok(None);
        }
        Ok(Some(git.head_short_sha(CHECKPOINT_SHA_LEN)?))
    })
    .await
    .context("checkpoint worker panicked")?
    .map(|commit| Checkpoint::Written { commit })
}

async fn clean_up_before_retry(ctx: &RunContext, task: &Task, attempt: u32) {
    if ctx.config.retry_cleanup != RetryCleanup::Stash {
        return;
    }
    if ctx.config.max_parallel_tasks > 1 {
        warn!("retry_cleanup = \"stash\" is not applied while tasks run in parallel");
        return;
    }
    let _worktree = ctx.worktree.lock().await;
    let git = Git::new(&ctx.project_root);
    let message = format!("ralph: {} attempt {attempt}", task.id);
    match tokio::task::spawn_blocking(move || git.stash_push(&message)).await {
        Ok(Ok(true)) => info!(attempt, "stashed partial edits before retry"),
        Ok(Ok(false)) => debug!("worktree clean, nothing to stash"),
        Ok(Err(err)) => warn!(error = %format!("{err:#}"), "could not stash partial edits"),
        Err(err) => warn!(%err, "stash worker panicked"),
    }
}

/// Raw agent messages for one attempt, one JSON object per line.
struct AttemptLog {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl AttemptLog {
    fn create(path: PathBuf) -> Self {
        let opened = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| File::create(&path));
        let file = match opened {
            Ok(file) => Some(BufWriter::new(file)),
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot open attempt log");
                None
            }
        };
        Self { path, file }
    }

    fn record(&mut self, message: &AgentMessage) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let written = serde_json::to_writer(&mut *file, message)
            .map_err(std::io::Error::from)
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush());
        if let Err(err) = written {
            warn!(path = %self.path.display(), %err, "attempt log write failed");
            self.file = None;
        }
    }
}
