//! Test-only builders and fakes: plans, temp git projects, a scripted agent, and
//! a scripted verifier.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::core::message::{AgentMessage, ResultInfo, SystemInfo};
use crate::core::types::{AcceptanceCriterion, Plan, Priority, Task, TaskStatus};
use crate::events::RalphEvent;
use crate::io::agent::{Agent, AgentRequest, AgentSession};
use crate::io::config::{RalphConfig, write_config};
use crate::io::paths::RalphPaths;
use crate::io::signal::write_signal;
use crate::io::verify::{Verifier, VerifyOutcome, VerifyRequest};

/// A `ToDo` task titled `"<id> title"` with one unchecked criterion `"<id> works"`.
pub fn task(id: &str, deps: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        priority: Priority::Medium,
        dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
        acceptance_criteria: vec![AcceptanceCriterion {
            text: format!("{id} works"),
            completed: false,
        }],
        spec_reference: None,
        complexity: 2,
        tags: Vec::new(),
        status: TaskStatus::ToDo,
    }
}

pub fn plan_of(tasks: Vec<Task>) -> Plan {
    Plan {
        project_name: "Test Project".to_string(),
        description: String::new(),
        total_tasks: tasks.len(),
        tasks,
        generated_at: None,
    }
}

/// Plan document text for `(id, deps)` pairs, in the same shape as [`task`].
pub fn plan_doc(tasks: &[(&str, &[&str])]) -> String {
    let mut doc = String::from("# Project: Test Project\n\n## Description\nA plan used in tests.\n\n## Tasks\n");
    for (index, (id, deps)) in tasks.iter().enumerate() {
        let deps = if deps.is_empty() {
            "None".to_string()
        } else {
            deps.join(", ")
        };
        doc.push_str(&format!(
            "\n### Task {n}: {id} title\n\
             - **ID**: {id}\n\
             - **Priority**: medium\n\
             - **Status**: ToDo\n\
             - **Dependencies**: {deps}\n\
             - **Complexity**: 2\n\
             - **Description**: {id} description\n\
             - **Acceptance Criteria**:\n  - [ ] {id} works\n",
            n = index + 1,
        ));
    }
    doc
}

/// A temporary git repository holding `plan.md` and an initialized `.ralph/`.
pub struct TestProject {
    _temp: tempfile::TempDir,
    root: PathBuf,
}

impl TestProject {
    pub fn new(tasks: &[(&str, &[&str])]) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let project = Self { _temp: temp, root };
        project.git(&["init", "-q"]);
        project.git(&["config", "user.email", "ralph@example.com"]);
        project.git(&["config", "user.name", "Ralph Tests"]);
        project.git(&["config", "commit.gpgsign", "false"]);
        fs::write(project.plan_path(), plan_doc(tasks)).expect("write plan");
        RalphPaths::new(&project.root)
            .ensure_layout()
            .expect("ralph layout");
        project.git(&["add", "-A"]);
        project.git(&["commit", "-q", "-m", "initial plan"]);
        project
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root.join("plan.md")
    }

    pub fn paths(&self) -> RalphPaths {
        RalphPaths::new(&self.root)
    }

    /// Write and commit `.ralph/config.toml`.
    pub fn write_config(&self, config: &RalphConfig) {
        write_config(&self.paths().config_path, config).expect("write config");
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", "configure ralph"]);
    }

    /// Write `name` and commit it with `message`.
    pub fn commit_file(&self, name: &str, message: &str) {
        fs::write(self.root.join(name), message).expect("write file");
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
    }

    /// Commit subjects, newest first.
    pub fn log_subjects(&self) -> Vec<String> {
        self.git(&["log", "--format=%s"])
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn read_plan(&self) -> String {
        fs::read_to_string(self.plan_path()).expect("read plan")
    }

    pub fn git(&self, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .expect("spawn git");
        assert!(
            out.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).into_owned()
    }
}

pub fn system_message(session_id: &str) -> AgentMessage {
    AgentMessage::System(SystemInfo {
        subtype: Some("init".to_string()),
        session_id: Some(session_id.to_string()),
        ..SystemInfo::default()
    })
}

pub fn result_message(text: &str) -> AgentMessage {
    AgentMessage::Result(ResultInfo {
        subtype: Some("success".to_string()),
        result: Some(text.to_string()),
        ..ResultInfo::default()
    })
}

pub fn error_result(text: &str) -> AgentMessage {
    AgentMessage::Result(ResultInfo {
        subtype: Some("error_during_execution".to_string()),
        is_error: true,
        result: Some(text.to_string()),
        ..ResultInfo::default()
    })
}

/// One scripted agent action.
#[derive(Debug, Clone)]
pub enum Step {
    Emit(AgentMessage),
    /// Write the completion signal the way the side-channel server does.
    Signal(Option<String>),
    /// Write a file relative to the working directory.
    WriteFile(String, String),
    /// Check every acceptance box of the bound task in the plan document.
    CheckCriteria,
    Sleep(Duration),
    /// Never produce another message.
    Hang,
}

/// Agent that succeeds by calling the side-channel, then sending a result.
pub fn signal_then_result(summary: &str) -> Vec<Step> {
    vec![
        Step::Emit(system_message("agent-1")),
        Step::Signal(Some(summary.to_string())),
        Step::Emit(result_message(summary)),
    ]
}

/// Replays queued scripts per task; tasks without a queued script use the
/// default script (signal then result).
pub struct ScriptedAgent {
    scripts: Mutex<HashMap<String, VecDeque<Vec<Step>>>>,
    default_script: Vec<Step>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_script: signal_then_result("done"),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_default(default_script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            default_script,
            ..Self::default()
        })
    }

    /// Queue one script per attempt for `task_id`.
    pub fn script(&self, task_id: &str, attempts: Vec<Vec<Step>>) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(task_id.to_string())
            .or_default()
            .extend(attempts);
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn requests_for(&self, task_id: &str) -> Vec<AgentRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.binding.task_id == task_id)
            .collect()
    }

    /// Panic if any queued script was never started.
    pub fn assert_drained(&self) {
        let scripts = self.scripts.lock().expect("scripts lock");
        let left: Vec<_> = scripts
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(id, queue)| format!("{id} ({} left)", queue.len()))
            .collect();
        assert!(left.is_empty(), "unused agent scripts: {}", left.join(", "));
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn start(&self, request: AgentRequest) -> Result<Box<dyn AgentSession>> {
        let steps = self
            .scripts
            .lock()
            .expect("scripts lock")
            .get_mut(&request.binding.task_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_script.clone());
        let session = ScriptedSession {
            steps: steps.into(),
            request: request.clone(),
            sleep_until: None,
            terminated: false,
        };
        self.requests.lock().expect("requests lock").push(request);
        Ok(Box::new(session))
    }
}

struct ScriptedSession {
    steps: VecDeque<Step>,
    request: AgentRequest,
    sleep_until: Option<Instant>,
    terminated: bool,
}

#[async_trait]
impl AgentSession for ScriptedSession {
    // Steps are popped only after their await completes, so dropping this
    // future mid-sleep resumes the same sleep on the next call.
    async fn next_message(&mut self) -> Result<Option<AgentMessage>> {
        loop {
            if self.terminated {
                return Ok(None);
            }
            let Some(step) = self.steps.front().cloned() else {
                return Ok(None);
            };
            match step {
                Step::Emit(message) => {
                    self.steps.pop_front();
                    return Ok(Some(message));
                }
                Step::Signal(summary) => {
                    write_signal(&self.request.binding, summary)?;
                }
                Step::WriteFile(name, contents) => {
                    fs::write(self.request.workdir.join(name), contents)?;
                }
                Step::CheckCriteria => {
                    let binding = &self.request.binding;
                    let doc = fs::read_to_string(&binding.plan_path)?;
                    let updated = doc.replace(
                        &format!("- [ ] {} works", binding.task_id),
                        &format!("- [x] {} works", binding.task_id),
                    );
                    fs::write(&binding.plan_path, updated)?;
                }
                Step::Sleep(duration) => {
                    let until = *self
                        .sleep_until
                        .get_or_insert_with(|| Instant::now() + duration);
                    tokio::time::sleep_until(until).await;
                    self.sleep_until = None;
                }
                Step::Hang => std::future::pending::<()>().await,
            }
            self.steps.pop_front();
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        self.terminated = true;
        Ok(())
    }

    async fn wait(&mut self) -> Result<String> {
        Ok("0".to_string())
    }
}

/// Returns queued outcomes in order, then passes.
#[derive(Default)]
pub struct ScriptedVerifier {
    outcomes: Mutex<VecDeque<VerifyOutcome>>,
    calls: Mutex<usize>,
    delay: Duration,
}

impl ScriptedVerifier {
    pub fn new(outcomes: Vec<VerifyOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: Mutex::new(0),
            delay: Duration::ZERO,
        })
    }

    /// Blocks for `delay` on every run before answering.
    pub fn slow(outcomes: Vec<VerifyOutcome>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: Mutex::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("calls lock")
    }
}

impl Verifier for ScriptedVerifier {
    fn run(&self, _request: &VerifyRequest) -> Result<VerifyOutcome> {
        *self.calls.lock().expect("calls lock") += 1;
        std::thread::sleep(self.delay);
        Ok(self
            .outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or(VerifyOutcome::Pass))
    }
}

/// Everything currently buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<RalphEvent>) -> Vec<RalphEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
