//! Adapter for the external coding agent.
//!
//! The engine talks to agents through [`Agent`]/[`AgentSession`]; tests swap in
//! a scripted implementation. [`ClaudeAgent`] runs the `claude` CLI in
//! `stream-json` mode with the completion side-channel registered as an MCP
//! server.

use std::collections::VecDeque;
use std::env;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::config::AgentConfig;
use super::signal::TaskBinding;
use crate::core::message::{AgentMessage, parse_line};

/// Name the side-channel server is registered under in the agent's MCP config.
pub const MCP_SERVER_NAME: &str = "ralph";

const STDERR_TAIL_LINES: usize = 20;

/// Everything needed to launch one agent attempt.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub binding: TaskBinding,
    /// Agent conversation to continue, if any.
    pub resume: Option<String>,
    pub attempt: u32,
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn start(&self, request: AgentRequest) -> Result<Box<dyn AgentSession>>;
}

/// One running agent invocation.
#[async_trait]
pub trait AgentSession: Send {
    /// Next parsed message, or `None` once the stream has ended.
    ///
    /// Must be cancel-safe: the engine polls it inside `select!`.
    async fn next_message(&mut self) -> Result<Option<AgentMessage>>;

    /// Stop the agent now. Idempotent.
    async fn terminate(&mut self) -> Result<()>;

    /// Wait for exit after the stream ended; returns a short description of
    /// how the process exited (used in failure messages).
    async fn wait(&mut self) -> Result<String>;
}

/// The `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeAgent {
    config: AgentConfig,
    mcp_command: Vec<String>,
}

impl ClaudeAgent {
    pub fn new(config: AgentConfig) -> Self {
        let mcp_command = config
            .mcp_command
            .clone()
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or_else(default_mcp_command);
        Self {
            config,
            mcp_command,
        }
    }

    /// `--mcp-config` payload registering the side-channel with the binding env.
    pub fn mcp_config(&self, binding: &TaskBinding) -> serde_json::Value {
        let (command, args) = match self.mcp_command.split_first() {
            Some((command, args)) => (command.clone(), args.to_vec()),
            None => ("ralph".to_string(), vec!["mcp-server".to_string()]),
        };
        let env: serde_json::Map<String, serde_json::Value> = binding
            .env_vars()
            .into_iter()
            .map(|(key, value)| (key.to_string(), json!(value)))
            .collect();
        json!({
            "mcpServers": {
                MCP_SERVER_NAME: {
                    "type": "stdio",
                    "command": command,
                    "args": args,
                    "env": env,
                }
            }
        })
    }

    pub fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--mcp-config".to_string(),
            self.mcp_config(&request.binding).to_string(),
        ];
        if let Some(resume) = &request.resume {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

/// The `ralph` binary next to the current executable, else `ralph` on `PATH`.
fn default_mcp_command() -> Vec<String> {
    let sibling = env::current_exe().ok().and_then(|exe| {
        let candidate = exe.with_file_name(format!("ralph{}", env::consts::EXE_SUFFIX));
        candidate.is_file().then_some(candidate)
    });
    let program = sibling.map_or_else(|| "ralph".to_string(), |p| p.display().to_string());
    vec![program, "mcp-server".to_string()]
}

#[async_trait]
impl Agent for ClaudeAgent {
    #[instrument(skip_all, fields(task_id = %request.binding.task_id, attempt = request.attempt, resume = request.resume.is_some()))]
    async fn start(&self, request: AgentRequest) -> Result<Box<dyn AgentSession>> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.build_args(&request))
            .current_dir(&request.workdir)
            .envs(request.binding.env_vars());
        debug!(command = %self.config.command, "spawning agent");
        let session = spawn_streaming(cmd, request.prompt)
            .with_context(|| format!("spawn agent `{}`", self.config.command))?;
        Ok(Box::new(session))
    }
}

/// Spawn `cmd` with `prompt` on stdin and its stdout parsed as agent messages.
fn spawn_streaming(mut cmd: Command, prompt: String) -> Result<ClaudeSession> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    tokio::spawn(async move {
        if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
            warn!(%err, "failed to write prompt to agent");
        }
        let _ = stdin.shutdown().await;
    });

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stderr_tail = tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    });

    Ok(ClaudeSession {
        child,
        lines: BufReader::new(stdout).lines(),
        stderr_tail: Some(stderr_tail),
    })
}

struct ClaudeSession {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr_tail: Option<JoinHandle<String>>,
}

#[async_trait]
impl AgentSession for ClaudeSession {
    async fn next_message(&mut self) -> Result<Option<AgentMessage>> {
        loop {
            match self.lines.next_line().await.context("read agent output")? {
                Some(line) => {
                    if let Some(message) = parse_line(&line) {
                        return Ok(Some(message));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.child.try_wait().context("poll agent")?.is_some() {
            return Ok(());
        }
        debug!("terminating agent");
        self.child.start_kill().context("kill agent")?;
        self.child.wait().await.context("wait for killed agent")?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<String> {
        let status = self.child.wait().await.context("wait for agent")?;
        let stderr = match self.stderr_tail.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let code = status
            .code()
            .map_or_else(|| "killed by signal".to_string(), |c| c.to_string());
        if stderr.trim().is_empty() {
            Ok(code)
        } else {
            Ok(format!("{code}; stderr: {}", stderr.trim()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(resume: Option<&str>) -> AgentRequest {
        AgentRequest {
            prompt: "do it".into(),
            workdir: PathBuf::from("/proj"),
            binding: TaskBinding {
                session_id: "session-1".into(),
                plan_path: PathBuf::from("/proj/plan.md"),
                project_root: PathBuf::from("/proj"),
                task_id: "task-001".into(),
            },
            resume: resume.map(str::to_string),
            attempt: 1,
        }
    }

    fn agent() -> ClaudeAgent {
        ClaudeAgent::new(AgentConfig {
            model: Some("sonnet".into()),
            mcp_command: Some(vec!["/bin/ralph".into(), "mcp-server".into()]),
            ..AgentConfig::default()
        })
    }

    #[test]
    fn args_request_stream_json_and_resume() {
        let args = agent().build_args(&request(Some("abc")));
        assert_eq!(&args[..4], ["-p", "--output-format", "stream-json", "--verbose"]);
        let resume = args.iter().position(|a| a == "--resume").expect("resume flag");
        assert_eq!(args[resume + 1], "abc");
        assert!(args.windows(2).any(|w| w[0] == "--model" && w[1] == "sonnet"));
        assert_eq!(args.last().map(String::as_str), Some("--dangerously-skip-permissions"));
        assert!(!agent().build_args(&request(None)).contains(&"--resume".to_string()));
    }

    #[test]
    fn mcp_config_carries_binding_env() {
        let config = agent().mcp_config(&request(None).binding);
        let server = &config["mcpServers"][MCP_SERVER_NAME];
        assert_eq!(server["command"], "/bin/ralph");
        assert_eq!(server["args"][0], "mcp-server");
        assert_eq!(server["env"]["CURRENT_TASK_ID"], "task-001");
        assert_eq!(server["env"]["SESSION_ID"], "session-1");
    }

    #[tokio::test]
    async fn streams_messages_from_child_process() {
        let script = concat!(
            "read -r prompt; ",
            "echo '{\"type\":\"system\",\"session_id\":\"s-9\"}'; ",
            "echo 'not json'; ",
            "echo \"{\\\"type\\\":\\\"result\\\",\\\"result\\\":\\\"$prompt $CURRENT_TASK_ID\\\"}\"; ",
            "echo 'boom' >&2; exit 3",
        );
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).envs(request(None).binding.env_vars());
        let mut session = spawn_streaming(cmd, "hello\n".to_string()).expect("spawn");

        let first = session.next_message().await.expect("read").expect("message");
        assert_eq!(first.session_id(), Some("s-9"));
        match session.next_message().await.expect("read").expect("message") {
            AgentMessage::Result(info) => {
                assert_eq!(info.result.as_deref(), Some("hello task-001"));
            }
            other => panic!("expected result, got {other:?}"),
        }
        assert!(session.next_message().await.expect("read").is_none());
        assert_eq!(session.wait().await.expect("wait"), "3; stderr: boom");
    }

    #[tokio::test]
    async fn terminate_stops_a_running_agent() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec sleep 30");
        let mut session = spawn_streaming(cmd, String::new()).expect("spawn");
        session.terminate().await.expect("terminate");
        session.terminate().await.expect("idempotent");
        assert!(session.next_message().await.expect("read").is_none());
    }
}
