//! Engine configuration stored under `.ralph/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::paths::write_atomic;

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below;
/// CLI flags and `POST /execute` fields override them per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RalphConfig {
    /// Attempts per task before it is marked permanently failed.
    pub max_retries: u32,

    /// Upper bound on concurrently running tasks.
    pub max_parallel_tasks: usize,

    /// Per-attempt wall-clock limit in seconds.
    pub task_timeout_secs: u64,

    /// After `task_complete`, how long to let the agent finish its turn.
    pub completion_grace_secs: u64,

    pub auto_commit: bool,
    pub auto_test: bool,
    pub require_acceptance_criteria: bool,
    pub require_completion_signal: bool,
    pub update_plan_status: bool,
    pub retry_cleanup: RetryCleanup,

    pub verify: VerifyConfig,
    pub agent: AgentConfig,
}

/// What to do with a failed attempt's uncommitted edits before retrying.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryCleanup {
    /// Leave edits in place; the next attempt builds on them.
    #[default]
    Keep,
    /// `git stash push -u` so the next attempt starts from the last checkpoint.
    Stash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Verification command argv (e.g. `["cargo","test"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: vec!["cargo".to_string(), "test".to_string()],
            timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub extra_args: Vec<String>,
    /// Side-channel server argv; defaults to this executable's `mcp-server`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_command: Option<Vec<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: None,
            extra_args: vec!["--dangerously-skip-permissions".to_string()],
            mcp_command: None,
        }
    }
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_parallel_tasks: 1,
            task_timeout_secs: 30 * 60,
            completion_grace_secs: 30,
            auto_commit: true,
            auto_test: false,
            require_acceptance_criteria: false,
            require_completion_signal: false,
            update_plan_status: true,
            retry_cleanup: RetryCleanup::Keep,
            verify: VerifyConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be >= 1"));
        }
        if self.max_parallel_tasks == 0 {
            return Err(anyhow!("max_parallel_tasks must be >= 1"));
        }
        if self.task_timeout_secs == 0 {
            return Err(anyhow!("task_timeout_secs must be > 0"));
        }
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        if self.verify.output_limit_bytes == 0 {
            return Err(anyhow!("verify.output_limit_bytes must be > 0"));
        }
        if self.auto_test
            && (self.verify.command.is_empty() || self.verify.command[0].trim().is_empty())
        {
            return Err(anyhow!("verify.command must be a non-empty array when auto_test is on"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must not be empty"));
        }
        if let Some(mcp) = &self.agent.mcp_command
            && mcp.first().is_none_or(|program| program.trim().is_empty())
        {
            return Err(anyhow!("agent.mcp_command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        let cfg = RalphConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RalphConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RalphConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RalphConfig::default();
        cfg.retry_cleanup = RetryCleanup::Stash;
        cfg.agent.model = Some("sonnet".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_retries = 5\nretry_cleanup = \"stash\"\n\n[verify]\ncommand = [\"just\", \"ci\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.retry_cleanup, RetryCleanup::Stash);
        assert_eq!(cfg.verify.command, vec!["just", "ci"]);
        assert_eq!(cfg.verify.timeout_secs, 600);
        assert!(cfg.auto_commit);
    }

    #[test]
    fn rejects_zero_retries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_retries = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("max_retries"));
    }
}
