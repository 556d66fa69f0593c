//! Post-task verification (the configured test/build command).

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use super::config::VerifyConfig;
use super::paths::write_atomic;
use super::process::{CommandExit, run_bounded};

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Pass,
    /// `summary` is a short excerpt of the failing output.
    Fail { summary: String },
}

/// Runs blocking; the engine calls it from `spawn_blocking`.
pub trait Verifier: Send + Sync {
    fn run(&self, request: &VerifyRequest) -> Result<VerifyOutcome>;
}

/// Runs `verify.command` in the project root.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    command: Vec<String>,
}

impl CommandVerifier {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn from_config(config: &VerifyConfig) -> Self {
        Self::new(config.command.clone())
    }
}

impl Verifier for CommandVerifier {
    #[instrument(skip_all, fields(command = %self.command.join(" ")))]
    fn run(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("verify.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        let run = run_bounded(cmd, request.timeout, request.output_limit_bytes)
            .with_context(|| format!("run verification `{}`", self.command.join(" ")))?;
        write_atomic(&request.log_path, run.log.as_bytes())?;

        debug!(exit = ?run.exit, "verification finished");
        let summary = match run.exit {
            CommandExit::Success => return Ok(VerifyOutcome::Pass),
            CommandExit::TimedOut => {
                return Ok(VerifyOutcome::Fail {
                    summary: format!("timed out after {}s", request.timeout.as_secs()),
                });
            }
            CommandExit::Code(code) => format!("exit {code}: {}", run.excerpt),
            CommandExit::Signalled => format!("exit signal: {}", run.excerpt),
        };
        Ok(VerifyOutcome::Fail { summary })
    }
}
