//! Bounded verification command runs.
//!
//! A verification command (`cargo test`, `npm run build`, ...) can print without
//! limit or hang forever. Both pipes are drained on helper threads so the child
//! never blocks on a full pipe, only the first `output_limit_bytes` of each are
//! kept, and the child is killed at the deadline.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Lines of failing output kept for the retry prompt.
pub const EXCERPT_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandExit {
    Success,
    Code(i32),
    /// Ended by a signal it did not get from us.
    Signalled,
    /// Killed at the deadline.
    TimedOut,
}

impl CommandExit {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => Self::Success,
            Some(code) => Self::Code(code),
            None => Self::Signalled,
        }
    }
}

/// Outcome of one verification run.
#[derive(Debug)]
pub struct CommandRun {
    pub exit: CommandExit,
    /// Both streams as written to the `.verify.log`.
    pub log: String,
    /// Last non-empty lines of stderr, or of stdout when stderr is blank.
    pub excerpt: String,
}

/// One drained pipe: the kept prefix and how many bytes were dropped.
struct Captured {
    kept: Vec<u8>,
    dropped: usize,
}

impl Captured {
    fn render(&self, stream: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.kept).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[{stream} truncated {} bytes]\n", self.dropped));
        }
        text
    }

    fn is_blank(&self) -> bool {
        self.kept.iter().all(u8::is_ascii_whitespace)
    }
}

/// Run `cmd` to completion or until `timeout`, keeping at most
/// `output_limit_bytes` of each stream.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_bounded(mut cmd: Command, timeout: Duration, output_limit_bytes: usize) -> Result<CommandRun> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawn command")?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = thread::spawn(move || drain_limited(stdout, output_limit_bytes));
    let stderr_reader = thread::spawn(move || drain_limited(stderr, output_limit_bytes));

    let exit = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => CommandExit::from_status(status),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?;
            CommandExit::TimedOut
        }
    };

    let stdout = join_reader(stdout_reader).context("read stdout")?;
    let stderr = join_reader(stderr_reader).context("read stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        debug!(stdout_dropped = stdout.dropped, stderr_dropped = stderr.dropped, "output truncated");
    }

    let excerpt_source = if stderr.is_blank() { &stdout } else { &stderr };
    Ok(CommandRun {
        exit,
        log: format!(
            "== stdout ==\n{}\n== stderr ==\n{}",
            stdout.render("stdout"),
            stderr.render("stderr")
        ),
        excerpt: last_lines(&String::from_utf8_lossy(&excerpt_source.kept), EXCERPT_LINES),
    })
}

fn join_reader(handle: thread::JoinHandle<Result<Captured>>) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let mut captured = Captured {
        kept: Vec::new(),
        dropped: 0,
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(captured);
        }
        let keep = n.min(limit.saturating_sub(captured.kept.len()));
        captured.kept.extend_from_slice(&chunk[..keep]);
        captured.dropped += n - keep;
    }
}

fn last_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(max_lines)..].join("\n")
}
