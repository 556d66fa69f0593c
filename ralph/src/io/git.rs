//! Git adapter for task checkpoints.
//!
//! Ralph only needs a handful of git operations (stage, commit, read HEAD,
//! stash a failed attempt, scan history for task ids), so we keep a small,
//! explicit wrapper around `git` subprocess calls.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument, warn};

/// Subject of a checkpoint commit: `feat(task-NNN): title`.
static CHECKPOINT_SUBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\w+\((task-\d{3,})\):").expect("valid regex"));

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the current HEAD short SHA.
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Stash all uncommitted edits, untracked files included.
    ///
    /// Returns `false` when the worktree was already clean.
    #[instrument(skip_all)]
    pub fn stash_push(&self, message: &str) -> Result<bool> {
        if self.status_porcelain()?.is_empty() {
            debug!("worktree clean, nothing to stash");
            return Ok(false);
        }
        self.run_checked(&["stash", "push", "--include-untracked", "-m", message])?;
        Ok(true)
    }

    /// Task ids with a checkpoint commit (see [`task_commit_message`]) reachable
    /// from HEAD. Other mentions of a task id do not count.
    ///
    /// An empty repository or a directory outside git yields an empty set.
    #[instrument(skip_all)]
    pub fn task_ids_in_log(&self) -> Result<HashSet<String>> {
        let out = self.run(&["log", "--format=%s"])?;
        if !out.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "git log unavailable, assuming no history"
            );
            return Ok(HashSet::new());
        }
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(CHECKPOINT_SUBJECT_RE
            .captures_iter(&text)
            .map(|caps| caps[1].to_string())
            .collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Commit message used for a task checkpoint; the id is what history scans match.
pub fn task_commit_message(task_id: &str, title: &str) -> String {
    format!("feat({task_id}): {title}")
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestProject;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn commit_and_scan_history_for_task_ids() {
        let project = TestProject::new(&[("task-001", &[])]);
        let git = Git::new(project.root());
        assert!(git.is_repo());

        std::fs::write(project.root().join("lib.rs"), "// work\n").expect("write");
        git.add_all().expect("add");
        assert!(git
            .commit_staged(&task_commit_message("task-001", "Do it"))
            .expect("commit"));
        assert!(!git.commit_staged("nothing").expect("empty commit"));

        let ids = git.task_ids_in_log().expect("log");
        assert!(ids.contains("task-001"));
        assert_eq!(git.head_short_sha(7).expect("sha").len(), 7);
    }

    #[test]
    fn mentions_of_task_ids_are_not_checkpoints() {
        let project = TestProject::new(&[("task-001", &[]), ("task-002", &[])]);
        let git = Git::new(project.root());
        project.commit_file("notes.md", "docs: outline plan for task-001 and task-002");
        project.commit_file("fix.rs", "fix: follow-up to feat(task-002): parser");
        assert!(git.task_ids_in_log().expect("log").is_empty());

        project.commit_file("lib.rs", &task_commit_message("task-002", "Parser"));
        let ids = git.task_ids_in_log().expect("log");
        assert_eq!(ids, HashSet::from(["task-002".to_string()]));
    }

    #[test]
    fn stash_clears_dirty_worktree() {
        let project = TestProject::new(&[("task-001", &[])]);
        let git = Git::new(project.root());
        std::fs::write(project.root().join("scratch.txt"), "partial\n").expect("write");
        assert!(git.stash_push("ralph: task-001 attempt 1").expect("stash"));
        assert!(git.status_porcelain().expect("status").is_empty());
        assert!(!git.stash_push("again").expect("clean"));
    }

    #[test]
    fn history_outside_repo_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        assert!(!git.is_repo());
        assert!(git.task_ids_in_log().expect("log").is_empty());
    }
}
