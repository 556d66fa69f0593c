//! Canonical locations under a project's `.ralph/` runtime-state directory.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

const RALPH_GITIGNORE: &str = "sessions/\nsignals/\nlogs/\n";

/// All canonical paths within `.ralph/` for a project root.
#[derive(Debug, Clone)]
pub struct RalphPaths {
    pub root: PathBuf,
    pub ralph_dir: PathBuf,
    pub config_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub signals_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl RalphPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ralph_dir = root.join(".ralph");
        Self {
            root: root.clone(),
            config_path: ralph_dir.join("config.toml"),
            sessions_dir: ralph_dir.join("sessions"),
            signals_dir: ralph_dir.join("signals"),
            logs_dir: ralph_dir.join("logs"),
            gitignore_path: ralph_dir.join(".gitignore"),
            ralph_dir,
        }
    }

    pub fn session_file(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    pub fn signal_file(&self, session_id: &str, task_id: &str) -> PathBuf {
        self.signals_dir
            .join(session_id)
            .join(format!("{task_id}.json"))
    }

    pub fn attempt_log(&self, session_id: &str, task_id: &str, attempt: u32) -> PathBuf {
        self.logs_dir
            .join(session_id)
            .join(format!("{task_id}-{attempt}.jsonl"))
    }

    pub fn verify_log(&self, session_id: &str, task_id: &str, attempt: u32) -> PathBuf {
        self.logs_dir
            .join(session_id)
            .join(format!("{task_id}-{attempt}.verify.log"))
    }

    /// Create the runtime directories and the `.ralph/.gitignore` that keeps
    /// sessions, signals, and logs out of task commits. Idempotent.
    pub fn ensure_layout(&self) -> Result<()> {
        if self.ralph_dir.exists() && !self.ralph_dir.is_dir() {
            return Err(anyhow!(
                "{} exists but is not a directory",
                self.ralph_dir.display()
            ));
        }
        for dir in [&self.ralph_dir, &self.sessions_dir, &self.signals_dir, &self.logs_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        }
        if !self.gitignore_path.exists() {
            fs::write(&self.gitignore_path, RALPH_GITIGNORE)
                .with_context(|| format!("write {}", self.gitignore_path.display()))?;
        }
        Ok(())
    }
}

/// Directory holding the cross-project plan registry.
///
/// `$RALPH_HOME` when set, otherwise `~/.ralph`.
pub fn ralph_home() -> Result<PathBuf> {
    if let Some(home) = env::var_os("RALPH_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".ralph"))
        .ok_or_else(|| anyhow!("cannot locate home directory (set RALPH_HOME)"))
}

/// Atomically replace `path` with `contents` (temp file + rename).
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Canonical form of `path` when it exists, otherwise an absolute, lexically
/// cleaned form relative to the current directory.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}
