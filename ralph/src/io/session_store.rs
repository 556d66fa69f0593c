//! Session persistence: one JSON document per session under `.ralph/sessions/`.
//!
//! Writes are whole-document and atomic. Files that fail to parse are skipped
//! with a warning so a corrupt session never blocks a fresh run. Across
//! processes the last writer wins.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use tracing::{debug, instrument, warn};

use super::paths::{RalphPaths, resolve_path, write_atomic};
use crate::core::session::Session;

static SESSION_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^session-\d{17}-[0-9a-f]{4}\.json$").expect("valid regex")
});

/// Time-ordered unique id: `session-<yyyymmddHHMMSSmmm>-<4 hex>`.
pub fn new_session_id(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().r#gen();
    format!("session-{}-{suffix:04x}", now.format("%Y%m%d%H%M%S%3f"))
}

pub fn is_session_file_name(name: &str) -> bool {
    SESSION_FILE_RE.is_match(name)
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(paths: &RalphPaths) -> Self {
        Self {
            dir: paths.sessions_dir.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A fresh, unpersisted session for `plan_path` (stored resolved).
    pub fn create(&self, plan_path: &Path) -> Session {
        let now = Utc::now();
        Session::new(new_session_id(now), resolve_path(plan_path), now)
    }

    #[instrument(skip_all, fields(session_id = %session.session_id))]
    pub fn persist(&self, session: &Session) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(session).context("serialize session")?;
        buf.push('\n');
        write_atomic(&self.path_for(&session.session_id), buf.as_bytes())?;
        debug!(history = session.task_history.len(), "session persisted");
        Ok(())
    }

    /// Most recently written session whose plan path resolves to `plan_path`.
    #[instrument(skip_all, fields(plan = %plan_path.display()))]
    pub fn load(&self, plan_path: &Path) -> Result<Option<Session>> {
        let wanted = resolve_path(plan_path);
        let found = self
            .scan()?
            .into_iter()
            .map(|(_, session)| session)
            .find(|session| resolve_path(&session.plan_path) == wanted);
        debug!(found = ?found.as_ref().map(|s| &s.session_id), "session lookup");
        Ok(found)
    }

    pub fn load_by_id(&self, session_id: &str) -> Result<Option<Session>> {
        match self.existing_file(session_id) {
            Some(path) => Ok(read_session(&path)),
            None => Ok(None),
        }
    }

    /// Every readable session, newest first.
    pub fn list(&self) -> Result<Vec<Session>> {
        Ok(self.scan()?.into_iter().map(|(_, session)| session).collect())
    }

    /// Remove a session file. Returns `false` if it did not exist.
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let Some(path) = self.existing_file(session_id) else {
            return Ok(false);
        };
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        Ok(true)
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// Session file for an id taken from outside (CLI, HTTP); `None` for ids
    /// that are malformed or have no file.
    fn existing_file(&self, session_id: &str) -> Option<PathBuf> {
        let name = format!("{session_id}.json");
        if !is_session_file_name(&name) {
            return None;
        }
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }

    fn scan(&self) -> Result<Vec<(SystemTime, Session)>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        let entries =
            fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", self.dir.display()))?;
            let name = entry.file_name();
            if !is_session_file_name(&name.to_string_lossy()) {
                continue;
            }
            let path = entry.path();
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if let Some(session) = read_session(&path) {
                sessions.push((modified, session));
            }
        }
        sessions.sort_by(|(a_time, a), (b_time, b)| {
            b_time
                .cmp(a_time)
                .then_with(|| b.last_activity.cmp(&a.last_activity))
                .then_with(|| b.session_id.cmp(&a.session_id))
        });
        Ok(sessions)
    }
}

fn read_session(path: &Path) -> Option<Session> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), %err, "unreadable session file, ignoring");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(session) => Some(session),
        Err(err) => {
            warn!(path = %path.display(), %err, "corrupt session file, ignoring");
            None
        }
    }
}

/// A session shared by concurrently running tasks.
///
/// Every mutation runs under one lock and is persisted before the lock is
/// released, so concurrent completions never overwrite each other.
#[derive(Debug)]
pub struct LiveSession {
    store: SessionStore,
    inner: Mutex<Session>,
}

impl LiveSession {
    pub fn new(store: SessionStore, session: Session) -> Self {
        Self {
            store,
            inner: Mutex::new(session),
        }
    }

    /// Apply `mutate` and persist the result.
    pub fn update<T>(&self, mutate: impl FnOnce(&mut Session) -> T) -> Result<T> {
        let mut session = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let out = mutate(&mut session);
        self.store.persist(&session)?;
        Ok(out)
    }

    pub fn snapshot(&self) -> Session {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn read<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        f(&self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::{CompletionSource, TaskResult};

    fn store_in(temp: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(&RalphPaths::new(temp.path()))
    }

    #[test]
    fn session_id_has_expected_shape() {
        let id = new_session_id(Utc::now());
        assert!(is_session_file_name(&format!("{id}.json")), "{id}");
    }

    #[test]
    fn persist_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        let plan = temp.path().join("plan.md");
        fs::write(&plan, "x").expect("write plan");

        let mut session = store.create(&plan);
        session.record_task_start("task-001", 1, None, Utc::now());
        session.record_task_result(
            "task-001",
            Ok(TaskResult {
                completion: CompletionSource::Signal,
                summary: Some("ok".into()),
                commit: Some("abc1234".into()),
                agent_session_id: None,
                duration_ms: 5,
            }),
            Utc::now(),
        );
        session.record_task_start("task-002", 1, None, Utc::now());
        session.record_task_result("task-002", Err("boom".into()), Utc::now());
        store.persist(&session).expect("persist");

        let loaded = store.load(&plan).expect("load").expect("found");
        assert_eq!(loaded, session);
        assert_eq!(loaded.completed_tasks, session.completed_tasks);
        assert_eq!(loaded.failed_tasks, session.failed_tasks);
        assert_eq!(loaded.task_history.len(), 4);
    }

    #[test]
    fn load_matches_resolved_plan_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        let plan = temp.path().join("plan.md");
        fs::write(&plan, "x").expect("write plan");
        let session = store.create(&temp.path().join(".").join("plan.md"));
        store.persist(&session).expect("persist");

        let loaded = store.load(&plan).expect("load").expect("found");
        assert_eq!(loaded.session_id, session.session_id);
        assert!(store.load(&temp.path().join("other.md")).expect("load").is_none());
    }

    #[test]
    fn corrupt_files_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        let plan = temp.path().join("plan.md");
        fs::write(&plan, "x").expect("write plan");
        let good = store.create(&plan);
        store.persist(&good).expect("persist");
        fs::write(
            store.dir().join("session-20990101000000000-ffff.json"),
            "{not json",
        )
        .expect("write corrupt");

        let loaded = store.load(&plan).expect("load").expect("found");
        assert_eq!(loaded.session_id, good.session_id);
        assert_eq!(store.list().expect("list").len(), 1);
    }

    #[test]
    fn newest_session_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        let plan = temp.path().join("plan.md");
        fs::write(&plan, "x").expect("write plan");
        let older = store.create(&plan);
        store.persist(&older).expect("persist");
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut newer = store.create(&plan);
        newer.last_activity = older.last_activity + chrono::Duration::seconds(5);
        store.persist(&newer).expect("persist");

        let loaded = store.load(&plan).expect("load").expect("found");
        assert_eq!(loaded.session_id, newer.session_id);
    }

    #[test]
    fn delete_removes_only_session_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        let session = store.create(&temp.path().join("plan.md"));
        store.persist(&session).expect("persist");
        assert!(store.delete(&session.session_id).expect("delete"));
        assert!(!store.delete(&session.session_id).expect("second delete"));
        assert!(!store.delete("../config").expect("rejects odd ids"));
    }

    #[test]
    fn load_by_id_stays_inside_the_sessions_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        let session = store.create(&temp.path().join("plan.md"));
        store.persist(&session).expect("persist");
        let outside = temp.path().join(".ralph").join("stolen.json");
        fs::copy(store.dir().join(format!("{}.json", session.session_id)), &outside)
            .expect("copy session outside");

        assert!(store.load_by_id("../stolen").expect("load").is_none());
        assert!(store.load_by_id("not-a-session").expect("load").is_none());
        assert!(store.load_by_id(&session.session_id).expect("load").is_some());
    }

    #[test]
    fn live_session_persists_each_update() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(&temp);
        let session = store.create(&temp.path().join("plan.md"));
        let id = session.session_id.clone();
        let live = LiveSession::new(store.clone(), session);
        live.update(|s| s.record_skip("task-001", Utc::now()))
            .expect("update");
        let on_disk = store.load_by_id(&id).expect("load").expect("found");
        assert!(on_disk.skipped_tasks.contains("task-001"));
        assert_eq!(live.snapshot(), on_disk);
    }
}
