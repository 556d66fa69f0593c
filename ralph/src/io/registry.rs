//! Cross-project plan registry (`$RALPH_HOME/registry.json`).
//!
//! Maps a short, stable id to a (project root, plan path) pair so one server
//! can host plans from several projects.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use super::paths::{ralph_home, resolve_path, write_atomic};
use super::plan_store::load_plan;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPlan {
    pub plan_id: String,
    pub project_root: PathBuf,
    pub plan_path: PathBuf,
    pub title: String,
    pub total_tasks: usize,
    pub registered_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_plans: usize,
    pub total_projects: usize,
    pub total_tasks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    plans: BTreeMap<String, RegisteredPlan>,
}

/// First 8 hex chars of SHA-256 over the resolved plan path.
pub fn plan_id(plan_path: &Path) -> String {
    let digest = Sha256::digest(resolve_path(plan_path).to_string_lossy().as_bytes());
    hex::encode(digest)[..8].to_string()
}

#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Registry {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::at(ralph_home()?.join("registry.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add or refresh a plan. A relative `plan_path` is taken relative to `project_root`.
    #[instrument(skip_all, fields(root = %project_root.display(), plan = %plan_path.display()))]
    pub fn register(&self, project_root: &Path, plan_path: &Path) -> Result<RegisteredPlan> {
        let project_root = resolve_path(project_root);
        let plan_path = resolve_path(&project_root.join(plan_path));
        let plan = load_plan(&plan_path)?;
        let id = plan_id(&plan_path);
        let now = Utc::now();

        self.modify(|file| {
            let registered_at = file.plans.get(&id).map_or(now, |p| p.registered_at);
            let entry = RegisteredPlan {
                plan_id: id.clone(),
                project_root: project_root.clone(),
                plan_path: plan_path.clone(),
                title: if plan.project_name.is_empty() {
                    plan_path
                        .file_stem()
                        .map_or_else(|| id.clone(), |s| s.to_string_lossy().into_owned())
                } else {
                    plan.project_name.clone()
                },
                total_tasks: plan.tasks.len(),
                registered_at,
                last_accessed: now,
            };
            file.plans.insert(id.clone(), entry.clone());
            debug!(plan_id = %id, "plan registered");
            entry
        })
    }

    pub fn unregister(&self, plan_id: &str) -> Result<bool> {
        self.modify(|file| file.plans.remove(plan_id).is_some())
    }

    /// Look up a plan and record the access.
    pub fn get(&self, plan_id: &str) -> Result<Option<RegisteredPlan>> {
        self.modify(|file| {
            file.plans.get_mut(plan_id).map(|entry| {
                entry.last_accessed = Utc::now();
                entry.clone()
            })
        })
    }

    /// All plans, oldest registration first.
    pub fn list(&self) -> Result<Vec<RegisteredPlan>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut plans: Vec<_> = self.read()?.plans.into_values().collect();
        plans.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.plan_id.cmp(&b.plan_id))
        });
        Ok(plans)
    }

    pub fn stats(&self) -> Result<RegistryStats> {
        let plans = self.list()?;
        let projects: BTreeSet<&PathBuf> = plans.iter().map(|p| &p.project_root).collect();
        Ok(RegistryStats {
            total_plans: plans.len(),
            total_projects: projects.len(),
            total_tasks: plans.iter().map(|p| p.total_tasks).sum(),
            last_accessed: plans.iter().map(|p| p.last_accessed).max(),
        })
    }

    /// Remove every entry; returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        self.modify(|file| {
            let removed = file.plans.len();
            file.plans.clear();
            removed
        })
    }

    fn read(&self) -> Result<RegistryFile> {
        if !self.path.exists() {
            return Ok(RegistryFile::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read registry {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse registry {}", self.path.display()))
    }

    fn modify<T>(&self, change: impl FnOnce(&mut RegistryFile) -> T) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read()?;
        let out = change(&mut file);
        let mut buf = serde_json::to_string_pretty(&file).context("serialize registry")?;
        buf.push('\n');
        write_atomic(&self.path, buf.as_bytes())?;
        Ok(out)
    }
}
