//! Loading plan documents and writing task status back into them.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use super::paths::write_atomic;
use crate::core::parser::{parse, update_task_status};
use crate::core::types::{Plan, TaskStatus};
use crate::core::validate::validate;
use crate::error::PlanError;

/// Read and parse a plan document. Never validates.
pub fn load_plan(path: &Path) -> Result<Plan> {
    if !path.is_file() {
        return Err(PlanError::NotFound(path.to_path_buf()).into());
    }
    let document =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let plan = parse(&document);
    debug!(path = %path.display(), tasks = plan.tasks.len(), "plan loaded");
    Ok(plan)
}

/// Load a plan and refuse it unless it validates. Warnings are logged.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_valid_plan(path: &Path) -> Result<Plan> {
    let plan = load_plan(path)?;
    if plan.tasks.is_empty() {
        return Err(PlanError::Empty(path.to_path_buf()).into());
    }
    let report = validate(&plan);
    for warning in &report.warnings {
        warn!(%warning, "plan warning");
    }
    if !report.valid {
        return Err(PlanError::Invalid {
            errors: report.errors,
        }
        .into());
    }
    Ok(plan)
}

/// Rewrite one task's `Status` field in place.
///
/// Returns `false` (and leaves the file untouched) if the task is not found or
/// already has that status.
#[instrument(skip_all, fields(path = %path.display(), task_id, status = %status))]
pub fn write_task_status(path: &Path, task_id: &str, status: TaskStatus) -> Result<bool> {
    let document =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let Some(updated) = update_task_status(&document, task_id, status) else {
        warn!("task not found in plan document");
        return Ok(false);
    };
    if updated == document {
        return Ok(false);
    }
    write_atomic(path, updated.as_bytes())?;
    debug!("plan status written");
    Ok(true)
}
