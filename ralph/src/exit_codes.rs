//! Stable exit codes for `ralph` CLI commands.

/// Command succeeded; for `run`, every dispatched task completed.
pub const OK: i32 = 0;
/// Invalid plan, config, or arguments, or an I/O failure before work started.
pub const INVALID: i32 = 1;
/// `ralph run` finished but at least one task failed or was cancelled.
pub const TASKS_FAILED: i32 = 2;
