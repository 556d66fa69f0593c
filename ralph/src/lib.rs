//! Ralph: drives an AI coding agent through a dependency-ordered task plan.
//!
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (plan parsing, validation,
//!   dependency resolution, session model, status reconciliation). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, child processes,
//!   the agent, the plan registry). Isolated behind small types and traits so
//!   tests can swap them.
//!
//! [`engine`] coordinates the two to run a plan, [`events`] carries live
//! progress to observers, and [`mcp`] is the completion side-channel the agent
//! calls into.

pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod mcp;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
