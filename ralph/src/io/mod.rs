//! Side-effecting adapters: filesystem, git, child processes, the agent.

pub mod agent;
pub mod config;
pub mod git;
pub mod paths;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod registry;
pub mod session_store;
pub mod signal;
pub mod status;
pub mod verify;
