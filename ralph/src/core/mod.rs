//! Deterministic, pure logic shared by the engine, CLI, and server.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests;
//! timestamps are passed in rather than read from the clock.

pub mod message;
pub mod parser;
pub mod reconcile;
pub mod resolver;
pub mod session;
pub mod types;
pub mod validate;
