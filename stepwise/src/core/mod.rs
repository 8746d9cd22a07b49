//! Deterministic, pure logic shared by the executor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! plans, step content, and captured command output, and return deterministic
//! results suitable for tests.

pub mod autofix;
pub mod commit_message;
pub mod condition;
pub mod git_errors;
pub mod invariants;
pub mod layer;
pub mod refactor;
pub mod scoring;
pub mod script_guard;
pub mod selector;
pub mod summary;
pub mod types;
