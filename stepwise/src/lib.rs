//! Deterministic workflow interpreter.
//!
//! A plan is an ordered list of typed steps (create, refactor, and delete
//! files; folders; branches; pull requests; scripts). The executor applies
//! them to a git repository one at a time, gates each mutation behind lint and
//! test commands, commits per step, rolls back on failure, and scores every
//! step. The code is split the same way throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (selection, invariants, commit
//!   messages, scoring, auto-fix). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, processes,
//!   terminal, signals). Isolated behind traits where tests need fakes.
//!
//! Orchestration modules ([`run`], [`dispatch`], [`fix`], [`validate`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod dispatch;
pub mod error;
pub mod exit_codes;
pub mod fix;
pub mod io;
pub mod logging;
pub mod plan;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
