//! Side-effecting adapters: filesystem, git, child processes, terminal.

pub mod audit;
pub mod config;
pub mod git;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod pull_request;
pub mod quality_gate;
pub mod rollback;
pub mod safety;
pub mod signals;
