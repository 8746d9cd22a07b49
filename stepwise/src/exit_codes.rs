//! Stable exit codes for stepwise commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Step failure, invalid plan or config, or any other error.
pub const GENERAL: i32 = 1;
/// Stopped by SIGINT; the plan was saved and a rerun resumes.
pub const INTERRUPTED: i32 = 130;
/// Stopped by SIGTERM; the plan was saved and a rerun resumes.
pub const TERMINATED: i32 = 143;
