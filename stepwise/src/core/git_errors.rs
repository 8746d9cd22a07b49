//! Classification of git failures into terminal and transient errors.
//!
//! Classification matches git's human-readable output. Git localizes these
//! messages and rewords them between releases, so the git adapter pins
//! `LC_ALL=C`; anything unrecognized is treated as transient and retried.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Git operations issued by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GitOpKind {
    Add,
    Commit,
    Reset,
    Checkout,
    Status,
    HeadHash,
    Branch,
    Push,
    Inspect,
}

impl GitOpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GitOpKind::Add => "add",
            GitOpKind::Commit => "commit",
            GitOpKind::Reset => "reset",
            GitOpKind::Checkout => "checkout",
            GitOpKind::Status => "status",
            GitOpKind::HeadHash => "head-hash",
            GitOpKind::Branch => "branch",
            GitOpKind::Push => "push",
            GitOpKind::Inspect => "inspect",
        }
    }

    /// Operations that change repository state and must pass the rate limiter.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            GitOpKind::Add
                | GitOpKind::Commit
                | GitOpKind::Reset
                | GitOpKind::Checkout
                | GitOpKind::Branch
                | GitOpKind::Push
        )
    }
}

impl fmt::Display for GitOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures that retrying cannot fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    NotARepository,
    NothingToCommit,
    PermissionDenied,
    BadObject,
    PathspecMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Terminal(TerminalKind),
    Transient,
}

impl ErrorClass {
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorClass::Terminal(_))
    }
}

static TERMINAL_PATTERNS: LazyLock<Vec<(TerminalKind, Regex)>> = LazyLock::new(|| {
    [
        (TerminalKind::NotARepository, r"(?i)not a git repository"),
        (
            TerminalKind::NothingToCommit,
            r"(?i)nothing to commit|nothing added to commit|no changes added to commit",
        ),
        (
            TerminalKind::PermissionDenied,
            r"(?i)permission denied|operation not permitted|read-only file system",
        ),
        (
            TerminalKind::BadObject,
            r"(?i)bad object|bad revision|unknown revision|not a valid object name|invalid reference",
        ),
        (
            TerminalKind::PathspecMismatch,
            r"(?i)pathspec .* did not match|did not match any file",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("terminal git pattern")))
    .collect()
});

/// Classify captured git output (stderr, falling back to stdout).
pub fn classify(message: &str) -> ErrorClass {
    TERMINAL_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(kind, _)| ErrorClass::Terminal(*kind))
        .unwrap_or(ErrorClass::Transient)
}

pub fn suggestion(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Terminal(TerminalKind::NotARepository) => {
            "run inside a git repository or `git init` first"
        }
        ErrorClass::Terminal(TerminalKind::NothingToCommit) => {
            "no changes were staged; check that the step actually modified files"
        }
        ErrorClass::Terminal(TerminalKind::PermissionDenied) => {
            "check file permissions and repository ownership"
        }
        ErrorClass::Terminal(TerminalKind::BadObject) => {
            "the referenced commit or branch does not exist; verify the name"
        }
        ErrorClass::Terminal(TerminalKind::PathspecMismatch) => {
            "the path is not known to git; check the step path"
        }
        ErrorClass::Transient => {
            "retry later; check for a stale .git/index.lock or network issues"
        }
    }
}

/// `git <op> failed: <raw> (suggestion: ...)`.
pub fn format_error(op: GitOpKind, raw: &str, class: ErrorClass) -> String {
    format!(
        "git {op} failed: {} (suggestion: {})",
        raw.trim(),
        suggestion(class)
    )
}
