//! Shared deterministic types for executor core logic.
//!
//! These types are rebuilt for every step and never persisted directly; the
//! executor copies what it needs into the step's `execution_log`.

use serde::{Deserialize, Serialize};

/// Outcome of one quality check (lint, test, or a step script).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub passed: bool,
    /// False when the check is disabled; a skipped check counts as passed.
    pub ran: bool,
    pub timed_out: bool,
    /// Combined stdout + stderr, truncated to the configured tail.
    pub output: String,
}

impl CheckResult {
    pub fn skipped() -> Self {
        Self {
            passed: true,
            ran: false,
            timed_out: false,
            output: String::new(),
        }
    }
}

/// Lint + test outcome gating a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheckResult {
    pub lint: CheckResult,
    pub test: CheckResult,
    pub overall_passed: bool,
}

impl QualityCheckResult {
    pub fn new(lint: CheckResult, test: CheckResult) -> Self {
        let overall_passed = lint.passed && test.passed;
        Self {
            lint,
            test,
            overall_passed,
        }
    }

    /// True if at least one check actually executed.
    pub fn any_ran(&self) -> bool {
        self.lint.ran || self.test.ran
    }

    /// Output of the failed checks, labelled, for the step log.
    pub fn failure_output(&self) -> String {
        let mut buf = String::new();
        for (label, check) in [("lint", &self.lint), ("test", &self.test)] {
            if check.passed {
                continue;
            }
            if !buf.is_empty() {
                buf.push('\n');
            }
            if check.timed_out {
                buf.push_str(&format!("[{label} timed out]\n"));
            } else {
                buf.push_str(&format!("[{label} failed]\n"));
            }
            buf.push_str(&check.output);
        }
        buf
    }
}

/// Keep the last `max_lines` lines of `text`.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_lines_keeps_last_lines() {
        let text = (1..=15).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&text, 10);
        assert_eq!(tail.lines().count(), 10);
        assert!(tail.starts_with("6\n"));
        assert!(tail.ends_with("15"));
    }

    #[test]
    fn overall_requires_both_checks() {
        let failed = CheckResult {
            passed: false,
            ran: true,
            timed_out: false,
            output: "1 test failed".to_string(),
        };
        let result = QualityCheckResult::new(CheckResult::skipped(), failed);
        assert!(!result.overall_passed);
        assert!(result.failure_output().contains("[test failed]"));
        assert!(!result.failure_output().contains("[lint"));
    }
}
