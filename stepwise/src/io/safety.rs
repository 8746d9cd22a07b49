//! Working-tree safety check before a run.
//!
//! A dirty tree is never silently accepted: interactive runs ask for
//! confirmation, non-interactive runs warn and wait before proceeding.

use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::io::git::{Git, StatusEntry};
use crate::io::prompt::Prompt;
use crate::io::rollback::Protected;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyMode {
    Interactive,
    /// Warn, then proceed after the delay.
    NonInteractive { delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyOutcome {
    Clean,
    /// Dirty, but the user (or the non-interactive policy) allowed the run.
    ProceedDirty(Vec<StatusEntry>),
}

/// Inspect the working tree, ignoring protected paths.
pub fn check_working_tree(
    git: &Git,
    protected: &Protected,
    mode: SafetyMode,
    prompt: &dyn Prompt,
) -> Result<SafetyOutcome> {
    let dirty: Vec<StatusEntry> = git
        .status()?
        .into_iter()
        .filter(|e| !protected.contains(&e.path))
        .collect();
    if dirty.is_empty() {
        info!("working tree is clean");
        return Ok(SafetyOutcome::Clean);
    }

    let listing: Vec<String> = dirty
        .iter()
        .map(|e| format!("{} {}", e.code, e.path))
        .collect();
    warn!(count = dirty.len(), "working tree has uncommitted changes");

    match mode {
        SafetyMode::Interactive => {
            let question = format!(
                "working tree has uncommitted changes:\n  {}\nrollback may discard edits to step paths. continue?",
                listing.join("\n  ")
            );
            if !prompt.confirm(&question, false)? {
                bail!("aborted: working tree has uncommitted changes");
            }
        }
        SafetyMode::NonInteractive { delay } => {
            warn!(
                delay_secs = delay.as_secs(),
                changes = %listing.join(", "),
                "proceeding with uncommitted changes after delay"
            );
            thread::sleep(delay);
        }
    }
    Ok(SafetyOutcome::ProceedDirty(dirty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedPrompt, TestRepo};

    #[test]
    fn clean_tree_never_prompts() {
        let repo = TestRepo::new().expect("repo");
        let prompt = ScriptedPrompt::default();
        let outcome = check_working_tree(
            &repo.git(),
            &Protected::default(),
            SafetyMode::Interactive,
            &prompt,
        )
        .expect("check");
        assert_eq!(outcome, SafetyOutcome::Clean);
        assert_eq!(prompt.asked(), 0);
    }

    #[test]
    fn declined_confirmation_aborts() {
        let repo = TestRepo::new().expect("repo");
        repo.write("README.md", "dirty\n").expect("write");
        let prompt = ScriptedPrompt::new([false]);
        let err = check_working_tree(
            &repo.git(),
            &Protected::default(),
            SafetyMode::Interactive,
            &prompt,
        )
        .unwrap_err();
        assert!(err.to_string().contains("aborted"));
        assert_eq!(prompt.asked(), 1);
    }

    #[test]
    fn non_interactive_proceeds_after_delay() {
        let repo = TestRepo::new().expect("repo");
        repo.write("new.txt", "x\n").expect("write");
        let prompt = ScriptedPrompt::default();
        let outcome = check_working_tree(
            &repo.git(),
            &Protected::default(),
            SafetyMode::NonInteractive {
                delay: Duration::ZERO,
            },
            &prompt,
        )
        .expect("check");
        assert!(matches!(outcome, SafetyOutcome::ProceedDirty(ref e) if e.len() == 1));
        assert_eq!(prompt.asked(), 0);
    }

    #[test]
    fn protected_paths_do_not_count_as_dirty() {
        let repo = TestRepo::new().expect("repo");
        repo.write("plan.yaml", "steps: []\n").expect("write");
        let prompt = ScriptedPrompt::default();
        let outcome = check_working_tree(
            &repo.git(),
            &Protected::new(["plan.yaml"]),
            SafetyMode::Interactive,
            &prompt,
        )
        .expect("check");
        assert_eq!(outcome, SafetyOutcome::Clean);
    }
}
