//! Restore the repository to its state from before a failed step.
//!
//! Rollback is best effort: every action that fails is logged and reported,
//! and the caller's original error always wins.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::io::git::Git;

/// Repository state captured right before a step runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSnapshot {
    /// Last known-good commit; `None` in a repository without commits.
    pub head: Option<String>,
    /// Untracked files that already existed.
    pub untracked: BTreeSet<String>,
}

/// What rollback did, and what it could not do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub actions: Vec<String>,
    pub errors: Vec<String>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn fail(&mut self, what: String) {
        warn!(error = %what, "rollback action failed");
        self.errors.push(what);
    }
}

/// Paths rollback must never touch, relative to the repository root.
#[derive(Debug, Clone, Default)]
pub struct Protected {
    prefixes: Vec<String>,
}

impl Protected {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| path == p || path.starts_with(p))
    }
}

pub fn snapshot(git: &Git) -> Result<StepSnapshot> {
    let head = git.head_hash().ok();
    let untracked = git
        .status()?
        .into_iter()
        .filter(|e| e.is_untracked())
        .map(|e| e.path)
        .collect();
    Ok(StepSnapshot { head, untracked })
}

/// Undo a failed step.
///
/// 1. Reset HEAD and the index to the known-good commit.
/// 2. Restore each step path that exists in that commit.
/// 3. Delete untracked files that appeared since the snapshot.
/// 4. Remove directories the step created, deepest first, if now empty.
#[instrument(skip_all, fields(paths = step_paths.len()))]
pub fn rollback(
    git: &Git,
    snapshot: &StepSnapshot,
    step_paths: &[String],
    created_dirs: &[String],
    protected: &Protected,
) -> RollbackReport {
    let mut report = RollbackReport::default();
    let root = git.workdir().to_path_buf();

    if let Some(head) = &snapshot.head {
        match git.reset(head) {
            Ok(()) => report.actions.push(format!("reset to {}", short(head))),
            Err(err) => report.fail(err.to_string()),
        }
        for path in step_paths.iter().filter(|p| !protected.contains(p)) {
            match git.path_in_commit(head, path) {
                Ok(true) => match git.checkout_paths(head, &[path.as_str()]) {
                    Ok(()) => report.actions.push(format!("restored {path}")),
                    Err(err) => report.fail(err.to_string()),
                },
                Ok(false) => {}
                Err(err) => report.fail(format!("inspect {path}: {err:#}")),
            }
        }
    }

    match git.status() {
        Ok(entries) => {
            for entry in entries {
                if !entry.is_untracked()
                    || snapshot.untracked.contains(&entry.path)
                    || protected.contains(&entry.path)
                {
                    continue;
                }
                match fs::remove_file(root.join(&entry.path)) {
                    Ok(()) => report.actions.push(format!("removed {}", entry.path)),
                    Err(err) => report.fail(format!("remove {}: {err}", entry.path)),
                }
            }
        }
        Err(err) => report.fail(err.to_string()),
    }

    let mut dirs: Vec<&String> = created_dirs.iter().collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(Path::new(d.as_str()).components().count()));
    for dir in dirs {
        let full = root.join(dir);
        if is_empty_dir(&full) {
            match fs::remove_dir(&full) {
                Ok(()) => report.actions.push(format!("removed directory {dir}")),
                Err(err) => report.fail(format!("remove directory {dir}: {err}")),
            }
        }
    }

    info!(
        actions = report.actions.len(),
        errors = report.errors.len(),
        "rollback finished"
    );
    report
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
