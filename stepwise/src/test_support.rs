//! Test helpers: throwaway git repositories and scripted collaborators.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use crate::core::types::{CheckResult, QualityCheckResult};
use crate::io::config::{GitConfig, RunnerConfig};
use crate::io::git::Git;
use crate::io::prompt::Prompt;
use crate::io::pull_request::{PullRequest, PullRequestOpener, PullRequestOutcome};
use crate::io::quality_gate::{GateRequest, QualityGate, run_shell};
use crate::io::signals::CancelToken;

/// A git repository in a temp dir with one commit (`README.md` = "hi\n") on
/// branch `main`.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path().to_path_buf();
        let repo = Self { _temp: temp, root };
        repo.git_cmd(&["init", "-q"])?;
        repo.git_cmd(&["checkout", "-q", "-b", "main"])?;
        repo.git_cmd(&["config", "user.email", "test@example.com"])?;
        repo.git_cmd(&["config", "user.name", "test"])?;
        repo.git_cmd(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "hi\n")?;
        repo.git_cmd(&["add", "README.md"])?;
        repo.git_cmd(&["commit", "-q", "-m", "chore: init"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Git adapter without backoff delays or rate-limit waits.
    pub fn git(&self) -> Git {
        Git::with_config(&self.root, &fast_git_config())
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Run git and return stdout; fails on nonzero exit.
    pub fn git_cmd(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .env("LC_ALL", "C")
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.git_cmd(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Commit subjects, newest first.
    pub fn subjects(&self) -> Result<Vec<String>> {
        Ok(self
            .git_cmd(&["log", "--format=%s"])?
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// `git status --porcelain` output, empty when clean.
    pub fn porcelain(&self) -> Result<String> {
        self.git_cmd(&["status", "--porcelain=v1", "-uall"])
    }
}

pub fn fast_git_config() -> GitConfig {
    GitConfig {
        max_retries: 3,
        base_delay_ms: 0,
        rate_limit_capacity: 1000,
        rate_limit_per_minute: 60_000,
    }
}

/// Config for tests: no waits, nothing slow.
pub fn fast_config() -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.git = fast_git_config();
    config.safety.non_interactive_delay_secs = 0;
    config
}

/// Quality gate with canned lint/test results. Step scripts run for real.
#[derive(Debug, Default)]
pub struct ScriptedGate {
    results: RefCell<VecDeque<QualityCheckResult>>,
    checks: Cell<usize>,
    cancel_on_check: Option<(CancelToken, i32)>,
}

impl ScriptedGate {
    pub fn passing() -> Self {
        Self::default()
    }

    /// Fail the next check with `output` from the test command.
    pub fn failing_test(output: &str) -> Self {
        let gate = Self::default();
        gate.push(QualityCheckResult::new(
            passed_check(),
            CheckResult {
                passed: false,
                ran: true,
                timed_out: false,
                output: output.to_string(),
            },
        ));
        gate
    }

    /// Cancel `token` during every check, as a signal arriving mid-gate would.
    pub fn cancelling(mut self, token: CancelToken, exit_code: i32) -> Self {
        self.cancel_on_check = Some((token, exit_code));
        self
    }

    pub fn push(&self, result: QualityCheckResult) {
        self.results.borrow_mut().push_back(result);
    }

    /// Number of `check` calls so far.
    pub fn checks(&self) -> usize {
        self.checks.get()
    }
}

fn passed_check() -> CheckResult {
    CheckResult {
        passed: true,
        ran: true,
        timed_out: false,
        output: String::new(),
    }
}

impl QualityGate for ScriptedGate {
    fn check(&self, _request: &GateRequest) -> Result<QualityCheckResult> {
        self.checks.set(self.checks.get() + 1);
        if let Some((token, exit_code)) = &self.cancel_on_check {
            token.cancel(*exit_code);
        }
        Ok(self
            .results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| QualityCheckResult::new(passed_check(), passed_check())))
    }

    fn run_script(&self, script: &str, request: &GateRequest) -> Result<CheckResult> {
        run_shell(script, request)
    }
}

/// Prompt that replays answers and counts questions.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: RefCell<VecDeque<bool>>,
    asked: Cell<usize>,
}

impl ScriptedPrompt {
    pub fn new<I: IntoIterator<Item = bool>>(answers: I) -> Self {
        Self {
            answers: RefCell::new(answers.into_iter().collect()),
            asked: Cell::new(0),
        }
    }

    pub fn asked(&self) -> usize {
        self.asked.get()
    }
}

impl Prompt for ScriptedPrompt {
    fn confirm(&self, _question: &str, default: bool) -> Result<bool> {
        self.asked.set(self.asked.get() + 1);
        Ok(self.answers.borrow_mut().pop_front().unwrap_or(default))
    }
}

/// Records pull requests instead of talking to a host.
#[derive(Debug)]
pub struct RecordingOpener {
    pub outcome: PullRequestOutcome,
    opened: RefCell<Vec<PullRequest>>,
}

impl RecordingOpener {
    pub fn new(outcome: PullRequestOutcome) -> Self {
        Self {
            outcome,
            opened: RefCell::new(Vec::new()),
        }
    }

    pub fn opened(&self) -> Vec<PullRequest> {
        self.opened.borrow().clone()
    }
}

impl PullRequestOpener for RecordingOpener {
    fn default_branch(&self) -> Result<String> {
        Ok("main".to_string())
    }

    fn open(&self, request: &PullRequest) -> Result<PullRequestOutcome> {
        self.opened.borrow_mut().push(request.clone());
        Ok(self.outcome.clone())
    }
}
