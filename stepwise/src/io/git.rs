//! Git adapter for the step executor.
//!
//! Every call goes through [`execute_git_operation`], which classifies failures
//! and retries transient ones with linear backoff. Mutating calls first take a
//! token from a shared [`RateLimiter`]. Arguments are passed to `git` as
//! discrete argv entries (never through a shell), and path arguments are also
//! stripped of shell metacharacters.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::git_errors::{ErrorClass, GitOpKind, TerminalKind, classify, format_error};
use crate::io::config::GitConfig;

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '!', '*', '?', '\n', '\r',
];

/// Retry budget for one git operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Outcome of one git operation, including retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOperationResult {
    pub success: bool,
    /// Captured output on success, raw failure text otherwise.
    pub output: String,
    /// Formatted error (operation, raw message, suggestion) on failure.
    pub error: Option<String>,
    pub class: Option<ErrorClass>,
    pub retries: u32,
}

impl GitOperationResult {
    pub fn into_result(self, op: GitOpKind) -> Result<String, GitOperationError> {
        if self.success {
            return Ok(self.output);
        }
        let class = self.class.unwrap_or(ErrorClass::Transient);
        Err(GitOperationError {
            op,
            class,
            message: self
                .error
                .unwrap_or_else(|| format_error(op, &self.output, class)),
            raw: self.output,
            retries: self.retries,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct GitOperationError {
    pub op: GitOpKind,
    pub class: ErrorClass,
    pub raw: String,
    pub message: String,
    pub retries: u32,
}

impl GitOperationError {
    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        match self.class {
            ErrorClass::Terminal(kind) => Some(kind),
            ErrorClass::Transient => None,
        }
    }

    pub fn is_nothing_to_commit(&self) -> bool {
        self.terminal_kind() == Some(TerminalKind::NothingToCommit)
    }

    pub fn is_pathspec_mismatch(&self) -> bool {
        self.terminal_kind() == Some(TerminalKind::PathspecMismatch)
    }
}

/// Run `command`, retrying transient failures.
///
/// Terminal failures are attempted exactly once regardless of `max_retries`.
/// `command` returns captured output on success and the raw failure text
/// (stderr, or stdout when stderr is empty) otherwise.
pub fn execute_git_operation<F>(
    kind: GitOpKind,
    policy: &RetryPolicy,
    mut command: F,
) -> GitOperationResult
where
    F: FnMut() -> Result<String, String>,
{
    let mut retries = 0;
    loop {
        match command() {
            Ok(output) => {
                return GitOperationResult {
                    success: true,
                    output,
                    error: None,
                    class: None,
                    retries,
                };
            }
            Err(raw) => {
                let class = classify(&raw);
                if class.is_terminal() || retries >= policy.max_retries {
                    let message = format_error(kind, &raw, class);
                    warn!(op = %kind, retries, terminal = class.is_terminal(), "git operation failed");
                    return GitOperationResult {
                        success: false,
                        output: raw,
                        error: Some(message),
                        class: Some(class),
                        retries,
                    };
                }
                retries += 1;
                let delay = policy.delay_for(retries);
                debug!(op = %kind, retries, delay_ms = delay.as_millis() as u64, "retrying git operation");
                thread::sleep(delay);
            }
        }
    }
}

/// Token bucket state. Pure: callers pass the clock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, per_minute: u32, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(per_minute) / 60.0,
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    /// Take a token, or return how long to wait until one is available.
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_per_sec))
    }
}

/// Shared limiter in front of every git mutation. Exhaustion waits, never fails.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, per_minute: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(capacity, per_minute, Instant::now())),
        }
    }

    pub fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
                match bucket.try_acquire_at(Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "git rate limit reached, waiting");
            thread::sleep(wait);
        }
    }
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Strip shell metacharacters from a path argument.
pub fn sanitize_path_arg(path: &str) -> String {
    path.chars()
        .filter(|c| !SHELL_METACHARACTERS.contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self::with_config(workdir, &GitConfig::default())
    }

    pub fn with_config(workdir: impl Into<PathBuf>, config: &GitConfig) -> Self {
        Self {
            workdir: workdir.into(),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.base_delay_ms),
            },
            limiter: Arc::new(RateLimiter::new(
                config.rate_limit_capacity,
                config.rate_limit_per_minute,
            )),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Stage paths (one or many).
    #[instrument(skip_all, fields(count = paths.len()))]
    pub fn add(&self, paths: &[&str]) -> Result<(), GitOperationError> {
        let mut args = vec!["add".to_string(), "--".to_string()];
        args.extend(sanitized(paths));
        self.op(GitOpKind::Add, &args).map(drop)
    }

    /// Commit staged changes limited to `paths` and return the new HEAD hash.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str, paths: &[&str]) -> Result<String, GitOperationError> {
        let mut args = vec!["commit".to_string(), "-m".to_string(), message.to_string()];
        if !paths.is_empty() {
            args.push("--".to_string());
            args.extend(sanitized(paths));
        }
        self.op(GitOpKind::Commit, &args)?;
        self.head_hash()
    }

    /// `git reset --mixed <rev>`: move HEAD and the index, keep the worktree.
    #[instrument(skip_all, fields(rev))]
    pub fn reset(&self, rev: &str) -> Result<(), GitOperationError> {
        self.op(GitOpKind::Reset, &strings(&["reset", "--quiet", "--mixed", rev]))
            .map(drop)
    }

    /// Restore paths (one or many) from `rev`, discarding worktree edits.
    #[instrument(skip_all, fields(rev, count = paths.len()))]
    pub fn checkout_paths(&self, rev: &str, paths: &[&str]) -> Result<(), GitOperationError> {
        let mut args = strings(&["checkout", rev, "--"]);
        args.extend(sanitized(paths));
        self.op(GitOpKind::Checkout, &args).map(drop)
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<(), GitOperationError> {
        self.op(GitOpKind::Checkout, &strings(&["checkout", branch]))
            .map(drop)
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<(), GitOperationError> {
        self.op(GitOpKind::Branch, &strings(&["checkout", "-b", branch]))
            .map(drop)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self.output(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(output.status.success())
    }

    /// Status entries, untracked files listed individually.
    pub fn status(&self) -> Result<Vec<StatusEntry>, GitOperationError> {
        let out = self.op(
            GitOpKind::Status,
            &strings(&["status", "--porcelain=v1", "-z", "-uall"]),
        )?;
        Ok(parse_status_z(&out))
    }

    pub fn head_hash(&self) -> Result<String, GitOperationError> {
        self.op(GitOpKind::HeadHash, &strings(&["rev-parse", "HEAD"]))
            .map(|out| out.trim().to_string())
    }

    /// Current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.op(
            GitOpKind::Inspect,
            &strings(&["rev-parse", "--abbrev-ref", "HEAD"]),
        )?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    #[instrument(skip_all, fields(branch))]
    pub fn push(&self, branch: &str) -> Result<(), GitOperationError> {
        self.op(GitOpKind::Push, &strings(&["push", "-u", "origin", branch]))
            .map(drop)
    }

    /// Branch that `origin/HEAD` points at, if the remote advertises one.
    pub fn remote_default_branch(&self) -> Result<Option<String>> {
        let output = self.output(&["symbolic-ref", "--quiet", "refs/remotes/origin/HEAD"])?;
        if !output.status.success() {
            return Ok(None);
        }
        let full = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(full
            .strip_prefix("refs/remotes/origin/")
            .map(str::to_string))
    }

    /// True if `path` exists in the tree of `rev`.
    pub fn path_in_commit(&self, rev: &str, path: &str) -> Result<bool> {
        let spec = format!("{rev}:{}", sanitize_path_arg(path));
        let output = self.output(&["cat-file", "-e", &spec])?;
        Ok(output.status.success())
    }

    fn op(&self, kind: GitOpKind, args: &[String]) -> Result<String, GitOperationError> {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        execute_git_operation(kind, &self.retry, || {
            if kind.is_mutation() {
                self.limiter.acquire();
            }
            self.attempt(&argv)
        })
        .into_result(kind)
    }

    fn attempt(&self, args: &[&str]) -> Result<String, String> {
        let output = self.output(args).map_err(|err| format!("{err:#}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.trim().is_empty() {
            Err(stdout)
        } else if stdout.trim().is_empty() {
            Err(stderr.to_string())
        } else {
            Err(format!("{}\n{}", stderr.trim_end(), stdout.trim_end()))
        }
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        debug!(args = %args.join(" "), "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("LC_ALL", "C")
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| (*a).to_string()).collect()
}

fn sanitized<'a>(paths: &'a [&'a str]) -> impl Iterator<Item = String> + 'a {
    paths.iter().map(|p| sanitize_path_arg(p))
}

/// Parse `git status --porcelain=v1 -z`: NUL-terminated `XY path` records,
/// paths unquoted. A rename or copy is followed by a record holding the
/// original path.
fn parse_status_z(out: &str) -> Vec<StatusEntry> {
    let mut entries = Vec::new();
    let mut records = out.split('\0').filter(|record| !record.is_empty());
    while let Some(record) = records.next() {
        let (Some(code), Some(path)) = (record.get(..2), record.get(3..)) else {
            warn!(record, "unexpected porcelain record");
            continue;
        };
        if code.contains(['R', 'C']) {
            records.next();
        }
        entries.push(StatusEntry {
            code: code.to_string(),
            path: path.to_string(),
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn terminal_errors_are_attempted_once() {
        let calls = Cell::new(0);
        let result = execute_git_operation(GitOpKind::Commit, &fast(), || {
            calls.set(calls.get() + 1);
            Err("nothing to commit, working tree clean".to_string())
        });
        assert_eq!(calls.get(), 1);
        assert!(!result.success);
        assert_eq!(result.retries, 0);
        assert_eq!(
            result.class,
            Some(ErrorClass::Terminal(TerminalKind::NothingToCommit))
        );
        assert!(
            result
                .error
                .unwrap_or_default()
                .starts_with("git commit failed:")
        );
    }

    #[test]
    fn transient_errors_retry_up_to_budget() {
        let calls = Cell::new(0);
        let result = execute_git_operation(GitOpKind::Add, &fast(), || {
            calls.set(calls.get() + 1);
            Err("fatal: Unable to create '.git/index.lock': File exists.".to_string())
        });
        assert_eq!(calls.get(), 4);
        assert_eq!(result.retries, 3);
        assert_eq!(result.class, Some(ErrorClass::Transient));
    }

    #[test]
    fn transient_error_then_success_reports_retries() {
        let calls = Cell::new(0);
        let result = execute_git_operation(GitOpKind::Status, &fast(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err("error: could not lock config file".to_string())
            } else {
                Ok("clean".to_string())
            }
        });
        assert!(result.success);
        assert_eq!(result.retries, 2);
        assert_eq!(result.output, "clean");
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
    }

    #[test]
    fn token_bucket_waits_when_exhausted_and_refills() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, 60, start);
        assert!(bucket.try_acquire_at(start).is_ok());
        assert!(bucket.try_acquire_at(start).is_ok());
        let wait = bucket.try_acquire_at(start).unwrap_err();
        assert!(wait <= Duration::from_secs(1) && wait > Duration::ZERO);
        assert!(bucket.try_acquire_at(start + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn token_bucket_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1, 60, start);
        let later = start + Duration::from_secs(600);
        assert!(bucket.try_acquire_at(later).is_ok());
        assert!(bucket.try_acquire_at(later).is_err());
    }

    #[test]
    fn sanitize_strips_shell_metacharacters() {
        assert_eq!(sanitize_path_arg("src/a.ts; rm -rf /"), "src/a.ts rm -rf /");
        assert_eq!(sanitize_path_arg("$(whoami)`id`|x&y"), "whoamiidxy");
        assert_eq!(sanitize_path_arg("src/domain/user.ts"), "src/domain/user.ts");
    }

    #[test]
    fn parses_nul_separated_status_records() {
        let out = "?? caf\u{e9} menu.txt\0 M src/main.rs\0R  new.txt\0old.txt\0";
        let entries = parse_status_z(out);
        assert_eq!(
            entries,
            vec![
                StatusEntry {
                    code: "??".to_string(),
                    path: "caf\u{e9} menu.txt".to_string(),
                },
                StatusEntry {
                    code: " M".to_string(),
                    path: "src/main.rs".to_string(),
                },
                StatusEntry {
                    code: "R ".to_string(),
                    path: "new.txt".to_string(),
                },
            ]
        );
        assert!(entries[0].is_untracked());
    }

    #[test]
    fn status_reports_non_ascii_paths_verbatim() {
        let repo = crate::test_support::TestRepo::new().expect("repo");
        repo.write("docs/r\u{e9}sum\u{e9}.md", "x\n").expect("write");
        let entries = repo.git().status().expect("status");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "docs/r\u{e9}sum\u{e9}.md");
        assert!(repo.path().join(&entries[0].path).is_file());
    }
}
