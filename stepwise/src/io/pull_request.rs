//! Pull requests through the `gh` CLI.

use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, info, instrument};

use crate::io::git::Git;
use crate::io::process::run_command_with_timeout;

const GH_TIMEOUT: Duration = Duration::from_secs(120);
const FALLBACK_DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub source: String,
    pub target: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRequestOutcome {
    /// URL printed by the host.
    Created(String),
    AlreadyExists,
}

pub trait PullRequestOpener {
    /// Branch a pull request targets when the step names none.
    fn default_branch(&self) -> Result<String>;

    fn open(&self, request: &PullRequest) -> Result<PullRequestOutcome>;
}

/// Pushes the source branch and runs `gh pr create`.
///
/// The remote default branch is resolved once per instance.
#[derive(Debug)]
pub struct GhPullRequestOpener {
    git: Git,
    default_branch: OnceLock<String>,
}

impl GhPullRequestOpener {
    pub fn new(git: Git) -> Self {
        Self {
            git,
            default_branch: OnceLock::new(),
        }
    }

    fn resolve_default_branch(&self) -> Result<String> {
        if let Some(branch) = self.git.remote_default_branch()? {
            return Ok(branch);
        }
        let mut cmd = Command::new("gh");
        cmd.args([
            "repo",
            "view",
            "--json",
            "defaultBranchRef",
            "--jq",
            ".defaultBranchRef.name",
        ])
        .current_dir(self.git.workdir());
        match run_command_with_timeout(cmd, GH_TIMEOUT) {
            Ok(out) if out.succeeded() => {
                let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if !name.is_empty() {
                    return Ok(name);
                }
            }
            Ok(out) => debug!(output = %out.combined(), "gh repo view failed"),
            Err(err) => debug!(err = %err, "gh unavailable"),
        }
        Ok(FALLBACK_DEFAULT_BRANCH.to_string())
    }
}

impl PullRequestOpener for GhPullRequestOpener {
    fn default_branch(&self) -> Result<String> {
        if let Some(branch) = self.default_branch.get() {
            return Ok(branch.clone());
        }
        let branch = self.resolve_default_branch()?;
        Ok(self.default_branch.get_or_init(|| branch).clone())
    }

    #[instrument(skip_all, fields(source = %request.source, target = %request.target))]
    fn open(&self, request: &PullRequest) -> Result<PullRequestOutcome> {
        self.git.push(&request.source)?;

        let mut cmd = Command::new("gh");
        cmd.args(["pr", "create", "--base"])
            .arg(&request.target)
            .arg("--head")
            .arg(&request.source)
            .arg("--title")
            .arg(&request.title)
            .arg("--body")
            .arg(&request.body)
            .current_dir(self.git.workdir());
        let out = run_command_with_timeout(cmd, GH_TIMEOUT)?;
        let text = out.combined();
        if out.succeeded() {
            let url = text.lines().last().unwrap_or_default().trim().to_string();
            info!(url = %url, "pull request created");
            return Ok(PullRequestOutcome::Created(url));
        }
        if is_already_exists(&text) {
            info!("pull request already exists");
            return Ok(PullRequestOutcome::AlreadyExists);
        }
        bail!("gh pr create failed: {}", text.trim());
    }
}

fn is_already_exists(output: &str) -> bool {
    output.to_ascii_lowercase().contains("already exists")
}
