//! Quality gate: lint and test commands run before a step may commit.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::script_guard::ScriptValidator;
use crate::core::types::{CheckResult, QualityCheckResult, tail_lines};
use crate::error::StepError;
use crate::io::config::RunnerConfig;
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone)]
pub struct GateRequest {
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Lines of captured output kept per check.
    pub output_lines: usize,
}

pub trait QualityGate {
    /// Run the enabled lint and test commands.
    fn check(&self, request: &GateRequest) -> Result<QualityCheckResult>;

    /// Run a step's embedded script. The caller has already validated it.
    fn run_script(&self, script: &str, request: &GateRequest) -> Result<CheckResult>;
}

/// Runs commands with `sh -c` in the repository root.
#[derive(Debug, Clone)]
pub struct ShellQualityGate {
    lint_command: Option<String>,
    test_command: Option<String>,
    validator: ScriptValidator,
}

impl ShellQualityGate {
    pub fn new(
        lint_command: Option<String>,
        test_command: Option<String>,
        validator: ScriptValidator,
    ) -> Self {
        Self {
            lint_command,
            test_command,
            validator,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        let checks = &config.commit.quality_checks;
        Self::new(
            checks.lint.then(|| checks.lint_command.clone()),
            checks.test.then(|| checks.test_command.clone()),
            config.script_validator(),
        )
    }

    fn run_check(
        &self,
        label: &str,
        command: Option<&str>,
        request: &GateRequest,
    ) -> Result<CheckResult> {
        let Some(command) = command else {
            debug!(check = label, "check disabled");
            return Ok(CheckResult::skipped());
        };
        self.validator
            .check(command)
            .map_err(|violation| StepError::ScriptRejected {
                script: command.to_string(),
                reason: violation.to_string(),
            })?;
        let result = run_shell(command, request)?;
        if result.passed {
            info!(check = label, "quality check passed");
        } else {
            warn!(check = label, timed_out = result.timed_out, "quality check failed");
        }
        Ok(result)
    }
}

impl QualityGate for ShellQualityGate {
    #[instrument(skip_all)]
    fn check(&self, request: &GateRequest) -> Result<QualityCheckResult> {
        let lint = self.run_check("lint", self.lint_command.as_deref(), request)?;
        let test = self.run_check("test", self.test_command.as_deref(), request)?;
        Ok(QualityCheckResult::new(lint, test))
    }

    #[instrument(skip_all)]
    fn run_script(&self, script: &str, request: &GateRequest) -> Result<CheckResult> {
        run_shell(script, request)
    }
}

/// Run `script` under `sh -c`; nonzero exit or timeout is a failed check.
pub fn run_shell(script: &str, request: &GateRequest) -> Result<CheckResult> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(&request.workdir);
    let output = run_command_with_timeout(cmd, request.timeout)?;

    let mut text = output.combined();
    if output.timed_out {
        text.push_str(&format!(
            "\n[timed out after {}s]",
            request.timeout.as_secs()
        ));
    }
    Ok(CheckResult {
        passed: output.succeeded(),
        ran: true,
        timed_out: output.timed_out,
        output: tail_lines(&text, request.output_lines),
    })
}
