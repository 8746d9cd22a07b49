//! Step Executor: runs a plan's pending steps in order and stops at the first
//! failure.
//!
//! Per step: snapshot, dispatch, quality gate (file-mutating steps only),
//! commit, score, persist. A failure rolls the repository back to the snapshot,
//! marks the step `FAILED`, and persists the plan before the run ends. The plan
//! is saved after every status transition so a rerun resumes where this one
//! stopped.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::core::commit_message::{CommitPolicy, build_commit_message};
use crate::core::layer::Layer;
use crate::core::scoring::{ScoreBoard, ScoreInput, score_step};
use crate::core::script_guard::ScriptValidator;
use crate::core::selector::{is_finished, next_pending, requeue_failed};
use crate::core::summary::RunSummary;
use crate::core::types::tail_lines;
use crate::dispatch::{DispatchContext, StepEffect, StepJournal, dispatch};
use crate::error::StepError;
use crate::exit_codes;
use crate::io::audit::AuditLog;
use crate::io::config::RunnerConfig;
use crate::io::git::{Git, GitOperationError};
use crate::io::plan_store::{load_plan, save_plan};
use crate::io::prompt::Prompt;
use crate::io::pull_request::PullRequestOpener;
use crate::io::quality_gate::{GateRequest, QualityGate};
use crate::io::rollback::{Protected, RollbackReport, StepSnapshot, rollback, snapshot};
use crate::io::safety::{SafetyMode, check_working_tree};
use crate::io::signals::CancelToken;
use crate::plan::{Plan, PlanStatus, Step, StepStatus};

/// Directory for config and the audit log; never touched by rollback.
pub const STATE_DIR: &str = ".stepwise/";

/// Inputs for one `stepwise run`.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Repository root; step paths are relative to it.
    pub root: PathBuf,
    pub plan_path: PathBuf,
    pub config: RunnerConfig,
    pub safety: SafetyMode,
    pub cancel: CancelToken,
}

/// External collaborators, injected so tests can script them.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub gate: &'a dyn QualityGate,
    pub opener: &'a dyn PullRequestOpener,
    pub prompt: &'a dyn Prompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed { step: String, error: String },
    Interrupted { exit_code: i32 },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: RunSummary,
    /// Plan as persisted at the end of the run.
    pub plan: Plan,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Completed => exit_codes::OK,
            RunOutcome::Failed { .. } => exit_codes::GENERAL,
            RunOutcome::Interrupted { exit_code } => exit_code,
        }
    }
}

/// Execute every pending step of the plan at `request.plan_path`.
///
/// Errors are reserved for problems outside any step (unreadable plan,
/// declined safety prompt, failed save); step failures are reported through
/// [`RunOutcome::Failed`].
#[instrument(skip_all, fields(plan = %request.plan_path.display()))]
pub fn run_plan(
    request: &RunRequest,
    deps: Collaborators<'_>,
    audit: &mut AuditLog,
) -> Result<RunReport> {
    let mut plan = load_plan(&request.plan_path)?;
    if plan.steps.is_empty() {
        info!("plan has no steps");
        return Ok(RunReport {
            outcome: RunOutcome::Completed,
            summary: RunSummary::from_plan(&plan),
            plan,
        });
    }
    let original = plan.clone();

    let requeued = requeue_failed(&mut plan);
    if !requeued.is_empty() {
        info!(count = requeued.len(), "requeued failed steps");
        audit.record("steps_requeued", [("steps", json!(requeued))]);
        save_plan(&request.plan_path, &plan)?;
    }

    let mut executor = Executor::new(request, deps, audit);
    if !is_finished(&plan) {
        check_working_tree(
            &executor.git,
            &executor.protected,
            request.safety,
            deps.prompt,
        )?;
        executor.audit.record(
            "run_started",
            [
                ("plan", json!(request.plan_path.display().to_string())),
                ("steps", json!(plan.steps.len())),
            ],
        );
    }

    let mut outcome = RunOutcome::Completed;
    while let Some(index) = next_pending(&plan.steps) {
        if let Some(exit_code) = request.cancel.exit_code() {
            warn!(exit_code, "run cancelled before next step");
            outcome = RunOutcome::Interrupted { exit_code };
            break;
        }
        match executor.run_step(&mut plan, index)? {
            StepResult::Done => {}
            StepResult::Failed(error) => {
                outcome = RunOutcome::Failed {
                    step: plan.steps[index].id.clone(),
                    error,
                };
                break;
            }
            StepResult::Interrupted(exit_code) => {
                outcome = RunOutcome::Interrupted { exit_code };
                break;
            }
        }
    }

    finish(&mut plan, &outcome);
    if plan != original {
        save_plan(&request.plan_path, &plan)?;
    }

    let summary = RunSummary::from_plan(&plan);
    let audit = executor.audit;
    audit.record(
        "run_finished",
        [
            ("outcome", json!(outcome_name(&outcome))),
            ("summary", json!(summary)),
        ],
    );
    audit.flush();
    Ok(RunReport {
        outcome,
        summary,
        plan,
    })
}

/// Write the evaluation block for a finished or failed run.
fn finish(plan: &mut Plan, outcome: &RunOutcome) {
    let status = match outcome {
        RunOutcome::Completed => PlanStatus::Success,
        RunOutcome::Failed { .. } => PlanStatus::Failed,
        RunOutcome::Interrupted { .. } => return,
    };
    let average = ScoreBoard::from_steps(&plan.steps).average();
    let evaluation = plan.evaluation_mut();
    evaluation.final_status = Some(status);
    evaluation.final_score = average;
}

fn outcome_name(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Completed => "completed",
        RunOutcome::Failed { .. } => "failed",
        RunOutcome::Interrupted { .. } => "interrupted",
    }
}

/// Paths the run itself writes and rollback or the safety check must ignore.
pub fn protected_paths(root: &Path, plan_path: &Path) -> Protected {
    let mut prefixes = vec![STATE_DIR.to_string()];
    if let Ok(rel) = plan_path.strip_prefix(root) {
        let rel = rel.to_string_lossy().replace('\\', "/");
        let temp = match rel.rsplit_once('/') {
            Some((dir, name)) => format!("{dir}/.{name}.tmp"),
            None => format!(".{rel}.tmp"),
        };
        prefixes.push(temp);
        prefixes.push(rel);
    }
    Protected::new(prefixes)
}

enum StepResult {
    Done,
    Failed(String),
    Interrupted(i32),
}

enum Attempt {
    Done(Completed),
    Interrupted(i32),
}

struct Completed {
    effect: StepEffect,
    gate_passed: Option<bool>,
    commit: CommitStatus,
}

enum CommitStatus {
    Committed { hash: String, subject: String },
    NothingToCommit,
    NotCommitted,
}

struct Executor<'a> {
    request: &'a RunRequest,
    deps: Collaborators<'a>,
    audit: &'a mut AuditLog,
    git: Git,
    protected: Protected,
    commit_policy: CommitPolicy,
    validator: ScriptValidator,
}

impl<'a> Executor<'a> {
    fn new(request: &'a RunRequest, deps: Collaborators<'a>, audit: &'a mut AuditLog) -> Self {
        Self {
            request,
            deps,
            audit,
            git: Git::with_config(&request.root, &request.config.git),
            protected: protected_paths(&request.root, &request.plan_path),
            commit_policy: request.config.commit_policy(),
            validator: request.config.script_validator(),
        }
    }

    fn config(&self) -> &RunnerConfig {
        &self.request.config
    }

    fn gate_request(&self, timeout: std::time::Duration) -> GateRequest {
        GateRequest {
            workdir: self.request.root.clone(),
            timeout,
            output_lines: self.config().quality.output_lines,
        }
    }

    #[instrument(skip_all, fields(step = %plan.steps[index].id))]
    fn run_step(&mut self, plan: &mut Plan, index: usize) -> Result<StepResult> {
        let step = &plan.steps[index];
        info!(kind = %step.kind, "step started");
        self.audit.record(
            "step_started",
            [("step", json!(step.id)), ("type", json!(step.kind.as_str()))],
        );

        let before = snapshot(&self.git)?;
        let mut journal = StepJournal::default();
        match self.attempt(plan, index, &mut journal) {
            Ok(Attempt::Done(completed)) => {
                self.complete(plan, index, completed)?;
                Ok(StepResult::Done)
            }
            Ok(Attempt::Interrupted(exit_code)) => {
                self.interrupt(plan, index, &before, &journal, exit_code, None)
            }
            // A signal that also reached the gate or a step script makes the
            // step fail here; the cancellation wins.
            Err(err) => match self.request.cancel.exit_code() {
                Some(exit_code) => {
                    self.interrupt(plan, index, &before, &journal, exit_code, Some(&err))
                }
                None => {
                    let message = self.fail(plan, index, &before, &journal, &err)?;
                    Ok(StepResult::Failed(message))
                }
            },
        }
    }

    /// Roll back a cancelled step and leave it `PENDING` for the next run.
    fn interrupt(
        &mut self,
        plan: &mut Plan,
        index: usize,
        before: &StepSnapshot,
        journal: &StepJournal,
        exit_code: i32,
        err: Option<&anyhow::Error>,
    ) -> Result<StepResult> {
        warn!(exit_code, error = ?err.map(|e| format!("{e:#}")), "step interrupted");
        let report = self.roll_back(before, journal);
        let step = &mut plan.steps[index];
        match err {
            Some(err) => step.append_log(format!("interrupted ({err:#}); rolled back")),
            None => step.append_log("interrupted before commit; rolled back"),
        }
        append_rollback(step, &report);
        self.audit.record(
            "step_interrupted",
            [("step", json!(step.id)), ("exit_code", json!(exit_code))],
        );
        save_plan(&self.request.plan_path, plan)?;
        Ok(StepResult::Interrupted(exit_code))
    }

    fn attempt(&self, plan: &Plan, index: usize, journal: &mut StepJournal) -> Result<Attempt> {
        let ctx = DispatchContext {
            root: &self.request.root,
            git: &self.git,
            gate: self.deps.gate,
            opener: self.deps.opener,
            validator: &self.validator,
            script_request: self.gate_request(self.config().script_timeout()),
        };
        let effect = dispatch(&ctx, plan, index, journal)?;

        let mut gate_passed = None;
        if effect.mutated {
            let request = self.gate_request(self.config().quality_timeout());
            let mut result = self.deps.gate.check(&request)?;
            for check in [&mut result.lint, &mut result.test] {
                check.output = tail_lines(&check.output, request.output_lines);
            }
            if result.any_ran() {
                gate_passed = Some(result.overall_passed);
            }
            if !result.overall_passed {
                return Err(StepError::QualityGate {
                    output: result.failure_output(),
                }
                .into());
            }
        }

        if let Some(exit_code) = self.request.cancel.exit_code() {
            return Ok(Attempt::Interrupted(exit_code));
        }

        let commit = self.commit(&plan.steps[index], &effect)?;
        Ok(Attempt::Done(Completed {
            effect,
            gate_passed,
            commit,
        }))
    }

    fn commit(&self, step: &Step, effect: &StepEffect) -> Result<CommitStatus> {
        let Some(kind) = effect.commit_kind else {
            return Ok(CommitStatus::NotCommitted);
        };
        if !self.config().commit.enabled || !effect.mutated || effect.paths.is_empty() {
            return Ok(CommitStatus::NotCommitted);
        }
        let Some(message) = build_commit_message(&self.commit_policy, kind, step)? else {
            debug!(kind = %kind, "step type is not committed");
            return Ok(CommitStatus::NotCommitted);
        };

        let paths: Vec<&str> = effect.paths.iter().map(String::as_str).collect();
        let committed = self
            .git
            .add(&paths)
            .and_then(|()| self.git.commit(&message.render(), &paths));
        match committed {
            Ok(hash) => {
                info!(hash = %hash, subject = %message.subject, "committed");
                Ok(CommitStatus::Committed {
                    hash,
                    subject: message.subject,
                })
            }
            Err(err) if err.is_nothing_to_commit() || self.unstageable(&err, effect) => {
                warn!(error = %err, "nothing to commit");
                Ok(CommitStatus::NothingToCommit)
            }
            Err(err) => Err(StepError::Git(err).into()),
        }
    }

    /// A pathspec mismatch with no file on disk: an empty folder or a deleted
    /// file git never tracked. Anything the step wrote must be committed.
    fn unstageable(&self, err: &GitOperationError, effect: &StepEffect) -> bool {
        err.is_pathspec_mismatch()
            && !effect
                .paths
                .iter()
                .any(|path| self.request.root.join(path).is_file())
    }

    fn complete(&mut self, plan: &mut Plan, index: usize, completed: Completed) -> Result<()> {
        let Completed {
            effect,
            gate_passed,
            commit,
        } = completed;
        let input = ScoreInput {
            succeeded: true,
            skipped: effect.skipped,
            layer: step_layer(plan, index),
            gate_passed,
            content: effect.content.as_deref(),
        };
        let score = score_step(&self.config().scoring, &input);
        let status = if effect.skipped {
            StepStatus::Skipped
        } else {
            StepStatus::Success
        };

        let step = &mut plan.steps[index];
        for line in &effect.log {
            step.append_log(line);
        }
        if gate_passed == Some(true) {
            step.append_log("quality gate passed");
        }
        let hash = match commit {
            CommitStatus::Committed { hash, subject } => {
                step.append_log(format!("committed {}: {subject}", short(&hash)));
                Some(hash)
            }
            CommitStatus::NothingToCommit => {
                step.append_log("nothing to commit");
                None
            }
            CommitStatus::NotCommitted => None,
        };
        step.transition(status)?;
        step.record_score(score)?;
        info!(status = %status, score, outcome = "success", "step finished");
        self.audit.record(
            "step_succeeded",
            [
                ("step", json!(step.id)),
                ("status", json!(status)),
                ("score", json!(score)),
                ("commit", json!(hash)),
            ],
        );

        if let Some(hash) = hash {
            plan.evaluation_mut().commit_hashes.push(hash);
        }
        save_plan(&self.request.plan_path, plan)
    }

    fn fail(
        &mut self,
        plan: &mut Plan,
        index: usize,
        before: &StepSnapshot,
        journal: &StepJournal,
        err: &anyhow::Error,
    ) -> Result<String> {
        let message = format!("{err:#}");
        let step_error = err.downcast_ref::<StepError>();
        error!(error = %message, "step failed");
        if let Some(StepError::ScriptRejected { script, reason }) = step_error {
            self.audit.record(
                "script_rejected",
                [
                    ("step", json!(plan.steps[index].id)),
                    ("script", json!(script)),
                    ("reason", json!(reason)),
                ],
            );
        }
        let gate_passed = match step_error {
            Some(StepError::QualityGate { .. }) => Some(false),
            _ => None,
        };

        let report = self.roll_back(before, journal);
        let input = ScoreInput {
            succeeded: false,
            layer: step_layer(plan, index),
            gate_passed,
            ..ScoreInput::default()
        };
        let score = score_step(&self.config().scoring, &input);

        let step = &mut plan.steps[index];
        step.append_log(format!("FAILED: {message}"));
        append_rollback(step, &report);
        step.transition(StepStatus::Failed)?;
        step.record_score(score)?;
        self.audit.record(
            "step_failed",
            [
                ("step", json!(step.id)),
                ("error", json!(message)),
                ("score", json!(score)),
                ("rollback_errors", json!(report.errors)),
            ],
        );
        save_plan(&self.request.plan_path, plan)?;
        Ok(message)
    }

    fn roll_back(&self, before: &StepSnapshot, journal: &StepJournal) -> RollbackReport {
        rollback(
            &self.git,
            before,
            &journal.paths,
            &journal.created_dirs,
            &self.protected,
        )
    }
}

fn append_rollback(step: &mut Step, report: &RollbackReport) {
    for action in &report.actions {
        step.append_log(format!("rollback: {action}"));
    }
    for err in &report.errors {
        step.append_log(format!("rollback error: {err}"));
    }
}

/// Layer of the step's path, falling back to the plan layer.
fn step_layer(plan: &Plan, index: usize) -> Option<Layer> {
    plan.steps[index]
        .path
        .as_deref()
        .and_then(Layer::from_path)
        .or_else(|| plan.layer().as_deref().and_then(Layer::parse))
}

fn short(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}
