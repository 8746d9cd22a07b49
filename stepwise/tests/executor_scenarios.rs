//! End-to-end executor scenarios against real git repositories.
//!
//! Each test writes a plan into a fresh `TestRepo`, drives `run_plan` with a
//! scripted quality gate, and checks the repository and the persisted plan.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use stepwise::core::git_errors::TerminalKind;
use stepwise::io::audit::AuditLog;
use stepwise::io::plan_store::{load_plan, parse_plan, save_plan};
use stepwise::io::pull_request::PullRequestOutcome;
use stepwise::io::safety::SafetyMode;
use stepwise::io::signals::CancelToken;
use stepwise::plan::{PlanStatus, StepStatus};
use stepwise::run::{Collaborators, RunOutcome, RunReport, RunRequest, run_plan};
use stepwise::test_support::{
    RecordingOpener, ScriptedGate, ScriptedPrompt, TestRepo, fast_config,
};

const CREATE_USER: &str = r#"
metadata:
  layer: domain
steps:
  - id: create-user
    type: create_file
    path: src/domain/models/user.ts
    template: "export class User {}\n"
  - id: create-account
    type: create_file
    path: src/domain/models/account.ts
    template: "export class Account {}\n"
"#;

struct Harness {
    repo: TestRepo,
    plan_path: PathBuf,
    opener: RecordingOpener,
    prompt: ScriptedPrompt,
    cancel: CancelToken,
}

impl Harness {
    fn new(plan: &str) -> Self {
        let repo = TestRepo::new().expect("repo");
        let plan_path = repo.path().join("plan.yaml");
        fs::write(&plan_path, plan).expect("write plan");
        Self {
            repo,
            plan_path,
            opener: RecordingOpener::new(PullRequestOutcome::AlreadyExists),
            prompt: ScriptedPrompt::default(),
            cancel: CancelToken::new(),
        }
    }

    fn run(&self, gate: &ScriptedGate) -> RunReport {
        let request = RunRequest {
            root: self.repo.path().to_path_buf(),
            plan_path: self.plan_path.clone(),
            config: fast_config(),
            safety: SafetyMode::NonInteractive {
                delay: Duration::ZERO,
            },
            cancel: self.cancel.clone(),
        };
        let deps = Collaborators {
            gate,
            opener: &self.opener,
            prompt: &self.prompt,
        };
        let mut audit = AuditLog::new(100);
        run_plan(&request, deps, &mut audit).expect("run plan")
    }

    fn plan_text(&self) -> String {
        fs::read_to_string(&self.plan_path).expect("read plan")
    }
}

#[test]
fn create_file_commits_with_enriched_conventional_message() {
    let h = Harness::new(CREATE_USER);
    let before = h.repo.head().expect("head");

    let report = h.run(&ScriptedGate::passing());

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.exit_code(), 0);
    let subjects = h.repo.subjects().expect("log");
    assert_eq!(subjects[1], "feat(domain): create user.ts - User entity");
    assert_eq!(subjects[0], "feat(domain): create account.ts - Account entity");
    assert_eq!(subjects.len(), 3);

    let plan = load_plan(&h.plan_path).expect("load");
    let step = &plan.steps[0];
    assert_eq!(step.status, StepStatus::Success);
    assert_eq!(step.rlhf_score, Some(2));
    assert!(step.execution_log.contains("quality gate passed"));

    let evaluation = plan.evaluation.expect("evaluation");
    assert_eq!(evaluation.final_status, Some(PlanStatus::Success));
    assert_eq!(evaluation.final_score, Some(2.0));
    assert_eq!(evaluation.commit_hashes.len(), 2);
    assert_eq!(evaluation.commit_hashes[1], h.repo.head().expect("head"));
    assert_ne!(evaluation.commit_hashes[0], before);

    assert_eq!(h.repo.porcelain().expect("status"), "?? plan.yaml\n");
}

#[test]
fn quality_gate_failure_rolls_back_and_stops_the_run() {
    let h = Harness::new(CREATE_USER);
    let head = h.repo.head().expect("head");
    let output: Vec<String> = (1..=15).map(|n| format!("line {n}")).collect();
    let gate = ScriptedGate::failing_test(&output.join("\n"));

    let report = h.run(&gate);

    assert!(matches!(
        &report.outcome,
        RunOutcome::Failed { step, .. } if step == "create-user"
    ));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(gate.checks(), 1);
    assert_eq!(h.repo.head().expect("head"), head);
    assert!(!h.repo.path().join("src").exists());
    assert_eq!(h.repo.porcelain().expect("status"), "?? plan.yaml\n");

    let plan = load_plan(&h.plan_path).expect("load");
    let failed = &plan.steps[0];
    assert_eq!(failed.status, StepStatus::Failed);
    assert_eq!(failed.rlhf_score, Some(-2));
    let captured: Vec<&str> = failed
        .execution_log
        .lines()
        .filter(|l| l.starts_with("line "))
        .collect();
    assert_eq!(captured.len(), 10);
    assert_eq!(captured.first(), Some(&"line 6"));
    assert_eq!(captured.last(), Some(&"line 15"));
    assert!(failed.execution_log.contains("[test failed]"));

    assert_eq!(plan.steps[1].status, StepStatus::Pending);
    assert_eq!(plan.steps[1].execution_log, "");
    let evaluation = plan.evaluation.expect("evaluation");
    assert_eq!(evaluation.final_status, Some(PlanStatus::Failed));
    assert!(evaluation.commit_hashes.is_empty());
}

#[test]
fn rerun_after_failure_retries_the_failed_step() {
    let h = Harness::new(CREATE_USER);
    h.run(&ScriptedGate::failing_test("boom"));

    let report = h.run(&ScriptedGate::passing());

    assert_eq!(report.outcome, RunOutcome::Completed);
    let plan = load_plan(&h.plan_path).expect("load");
    assert!(plan.steps.iter().all(|s| s.status == StepStatus::Success));
    assert!(
        plan.steps[0]
            .execution_log
            .contains("requeued after previous failure")
    );
}

#[test]
fn completed_plan_reruns_without_mutations() {
    let h = Harness::new(CREATE_USER);
    h.run(&ScriptedGate::passing());
    let head = h.repo.head().expect("head");
    let saved = h.plan_text();

    let gate = ScriptedGate::passing();
    let report = h.run(&gate);

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(gate.checks(), 0);
    assert_eq!(h.repo.head().expect("head"), head);
    assert_eq!(h.plan_text(), saved);
}

#[test]
fn branch_step_is_idempotent() {
    let plan = "steps:\n  - id: branch\n    type: branch\n    branch_name: feature/T1\n";
    let h = Harness::new(plan);

    let first = h.run(&ScriptedGate::passing());
    assert_eq!(first.outcome, RunOutcome::Completed);
    assert_eq!(
        h.repo.git_cmd(&["rev-parse", "--abbrev-ref", "HEAD"]).expect("branch"),
        "feature/T1\n"
    );

    h.repo.git_cmd(&["checkout", "-q", "main"]).expect("checkout main");
    fs::write(&h.plan_path, plan).expect("reset plan");
    let second = h.run(&ScriptedGate::passing());

    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(
        h.repo.git_cmd(&["rev-parse", "--abbrev-ref", "HEAD"]).expect("branch"),
        "feature/T1\n"
    );
    let step = &load_plan(&h.plan_path).expect("load").steps[0];
    assert!(step.execution_log.contains("checked out existing branch feature/T1"));
}

#[test]
fn shell_metacharacters_never_reach_a_shell() {
    let repo = TestRepo::new().expect("repo");
    let git = repo.git();

    let err = git
        .add(&["src/a.ts; rm -rf /"])
        .expect_err("no such path");

    assert_eq!(err.terminal_kind(), Some(TerminalKind::PathspecMismatch));
    assert_eq!(err.retries, 0);
    assert!(err.raw.contains("src/a.ts rm -rf /"));
    assert_eq!(repo.read("README.md").expect("readme"), "hi\n");
}

#[test]
fn path_with_shell_metacharacters_fails_instead_of_going_uncommitted() {
    let plan = r#"
steps:
  - id: odd-name
    type: create_file
    path: src/domain/user(1).ts
    template: "export class User {}\n"
"#;
    let h = Harness::new(plan);
    let head = h.repo.head().expect("head");

    let report = h.run(&ScriptedGate::passing());

    assert!(matches!(report.outcome, RunOutcome::Failed { .. }));
    let step = &load_plan(&h.plan_path).expect("load").steps[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.execution_log.contains("shell metacharacters"));
    assert_eq!(h.repo.head().expect("head"), head);
    assert_eq!(h.repo.porcelain().expect("status"), "?? plan.yaml\n");
}

#[test]
fn cross_layer_import_in_domain_scores_minus_two() {
    let plan = r#"
steps:
  - id: leaky
    type: create_file
    path: src/domain/models/user.ts
    template: "import { Db } from '../../infra/db';\nexport class User {}\n"
"#;
    let h = Harness::new(plan);

    let report = h.run(&ScriptedGate::passing());

    assert_eq!(report.outcome, RunOutcome::Completed);
    let step = &load_plan(&h.plan_path).expect("load").steps[0];
    assert_eq!(step.status, StepStatus::Success);
    assert_eq!(step.rlhf_score, Some(-2));
}

#[test]
fn false_condition_skips_without_commit() {
    let plan = r#"
metadata:
  layer: data
steps:
  - id: domain-only
    type: conditional_file
    path: src/domain/models/user.ts
    template: "export class User {}\n"
    action:
      operation: create
      condition: layer == domain
"#;
    let h = Harness::new(plan);
    let head = h.repo.head().expect("head");

    let report = h.run(&ScriptedGate::passing());

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(h.repo.head().expect("head"), head);
    let step = &load_plan(&h.plan_path).expect("load").steps[0];
    assert_eq!(step.status, StepStatus::Skipped);
    assert_eq!(step.rlhf_score, Some(0));
    assert_eq!(report.summary.skipped, 1);
}

#[test]
fn missing_required_field_fails_naming_the_field() {
    let plan = "steps:\n  - id: no-path\n    type: create_file\n    template: x\n";
    let h = Harness::new(plan);

    let report = h.run(&ScriptedGate::passing());

    match &report.outcome {
        RunOutcome::Failed { step, error } => {
            assert_eq!(step, "no-path");
            assert!(error.contains("missing required field 'path'"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn cancellation_before_a_step_keeps_it_pending() {
    let h = Harness::new(CREATE_USER);
    h.cancel.cancel(130);

    let report = h.run(&ScriptedGate::passing());

    assert_eq!(report.outcome, RunOutcome::Interrupted { exit_code: 130 });
    assert_eq!(report.exit_code(), 130);
    let plan = load_plan(&h.plan_path).expect("load");
    assert!(plan.steps.iter().all(|s| s.status == StepStatus::Pending));
    assert!(plan.evaluation.is_none());
}

#[test]
fn signal_that_kills_the_gate_interrupts_instead_of_failing() {
    let h = Harness::new(CREATE_USER);
    let head = h.repo.head().expect("head");
    let gate = ScriptedGate::failing_test("Killed").cancelling(h.cancel.clone(), 130);

    let report = h.run(&gate);

    assert_eq!(report.outcome, RunOutcome::Interrupted { exit_code: 130 });
    assert_eq!(report.exit_code(), 130);
    assert_eq!(h.repo.head().expect("head"), head);
    assert!(!h.repo.path().join("src").exists());

    let plan = load_plan(&h.plan_path).expect("load");
    let step = &plan.steps[0];
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(step.rlhf_score, None);
    assert!(step.execution_log.contains("interrupted"));
    assert!(plan.evaluation.is_none());
}

#[test]
fn delete_refactor_and_folder_steps_commit_their_paths() {
    let h = Harness::new("steps: []\n");
    h.repo.write("src/app.ts", "let a = 1;\n").expect("write");
    h.repo.write("src/old.ts", "old\n").expect("write");
    h.repo
        .git_cmd(&["add", "src"])
        .and_then(|_| h.repo.git_cmd(&["commit", "-q", "-m", "chore: seed"]))
        .expect("seed");
    let plan = r#"
steps:
  - id: refactor
    type: refactor_file
    description: use const
    path: src/app.ts
    template: |
      <<<FIND>>>
      let a = 1;
      <<</FIND>>>
      <<<REPLACE>>>
      const a = 1;
      <<</REPLACE>>>
  - id: delete
    type: delete_file
    path: src/old.ts
  - id: folders
    type: folder
    path: src/presentation
    action:
      folders: [components]
"#;
    fs::write(&h.plan_path, plan).expect("write plan");

    let report = h.run(&ScriptedGate::passing());

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(h.repo.read("src/app.ts").expect("read"), "const a = 1;\n");
    assert!(!h.repo.path().join("src/old.ts").exists());
    assert!(h.repo.path().join("src/presentation/components").is_dir());
    let subjects = h.repo.subjects().expect("log");
    assert_eq!(subjects[0], "chore(core): delete old.ts - Old");
    assert_eq!(subjects[1], "refactor(core): use const - App");

    let plan = load_plan(&h.plan_path).expect("load");
    assert_eq!(plan.evaluation.expect("evaluation").commit_hashes.len(), 2);
    assert!(plan.steps[2].execution_log.contains("nothing to commit"));
}

#[test]
fn plan_round_trips_with_nested_fields() {
    let plan = parse_plan(
        r#"
metadata:
  layer: domain
  team: core
domain_steps:
  - id: pr
    type: pull_request
    status: SUCCESS
    rlhf_score: 1
    execution_log: "opened"
    action:
      source_branch: feature/T1
      target_branch: main
      title: Ship it
  - id: check
    type: validation
    validation_script: npm test
custom: kept
"#,
    )
    .expect("parse");
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("plan.yaml");

    save_plan(&path, &plan).expect("save");
    let loaded = load_plan(&path).expect("load");

    assert_eq!(loaded, plan);
    assert_eq!(loaded.steps_key, "domain_steps");
}
