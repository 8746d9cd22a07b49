//! `stepwise validate`: static checks on a plan before anything executes.

use std::path::Path;

use anyhow::{Result, bail};

use crate::core::invariants::missing_field;
use crate::core::script_guard::ScriptValidator;
use crate::dispatch::relative_path;
use crate::io::plan_store::load_plan;
use crate::plan::{Plan, StepStatus};

/// Validation result for a plan that loaded cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub steps: usize,
    pub pending: usize,
}

/// Load the plan (invariants included) and check every pending step.
pub fn validate_plan_file(path: &Path, validator: &ScriptValidator) -> Result<ValidateOutcome> {
    let plan = load_plan(path)?;
    let problems = pending_step_problems(&plan, validator);
    if !problems.is_empty() {
        bail!("plan has invalid steps:\n- {}", problems.join("\n- "));
    }
    Ok(ValidateOutcome {
        steps: plan.steps.len(),
        pending: plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .count(),
    })
}

/// Problems that would fail a pending step at dispatch time.
pub fn pending_step_problems(plan: &Plan, validator: &ScriptValidator) -> Vec<String> {
    let mut problems = Vec::new();
    for step in plan.steps.iter().filter(|s| s.status == StepStatus::Pending) {
        if let Some(field) = missing_field(step) {
            problems.push(format!(
                "{} ({}): missing required field '{field}'",
                step.id, step.kind
            ));
            continue;
        }
        if let Some(path) = step.path.as_deref()
            && let Err(err) = relative_path(step, path)
        {
            problems.push(format!("{}: {err}", step.id));
        }
        if let Some(script) = step.validation_script.as_deref()
            && let Err(violation) = validator.check(script)
        {
            problems.push(format!("{}: script rejected: {violation}", step.id));
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Step, StepKind};

    #[test]
    fn reports_missing_fields_bad_paths_and_scripts() {
        let mut no_path = Step::new("no-path", StepKind::CreateFile);
        no_path.template = Some("x".to_string());
        let mut escape = Step::new("escape", StepKind::DeleteFile);
        escape.path = Some("../x".to_string());
        let mut script = Step::new("script", StepKind::Validation);
        script.validation_script = Some("sudo npm test".to_string());
        let mut done = Step::new("done", StepKind::CreateFile);
        done.status = StepStatus::Success;

        let plan = Plan::new(vec![no_path, escape, script, done]);
        let problems = pending_step_problems(&plan, &ScriptValidator::default());

        assert_eq!(problems.len(), 3);
        assert_eq!(
            problems[0],
            "no-path (create_file): missing required field 'path'"
        );
        assert!(problems[1].starts_with("escape: "));
        assert!(problems[2].contains("script rejected"));
    }

    #[test]
    fn valid_plan_file_counts_pending_steps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.yaml");
        std::fs::write(
            &path,
            "steps:\n  - id: a\n    type: branch\n    branch_name: feature/T1\n    status: SUCCESS\n    rlhf_score: 0\n  - id: b\n    type: validation\n    validation_script: npm test\n",
        )
        .expect("write");

        let outcome = validate_plan_file(&path, &ScriptValidator::default()).expect("valid");
        assert_eq!(outcome, ValidateOutcome { steps: 2, pending: 1 });
    }
}
