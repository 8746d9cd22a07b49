//! Plan invariants the YAML model cannot express on its own.

use std::collections::HashSet;

use crate::core::scoring::{MAX_SCORE, MIN_SCORE};
use crate::plan::{FileOperation, Plan, Step, StepKind, StepStatus};

/// Check plan-level invariants:
/// - Step ids are non-empty and unique
/// - `rlhf_score` stays within the score range
/// - A `PENDING` step carries no score
pub fn validate_plan(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, step) in plan.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            errors.push(format!("step #{}: id must not be empty", index + 1));
        } else if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }

        if let Some(score) = step.rlhf_score {
            if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
                errors.push(format!(
                    "{}: rlhf_score {} outside {}..={}",
                    step.id, score, MIN_SCORE, MAX_SCORE
                ));
            }
            if step.status == StepStatus::Pending {
                errors.push(format!("{}: PENDING step carries a score", step.id));
            }
        }
    }

    errors
}

/// Name of the first required field missing for the step's type.
///
/// Blank strings count as missing.
pub fn missing_field(step: &Step) -> Option<&'static str> {
    let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());

    match step.kind {
        StepKind::CreateFile | StepKind::RefactorFile => {
            if !present(&step.path) {
                return Some("path");
            }
            if !present(&step.template) {
                return Some("template");
            }
            None
        }
        StepKind::DeleteFile | StepKind::Folder => (!present(&step.path)).then_some("path"),
        StepKind::Branch => (!present(&step.branch_name)).then_some("branch_name"),
        StepKind::PullRequest => None,
        StepKind::Validation => {
            (!present(&step.validation_script)).then_some("validation_script")
        }
        StepKind::Test => {
            if present(&step.validation_script) {
                return None;
            }
            if !present(&step.path) && !present(&step.template) {
                return Some("validation_script");
            }
            if !present(&step.path) {
                return Some("path");
            }
            (!present(&step.template)).then_some("template")
        }
        StepKind::ConditionalFile => {
            let action = step.action.as_ref();
            if !action.is_some_and(|a| present(&a.condition)) {
                return Some("action.condition");
            }
            let Some(operation) = action.and_then(|a| a.operation) else {
                return Some("action.operation");
            };
            if !present(&step.path) {
                return Some("path");
            }
            match operation {
                FileOperation::Create | FileOperation::Refactor => {
                    (!present(&step.template)).then_some("template")
                }
                FileOperation::Delete => None,
            }
        }
    }
}
