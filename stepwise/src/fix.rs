//! `stepwise fix`: auto-fix pass over the failed steps of a persisted plan.

use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::autofix::{FixOutcome, auto_fix};
use crate::io::plan_store::{load_plan, save_plan};
use crate::plan::StepStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixReport {
    /// `(step id, rule)` for every step requeued as `PENDING`.
    pub applied: Vec<(String, &'static str)>,
    /// `(step id, reason)` for steps left `FAILED`.
    pub manual: Vec<(String, String)>,
}

impl FixReport {
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "auto-fix: {} applied, {} need manual fix",
            self.applied.len(),
            self.manual.len()
        )];
        for (step, rule) in &self.applied {
            lines.push(format!("  fixed {step}: {rule}"));
        }
        for (step, reason) in &self.manual {
            lines.push(format!("  manual {step}: {reason}"));
        }
        lines
    }
}

/// Apply the first matching auto-fix rule to each `FAILED` step.
///
/// The plan is saved only when at least one step was fixed.
pub fn fix_plan(plan_path: &Path) -> Result<FixReport> {
    let mut plan = load_plan(plan_path)?;
    let mut report = FixReport::default();

    for step in plan
        .steps
        .iter_mut()
        .filter(|s| s.status == StepStatus::Failed)
    {
        match auto_fix(step) {
            FixOutcome::Fixed { rule, step: fixed } => {
                info!(step = %step.id, rule, "auto-fix applied");
                report.applied.push((step.id.clone(), rule));
                *step = fixed;
            }
            FixOutcome::NeedsManual { rule, reason } => {
                warn!(step = %step.id, rule = rule.unwrap_or("none"), reason = %reason, "needs manual fix");
                report.manual.push((step.id.clone(), reason));
            }
        }
    }

    if !report.applied.is_empty() {
        save_plan(plan_path, &plan)?;
    }
    Ok(report)
}
