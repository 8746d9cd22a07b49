//! Deterministic selection of the next step to run.

use crate::plan::{Plan, REQUEUED_LOG_LINE, Step, StepStatus};

/// Index of the first `PENDING` step in plan order.
///
/// Returns `None` when every step is in a terminal state.
pub fn next_pending(steps: &[Step]) -> Option<usize> {
    steps.iter().position(|s| s.status == StepStatus::Pending)
}

/// Reset steps left `FAILED` by an earlier run so they are retried.
///
/// Returns the ids that were requeued, in plan order.
pub fn requeue_failed(plan: &mut Plan) -> Vec<String> {
    let mut requeued = Vec::new();
    for step in &mut plan.steps {
        if step.status == StepStatus::Failed {
            step.reset_to_pending();
            step.append_log(REQUEUED_LOG_LINE);
            requeued.push(step.id.clone());
        }
    }
    requeued
}

/// True if no step is left to execute.
pub fn is_finished(plan: &Plan) -> bool {
    plan.steps.iter().all(|s| s.status.is_complete())
}
