//! Run summary derived from a plan's step states.

use serde::Serialize;

use crate::core::scoring::{MAX_SCORE, MIN_SCORE, ScoreBoard};
use crate::plan::{Plan, StepStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    /// `(score, count)` for every score in range, highest first.
    pub score_buckets: Vec<(i8, usize)>,
    pub average_score: Option<f64>,
}

impl RunSummary {
    pub fn from_plan(plan: &Plan) -> Self {
        let mut summary = RunSummary {
            total: plan.steps.len(),
            ..RunSummary::default()
        };
        for step in &plan.steps {
            match step.status {
                StepStatus::Pending => summary.pending += 1,
                StepStatus::Success => summary.success += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
            }
        }

        let board = ScoreBoard::from_steps(&plan.steps);
        summary.score_buckets = (MIN_SCORE..=MAX_SCORE)
            .rev()
            .map(|score| (score, board.bucket(score)))
            .collect();
        summary.average_score = board.average();
        summary
    }

    /// Human-readable lines for the terminal.
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "steps: {} total, {} success, {} failed, {} skipped, {} pending",
            self.total, self.success, self.failed, self.skipped, self.pending
        )];
        let buckets: Vec<String> = self
            .score_buckets
            .iter()
            .map(|(score, count)| format!("{score:+}: {count}"))
            .collect();
        lines.push(format!("scores: {}", buckets.join(", ")));
        match self.average_score {
            Some(avg) => lines.push(format!("average score: {avg:.2}")),
            None => lines.push("average score: n/a".to_string()),
        }
        lines
    }
}
