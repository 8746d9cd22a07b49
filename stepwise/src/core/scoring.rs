//! Bounded per-step quality score and run-level aggregates.
//!
//! Scores live in `-2..=2`. A success starts at +1 and a failure at -1; the
//! layer weight multiplies that base, then gate and content deltas apply. A
//! cross-layer import forces -2 no matter what else happened.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::layer::{Layer, import_violations};
use crate::plan::{Step, StepStatus};

pub type Score = i8;

pub const MIN_SCORE: Score = -2;
pub const MAX_SCORE: Score = 2;

/// Markers counted as documentation in written content.
const DOC_MARKERS: [&str; 3] = ["/**", "///", "@description"];

/// Scoring weights, loaded from the `[scoring]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub gate_failure_penalty: i8,
    pub documentation_bonus: i8,
    pub external_import_penalty: i8,
    /// Multiplier on the base score per layer name; unlisted layers weigh 1.
    pub layer_weights: BTreeMap<String, i8>,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            gate_failure_penalty: 1,
            documentation_bonus: 1,
            external_import_penalty: 1,
            layer_weights: BTreeMap::from([("domain".to_string(), 2), ("main".to_string(), 2)]),
        }
    }
}

impl ScoringPolicy {
    pub fn weight(&self, layer: Option<Layer>) -> i8 {
        layer
            .and_then(|layer| self.layer_weights.get(layer.as_str()).copied())
            .unwrap_or(1)
    }
}

/// Observations about one executed step.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInput<'a> {
    pub succeeded: bool,
    pub skipped: bool,
    pub layer: Option<Layer>,
    /// `Some(false)` when the quality gate ran and failed.
    pub gate_passed: Option<bool>,
    /// Content the step wrote, if any.
    pub content: Option<&'a str>,
}

/// Score one step.
pub fn score_step(policy: &ScoringPolicy, input: &ScoreInput<'_>) -> Score {
    if input.skipped {
        return 0;
    }

    let base: i32 = if input.succeeded { 1 } else { -1 };
    let mut score = base * i32::from(policy.weight(input.layer));

    if input.gate_passed == Some(false) {
        score -= i32::from(policy.gate_failure_penalty);
    }

    if let Some(content) = input.content {
        if input.succeeded && DOC_MARKERS.iter().any(|m| content.contains(m)) {
            score += i32::from(policy.documentation_bonus);
        }
        if let Some(layer) = input.layer {
            let violations = import_violations(layer, content);
            if violations.iter().any(|v| v.is_cross_layer()) {
                return MIN_SCORE;
            }
            if !violations.is_empty() {
                score -= i32::from(policy.external_import_penalty);
            }
        }
    }

    clamp(score)
}

fn clamp(score: i32) -> Score {
    let clamped = score.clamp(i32::from(MIN_SCORE), i32::from(MAX_SCORE));
    Score::try_from(clamped).unwrap_or(MIN_SCORE)
}

/// Run-level aggregates: count per score bucket and a running average.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreBoard {
    buckets: BTreeMap<Score, usize>,
    total: i64,
    count: usize,
}

impl ScoreBoard {
    pub fn from_steps(steps: &[Step]) -> Self {
        let mut board = Self::default();
        for step in steps {
            if step.status != StepStatus::Pending
                && let Some(score) = step.rlhf_score
            {
                board.record(score);
            }
        }
        board
    }

    pub fn record(&mut self, score: Score) {
        *self.buckets.entry(score).or_insert(0) += 1;
        self.total += i64::from(score);
        self.count += 1;
    }

    /// Number of steps that scored exactly `score`.
    pub fn bucket(&self, score: Score) -> usize {
        self.buckets.get(&score).copied().unwrap_or(0)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.total as f64 / self.count as f64)
    }
}
