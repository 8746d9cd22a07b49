//! Typed step failures.
//!
//! Every variant is fatal for the step and the run. Retries happen below this
//! level, inside the git layer.

use thiserror::Error;

use crate::io::git::GitOperationError;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step '{step}' ({kind}) is missing required field '{field}'")]
    MissingField {
        step: String,
        kind: String,
        field: &'static str,
    },

    #[error("step '{step}' is invalid: {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("script rejected by validator ({reason}): {script}")]
    ScriptRejected { script: String, reason: String },

    #[error("script failed{}: {output}", timeout_note(.timed_out))]
    ScriptFailed { output: String, timed_out: bool },

    #[error("quality gate failed:\n{output}")]
    QualityGate { output: String },

    #[error(transparent)]
    Git(#[from] GitOperationError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn timeout_note(timed_out: &bool) -> &'static str {
    if *timed_out { " (timed out)" } else { "" }
}

impl StepError {
    pub fn invalid(step: &str, reason: impl Into<String>) -> Self {
        StepError::InvalidStep {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StepError::Io {
            context: context.into(),
            source,
        }
    }
}
