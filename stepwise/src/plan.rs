//! Plan document model.
//!
//! A plan is an ordered list of typed steps plus optional metadata and an
//! evaluation summary. The executor mutates it in place and persists it after
//! every step transition, so the model must survive `load -> mutate -> save`
//! without losing fields it does not understand.

use std::fmt;

use anyhow::{Result, anyhow};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_yaml::{Mapping, Value};

/// Key used for the step array when a plan does not name a layer.
pub const DEFAULT_STEPS_KEY: &str = "steps";

/// Log line written when a failed step is put back in the queue.
pub const REQUEUED_LOG_LINE: &str = "requeued after previous failure";
/// Prefix of the log line written when auto-fix repairs a step.
pub const AUTO_FIX_LOG_PREFIX: &str = "auto-fix applied: ";

/// Closed set of step types.
///
/// Handlers match on this exhaustively, so a new variant fails to compile until
/// every dispatch site handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    CreateFile,
    RefactorFile,
    DeleteFile,
    Folder,
    Branch,
    PullRequest,
    Validation,
    Test,
    ConditionalFile,
}

impl StepKind {
    pub const ALL: [StepKind; 9] = [
        StepKind::CreateFile,
        StepKind::RefactorFile,
        StepKind::DeleteFile,
        StepKind::Folder,
        StepKind::Branch,
        StepKind::PullRequest,
        StepKind::Validation,
        StepKind::Test,
        StepKind::ConditionalFile,
    ];

    pub fn parse(name: &str) -> Option<StepKind> {
        StepKind::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::CreateFile => "create_file",
            StepKind::RefactorFile => "refactor_file",
            StepKind::DeleteFile => "delete_file",
            StepKind::Folder => "folder",
            StepKind::Branch => "branch",
            StepKind::PullRequest => "pull_request",
            StepKind::Validation => "validation",
            StepKind::Test => "test",
            StepKind::ConditionalFile => "conditional_file",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step lifecycle. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    #[default]
    Pending,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Steps in these states are never executed again.
    pub fn is_complete(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Success => "SUCCESS",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// File operation performed by a `conditional_file` step once its guard holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Refactor,
    Delete,
}

impl FileOperation {
    pub fn step_kind(self) -> StepKind {
        match self {
            FileOperation::Create => StepKind::CreateFile,
            FileOperation::Refactor => StepKind::RefactorFile,
            FileOperation::Delete => StepKind::DeleteFile,
        }
    }
}

/// Nested, type-dependent step parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<FileOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folders: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(flatten)]
    pub extra: Mapping,
}

/// One unit of work within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub rlhf_score: Option<i8>,
    #[serde(default)]
    pub execution_log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<StepAction>,
    /// Keys this model does not interpret, written back unchanged.
    #[serde(flatten)]
    pub extra: Mapping,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            description: None,
            status: StepStatus::Pending,
            rlhf_score: None,
            execution_log: String::new(),
            path: None,
            template: None,
            branch_name: None,
            validation_script: None,
            action: None,
            extra: Mapping::new(),
        }
    }

    /// Append one line to the free-text audit trail.
    pub fn append_log(&mut self, line: impl AsRef<str>) {
        if !self.execution_log.is_empty() && !self.execution_log.ends_with('\n') {
            self.execution_log.push('\n');
        }
        self.execution_log.push_str(line.as_ref());
    }

    /// Move a pending step into a terminal state.
    pub fn transition(&mut self, to: StepStatus) -> Result<()> {
        if self.status != StepStatus::Pending {
            return Err(anyhow!(
                "step '{}' is {} and cannot move to {}",
                self.id,
                self.status,
                to
            ));
        }
        if to == StepStatus::Pending {
            return Err(anyhow!("step '{}' is already PENDING", self.id));
        }
        self.status = to;
        Ok(())
    }

    /// Record the step score. A score is written once per execution.
    pub fn record_score(&mut self, score: i8) -> Result<()> {
        if let Some(existing) = self.rlhf_score {
            return Err(anyhow!(
                "step '{}' already scored ({existing})",
                self.id
            ));
        }
        self.rlhf_score = Some(score);
        Ok(())
    }

    /// Log written since the step was last requeued or auto-fixed.
    pub fn latest_attempt_log(&self) -> &str {
        let mut start = 0;
        let mut offset = 0;
        for line in self.execution_log.split_inclusive('\n') {
            offset += line.len();
            let line = line.trim_end();
            if line == REQUEUED_LOG_LINE || line.starts_with(AUTO_FIX_LOG_PREFIX) {
                start = offset;
            }
        }
        &self.execution_log[start..]
    }

    /// Put a step back in the queue for another execution.
    pub fn reset_to_pending(&mut self) {
        self.status = StepStatus::Pending;
        self.rlhf_score = None;
    }
}

/// Optional plan metadata. Unknown keys are kept and can be used by guards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(flatten)]
    pub extra: Mapping,
}

impl Metadata {
    /// Resolve a metadata key to its string form (`None` for missing or null).
    pub fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "layer" => return self.layer.clone(),
            "architecture" => return self.architecture.clone(),
            _ => {}
        }
        scalar_to_string(self.extra.get(key)?)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        other => serde_yaml::to_string(other)
            .ok()
            .map(|s| s.trim().to_string()),
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanStatus {
    Success,
    Failed,
}

/// Evaluation summary written back into the plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    #[serde(default)]
    pub final_score: Option<f64>,
    #[serde(default)]
    pub final_status: Option<PlanStatus>,
    #[serde(default)]
    pub commit_hashes: Vec<String>,
    #[serde(flatten)]
    pub extra: Mapping,
}

/// The full workflow document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawPlan")]
pub struct Plan {
    pub metadata: Option<Metadata>,
    /// Name of the step array in the source document (`steps` or `<layer>_steps`).
    pub steps_key: String,
    pub steps: Vec<Step>,
    pub evaluation: Option<Evaluation>,
    /// Top-level keys this model does not interpret.
    pub extra: Mapping,
}

impl Default for Plan {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            metadata: None,
            steps_key: DEFAULT_STEPS_KEY.to_string(),
            steps,
            evaluation: None,
            extra: Mapping::new(),
        }
    }

    /// Plan-level layer: explicit metadata first, then a `<layer>_steps` key.
    pub fn layer(&self) -> Option<String> {
        if let Some(layer) = self.metadata.as_ref().and_then(|m| m.layer.clone()) {
            return Some(layer);
        }
        self.steps_key
            .strip_suffix("_steps")
            .filter(|prefix| !prefix.is_empty())
            .map(str::to_string)
    }

    pub fn evaluation_mut(&mut self) -> &mut Evaluation {
        self.evaluation.get_or_insert_with(Evaluation::default)
    }
}

impl Serialize for Plan {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(metadata) = &self.metadata {
            map.serialize_entry("metadata", metadata)?;
        }
        map.serialize_entry(&self.steps_key, &self.steps)?;
        for (key, value) in &self.extra {
            map.serialize_entry(key, value)?;
        }
        if let Some(evaluation) = &self.evaluation {
            map.serialize_entry("evaluation", evaluation)?;
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    evaluation: Option<Evaluation>,
    #[serde(flatten)]
    rest: Mapping,
}

impl TryFrom<RawPlan> for Plan {
    type Error = String;

    fn try_from(raw: RawPlan) -> Result<Self, Self::Error> {
        let mut rest = raw.rest;
        let step_keys: Vec<String> = rest
            .keys()
            .filter_map(Value::as_str)
            .filter(|key| *key == DEFAULT_STEPS_KEY || key.ends_with("_steps"))
            .map(str::to_string)
            .collect();

        let (steps_key, steps) = match step_keys.as_slice() {
            [] => (DEFAULT_STEPS_KEY.to_string(), Vec::new()),
            [key] => {
                let value = rest.remove(key.as_str()).unwrap_or(Value::Null);
                let steps: Vec<Step> = if value.is_null() {
                    Vec::new()
                } else {
                    serde_yaml::from_value(value).map_err(|err| format!("{key}: {err}"))?
                };
                (key.clone(), steps)
            }
            keys => {
                return Err(format!(
                    "plan declares more than one step array: {}",
                    keys.join(", ")
                ));
            }
        };

        Ok(Plan {
            metadata: raw.metadata,
            steps_key,
            steps,
            evaluation: raw.evaluation,
            extra: rest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layered_steps_key_sets_plan_layer() {
        let yaml = "domain_steps:\n  - id: a\n    type: folder\n    path: src/domain\n";
        let plan: Plan = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(plan.steps_key, "domain_steps");
        assert_eq!(plan.layer().as_deref(), Some("domain"));
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
    }

    #[test]
    fn rejects_two_step_arrays() {
        let yaml = "steps: []\ndata_steps: []\n";
        let err = serde_yaml::from_str::<Plan>(yaml).unwrap_err();
        assert!(err.to_string().contains("more than one step array"));
    }

    #[test]
    fn unknown_step_type_is_rejected() {
        let yaml = "steps:\n  - id: a\n    type: launch_rocket\n";
        assert!(serde_yaml::from_str::<Plan>(yaml).is_err());
    }

    #[test]
    fn transition_only_leaves_pending_once() {
        let mut step = Step::new("a", StepKind::Folder);
        step.transition(StepStatus::Success).expect("first transition");
        let err = step.transition(StepStatus::Failed).unwrap_err();
        assert!(err.to_string().contains("cannot move to FAILED"));
    }

    #[test]
    fn latest_attempt_log_starts_after_last_requeue() {
        let mut step = Step::new("a", StepKind::CreateFile);
        step.append_log("FAILED: ';' expected");
        step.append_log(format!("{AUTO_FIX_LOG_PREFIX}missing-semicolon"));
        step.append_log("FAILED: first try");
        step.append_log(REQUEUED_LOG_LINE);
        step.append_log("FAILED: missing JSDoc comment");
        assert_eq!(step.latest_attempt_log(), "FAILED: missing JSDoc comment");

        let fresh = Step::new("b", StepKind::Folder);
        assert_eq!(fresh.latest_attempt_log(), "");
    }

    #[test]
    fn score_is_recorded_once() {
        let mut step = Step::new("a", StepKind::Folder);
        step.record_score(1).expect("score");
        assert!(step.record_score(2).is_err());
        assert_eq!(step.rlhf_score, Some(1));
    }

    #[test]
    fn metadata_lookup_reads_extra_scalars() {
        let yaml = "layer: data\nfeature: auth\nstrict: true\n";
        let metadata: Metadata = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(metadata.lookup("layer").as_deref(), Some("data"));
        assert_eq!(metadata.lookup("feature").as_deref(), Some("auth"));
        assert_eq!(metadata.lookup("strict").as_deref(), Some("true"));
        assert_eq!(metadata.lookup("missing"), None);
    }
}
