//! Conventional-commit messages derived from a step.
//!
//! Subject: `type(scope): description`, at most [`SUBJECT_MAX_CHARS`]
//! characters. The type comes from a step-kind mapping (a `None` entry means
//! the step is never committed), the scope from the first layer segment in the
//! path, and the description is enriched with the entity and role implied by
//! the file name and its folder.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::core::layer::Layer;
use crate::plan::{Step, StepKind};

pub const SUBJECT_MAX_CHARS: usize = 72;
pub const DEFAULT_SCOPE: &str = "core";
pub const GENERATED_BY: &str = "Generated by stepwise";
const ELLIPSIS: &str = "...";

/// Message settings resolved from the commit configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPolicy {
    pub conventional: bool,
    pub type_mapping: BTreeMap<StepKind, Option<String>>,
    /// Prefix the generated-by marker with a robot emoji.
    pub robot_emoji: bool,
    pub co_author: Option<String>,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            conventional: true,
            type_mapping: default_type_mapping(),
            robot_emoji: true,
            co_author: None,
        }
    }
}

impl CommitPolicy {
    /// Conventional type for `kind`, or `None` when the kind is never committed.
    pub fn commit_type(&self, kind: StepKind) -> Option<&str> {
        self.type_mapping.get(&kind).and_then(|t| t.as_deref())
    }
}

pub fn default_type_mapping() -> BTreeMap<StepKind, Option<String>> {
    let committed = |t: &str| Some(t.to_string());
    BTreeMap::from([
        (StepKind::CreateFile, committed("feat")),
        (StepKind::RefactorFile, committed("refactor")),
        (StepKind::DeleteFile, committed("chore")),
        (StepKind::Folder, committed("chore")),
        (StepKind::Test, committed("test")),
        (StepKind::Branch, None),
        (StepKind::PullRequest, None),
        (StepKind::Validation, None),
        (StepKind::ConditionalFile, None),
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    pub subject: String,
    pub body: String,
}

impl CommitMessage {
    pub fn render(&self) -> String {
        format!("{}\n\n{}", self.subject, self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitMessageError {
    #[error("commit prefix '{prefix}' leaves no room for a description within {limit} characters")]
    PrefixTooLong { prefix: String, limit: usize },
}

/// Build the commit message for `step`, executed as `kind`.
///
/// `kind` differs from `step.kind` for `conditional_file` steps, which commit
/// as the file operation they performed. Returns `Ok(None)` when the kind is
/// mapped to "do not commit".
pub fn build_commit_message(
    policy: &CommitPolicy,
    kind: StepKind,
    step: &Step,
) -> Result<Option<CommitMessage>, CommitMessageError> {
    let Some(commit_type) = policy.commit_type(kind) else {
        return Ok(None);
    };
    let path = step.path.as_deref().unwrap_or_default();

    let mut description = step
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default_description(kind, path));
    if kind != StepKind::Folder && !path.is_empty() {
        description = enrich_description(&description, path);
    }

    let subject = if policy.conventional {
        let prefix = format!("{commit_type}({}): ", scope_for_path(path));
        fit_subject(&prefix, &lowercase_first(&description))?
    } else {
        fit_subject("", &uppercase_first(&description))?
    };

    let mut body = format!("Step: {} ({})\n\n", step.id, kind);
    if policy.robot_emoji {
        body.push_str("\u{1F916} ");
    }
    body.push_str(GENERATED_BY);
    if let Some(co_author) = &policy.co_author {
        body.push_str(&format!("\n\nCo-authored-by: {co_author}"));
    }

    Ok(Some(CommitMessage { subject, body }))
}

/// Scope from the first layer segment of `path`, defaulting to `core`.
pub fn scope_for_path(path: &str) -> &'static str {
    Layer::from_path(path)
        .map(Layer::as_str)
        .unwrap_or(DEFAULT_SCOPE)
}

/// Title-cased entity from the file stem: `user-profile.ts` -> `User Profile`.
pub fn entity_name(path: &str) -> Option<String> {
    let file = Path::new(path).file_name()?.to_str()?;
    let stem = file.split('.').next().unwrap_or(file);
    let words: Vec<String> = stem
        .split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(uppercase_first)
        .collect();
    if words.is_empty() {
        return None;
    }
    Some(words.join(" "))
}

/// Role word implied by the folder that contains the file.
pub fn role_for_path(path: &str) -> Option<&'static str> {
    let folder = Path::new(path).parent()?.file_name()?.to_str()?;
    let role = match folder.to_ascii_lowercase().as_str() {
        "models" | "entities" => "entity",
        "use-cases" | "usecases" | "use_cases" => "use case",
        "repositories" => "repository",
        "controllers" => "controller",
        "components" => "component",
        "factories" => "factory",
        "adapters" => "adapter",
        "protocols" | "interfaces" => "protocol",
        _ => return None,
    };
    Some(role)
}

/// Append ` - <Entity> <role>` for the parts not already in `description`.
pub fn enrich_description(description: &str, path: &str) -> String {
    let entity = entity_name(path);
    let mut parts: Vec<String> = Vec::new();
    if let Some(entity) = &entity
        && !description.contains(entity.as_str())
    {
        parts.push(entity.clone());
    }
    if let Some(role) = role_for_path(path) {
        let lower = description.to_lowercase();
        let in_entity = entity
            .as_ref()
            .is_some_and(|e| e.to_lowercase().contains(role));
        if !lower.contains(role) && !in_entity {
            parts.push(role.to_string());
        }
    }
    if parts.is_empty() {
        return description.to_string();
    }
    format!("{description} - {}", parts.join(" "))
}

fn default_description(kind: StepKind, path: &str) -> String {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);
    match kind {
        StepKind::CreateFile | StepKind::ConditionalFile => format!("create {name}"),
        StepKind::RefactorFile => format!("refactor {name}"),
        StepKind::DeleteFile => format!("delete {name}"),
        StepKind::Folder => format!("create folder structure under {path}"),
        StepKind::Test => format!("add test {name}"),
        StepKind::Branch | StepKind::PullRequest | StepKind::Validation => {
            format!("{kind} step")
        }
    }
}

/// Join prefix and description, truncating the description with an ellipsis.
fn fit_subject(prefix: &str, description: &str) -> Result<String, CommitMessageError> {
    let prefix_len = prefix.chars().count();
    if prefix_len + description.chars().count() <= SUBJECT_MAX_CHARS {
        return Ok(format!("{prefix}{description}"));
    }
    let room = SUBJECT_MAX_CHARS
        .checked_sub(prefix_len + ELLIPSIS.len())
        .filter(|room| *room > 0)
        .ok_or_else(|| CommitMessageError::PrefixTooLong {
            prefix: prefix.to_string(),
            limit: SUBJECT_MAX_CHARS,
        })?;
    let cut: String = description.chars().take(room).collect();
    Ok(format!("{prefix}{}{ELLIPSIS}", cut.trim_end()))
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn uppercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
