//! Run configuration stored under `.stepwise/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::commit_message::{CommitPolicy, default_type_mapping};
use crate::core::script_guard::{DEFAULT_ALLOWED_COMMANDS, ScriptValidator};
use crate::core::scoring::ScoringPolicy;
use crate::plan::StepKind;

pub const DEFAULT_CONFIG_PATH: &str = ".stepwise/config.toml";

/// Type-mapping values that mean "never commit this step type".
const NO_COMMIT: [&str; 2] = ["none", ""];

static CO_AUTHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^<>]+ <[^@\s<>]+@[^@\s<>]+>$").expect("co-author regex"));

/// Run configuration (TOML).
///
/// Loaded once per run and immutable afterwards. Missing tables and keys take
/// the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    pub commit: CommitConfig,
    pub git: GitConfig,
    pub quality: QualityConfig,
    pub safety: SafetyConfig,
    pub scoring: ScoringPolicy,
    pub scripts: ScriptsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommitConfig {
    pub enabled: bool,
    /// `Name <email>` trailer appended to every commit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co_author: Option<String>,
    /// Ask before running on a dirty tree (otherwise warn and wait).
    pub interactive_safety: bool,
    pub quality_checks: QualityChecks,
    pub conventional_commits: ConventionalCommits,
    pub emoji: EmojiConfig,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            co_author: None,
            interactive_safety: true,
            quality_checks: QualityChecks::default(),
            conventional_commits: ConventionalCommits::default(),
            emoji: EmojiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QualityChecks {
    pub lint: bool,
    pub test: bool,
    pub lint_command: String,
    pub test_command: String,
}

impl Default for QualityChecks {
    fn default() -> Self {
        Self {
            lint: true,
            test: true,
            lint_command: "npm run lint".to_string(),
            test_command: "npm test".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConventionalCommits {
    pub enabled: bool,
    /// Step type -> commit type overrides, merged over the built-in table.
    pub type_mapping: BTreeMap<String, String>,
}

impl Default for ConventionalCommits {
    fn default() -> Self {
        Self {
            enabled: true,
            type_mapping: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmojiConfig {
    pub enabled: bool,
    pub robot: bool,
}

impl Default for EmojiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            robot: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub max_retries: u32,
    /// Linear backoff base: attempt `n` waits `base_delay_ms * n`.
    pub base_delay_ms: u64,
    pub rate_limit_capacity: u32,
    pub rate_limit_per_minute: u32,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            rate_limit_capacity: 10,
            rate_limit_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QualityConfig {
    pub timeout_secs: u64,
    /// Captured output kept for display and the step log.
    pub output_lines: usize,
    pub script_timeout_secs: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5 * 60,
            output_lines: 10,
            script_timeout_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SafetyConfig {
    pub non_interactive_delay_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            non_interactive_delay_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptsConfig {
    pub allowed_commands: Vec<String>,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            allowed_commands: DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.quality.timeout_secs == 0 {
            return Err(anyhow!("quality.timeout_secs must be > 0"));
        }
        if self.quality.script_timeout_secs == 0 {
            return Err(anyhow!("quality.script_timeout_secs must be > 0"));
        }
        if self.quality.output_lines == 0 {
            return Err(anyhow!("quality.output_lines must be > 0"));
        }
        if self.git.rate_limit_capacity == 0 {
            return Err(anyhow!("git.rate_limit_capacity must be > 0"));
        }
        if self.git.rate_limit_per_minute == 0 {
            return Err(anyhow!("git.rate_limit_per_minute must be > 0"));
        }
        if let Some(co_author) = &self.commit.co_author
            && !CO_AUTHOR.is_match(co_author.trim())
        {
            return Err(anyhow!(
                "commit.co_author must look like 'Name <email>', got '{co_author}'"
            ));
        }
        let checks = &self.commit.quality_checks;
        if checks.lint && checks.lint_command.trim().is_empty() {
            return Err(anyhow!("commit.quality_checks.lint_command must not be empty"));
        }
        if checks.test && checks.test_command.trim().is_empty() {
            return Err(anyhow!("commit.quality_checks.test_command must not be empty"));
        }
        for key in self.commit.conventional_commits.type_mapping.keys() {
            if StepKind::parse(key).is_none() {
                return Err(anyhow!(
                    "commit.conventional_commits.type_mapping: unknown step type '{key}'"
                ));
            }
        }
        if self.scripts.allowed_commands.is_empty() {
            return Err(anyhow!("scripts.allowed_commands must not be empty"));
        }
        Ok(())
    }

    /// Commit message policy with type-mapping overrides applied.
    pub fn commit_policy(&self) -> CommitPolicy {
        let mut type_mapping = default_type_mapping();
        for (key, value) in &self.commit.conventional_commits.type_mapping {
            let Some(kind) = StepKind::parse(key) else {
                continue;
            };
            let value = value.trim();
            let commit_type = if NO_COMMIT.contains(&value.to_ascii_lowercase().as_str()) {
                None
            } else {
                Some(value.to_string())
            };
            type_mapping.insert(kind, commit_type);
        }
        CommitPolicy {
            conventional: self.commit.conventional_commits.enabled,
            type_mapping,
            robot_emoji: self.commit.emoji.enabled && self.commit.emoji.robot,
            co_author: self.commit.co_author.as_ref().map(|c| c.trim().to_string()),
        }
    }

    pub fn script_validator(&self) -> ScriptValidator {
        ScriptValidator::new(self.scripts.allowed_commands.iter().cloned())
    }

    pub fn quality_timeout(&self) -> Duration {
        Duration::from_secs(self.quality.timeout_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.quality.script_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
