//! Allow-list + deny-list check for shell fragments before they execute.
//!
//! Every fragment handed to `sh -c` (step scripts, lint and test commands)
//! passes through [`ScriptValidator::check`] first. The deny-list runs before
//! the allow-list so a dangerous keyword is reported as such even when the
//! program itself is allowed.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Programs allowed by default as the first word of a command segment.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "npm", "npx", "yarn", "pnpm", "node", "bun", "deno", "tsc", "jest", "vitest", "eslint",
    "prettier", "cargo", "go", "python", "python3", "pytest", "make", "git", "echo", "printf",
    "test", "[", "true", "false", "exit", "grep", "cat", "ls", "pwd", "diff",
];

/// Character sequences that enable command substitution or fd tricks.
const DENIED_SEQUENCES: &[&str] = &["`", "$(", "${", "<(", ">(", "\0"];

static DENIED_KEYWORDS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("rm -rf", r"\brm\s+-[a-zA-Z]*(?:r[a-zA-Z]*f|f[a-zA-Z]*r)"),
        ("sudo", r"\bsudo\b"),
        ("su", r"(?:^|[\s;&|])su(?:\s|$)"),
        ("curl", r"\bcurl\b"),
        ("wget", r"\bwget\b"),
        ("eval", r"\beval\b"),
        ("exec", r"\bexec\b"),
        ("mkfs", r"\bmkfs"),
        ("dd", r"(?:^|[\s;&|])dd\s"),
        ("shutdown", r"\bshutdown\b"),
        ("reboot", r"\breboot\b"),
        ("chmod 777", r"\bchmod\s+(?:-R\s+)?777\b"),
        ("chown", r"\bchown\b"),
        ("/dev/", r">\s*/dev/(?:sd|nvme|disk)"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("denied keyword regex")))
    .collect()
});

/// Separators between commands. A bare `&` backgrounds a command and starts
/// a new one, so it separates too.
static SEGMENT_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&&|\|\||[;|&\n]").expect("segment split regex"));

/// fd duplication (`2>&1`, `>&2`, `<&0`) and `&>` redirects, which use `&`
/// without starting a command.
static FD_REDIRECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d*[<>]&(?:\d+|-)?|&>>?").expect("fd redirect regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptViolation {
    #[error("script is empty")]
    Empty,
    #[error("script contains disallowed character sequence {0:?}")]
    Character(String),
    #[error("script contains disallowed keyword '{0}'")]
    Keyword(String),
    #[error("command '{0}' is not in the allow-list")]
    NotAllowed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptValidator {
    allowed: BTreeSet<String>,
}

impl Default for ScriptValidator {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_COMMANDS.iter().copied())
    }
}

impl ScriptValidator {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn check(&self, script: &str) -> Result<(), ScriptViolation> {
        if script.trim().is_empty() {
            return Err(ScriptViolation::Empty);
        }
        if let Some(seq) = DENIED_SEQUENCES.iter().find(|seq| script.contains(**seq)) {
            return Err(ScriptViolation::Character((*seq).to_string()));
        }
        if let Some((name, _)) = DENIED_KEYWORDS.iter().find(|(_, re)| re.is_match(script)) {
            return Err(ScriptViolation::Keyword((*name).to_string()));
        }
        let commands = FD_REDIRECT.replace_all(script, " ");
        for segment in SEGMENT_SPLIT.split(&commands) {
            let Some(program) = program_of(segment) else {
                continue;
            };
            if !self.allowed.contains(program) {
                return Err(ScriptViolation::NotAllowed(program.to_string()));
            }
        }
        Ok(())
    }
}

/// First word of a segment, skipping `VAR=value` prefixes and any directory.
fn program_of(segment: &str) -> Option<&str> {
    let word = segment
        .split_whitespace()
        .find(|word| !is_env_assignment(word))?;
    Some(word.rsplit('/').next().unwrap_or(word))
}

fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_allowed_pipelines() {
        let validator = ScriptValidator::default();
        assert_eq!(validator.check("npm run lint && npm test"), Ok(()));
        assert_eq!(validator.check("CI=1 ./node_modules/.bin/jest --ci"), Ok(()));
        assert_eq!(validator.check("test -f src/a.ts\necho ok | grep ok"), Ok(()));
    }

    #[test]
    fn rejects_denied_keywords_before_allow_list() {
        let validator = ScriptValidator::default();
        assert_eq!(
            validator.check("echo hi; rm -rf /"),
            Err(ScriptViolation::Keyword("rm -rf".to_string()))
        );
        assert_eq!(
            validator.check("sudo npm test"),
            Err(ScriptViolation::Keyword("sudo".to_string()))
        );
    }

    #[test]
    fn rejects_command_substitution() {
        let validator = ScriptValidator::default();
        assert_eq!(
            validator.check("echo $(whoami)"),
            Err(ScriptViolation::Character("$(".to_string()))
        );
        assert!(matches!(
            validator.check("echo `id`"),
            Err(ScriptViolation::Character(_))
        ));
    }

    #[test]
    fn rejects_programs_outside_allow_list() {
        let validator = ScriptValidator::default();
        assert_eq!(
            validator.check("npm test && bash -c 'x'"),
            Err(ScriptViolation::NotAllowed("bash".to_string()))
        );
        assert_eq!(validator.check("   "), Err(ScriptViolation::Empty));
    }

    #[test]
    fn background_operator_starts_a_new_command() {
        let validator = ScriptValidator::default();
        assert_eq!(
            validator.check("true & bash -c id"),
            Err(ScriptViolation::NotAllowed("bash".to_string()))
        );
        assert_eq!(validator.check("npm test&python3 x.py &"), Ok(()));
    }

    #[test]
    fn fd_redirects_are_not_separators() {
        let validator = ScriptValidator::default();
        assert_eq!(validator.check("npm test 2>&1 | grep -v warn"), Ok(()));
        assert_eq!(validator.check("echo oops >&2"), Ok(()));
        assert_eq!(validator.check("npm run lint &> lint.txt"), Ok(()));
    }

    #[test]
    fn custom_allow_list_replaces_default() {
        let validator = ScriptValidator::new(["just"]);
        assert_eq!(validator.check("just ci"), Ok(()));
        assert!(validator.check("npm test").is_err());
    }
}
