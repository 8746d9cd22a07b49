//! Best-effort repair of failed steps.
//!
//! An ordered table of `(pattern, fixer)` rules is matched against the log of
//! a failed step's latest attempt. The first matching rule wins. A fixer is a pure
//! function from the failed step to a repaired copy; rules that need a human
//! return a reason instead.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::commit_message::entity_name;
use crate::core::layer::{Layer, imported_modules, is_external_module};
use crate::core::refactor::balance_markers;
use crate::plan::{AUTO_FIX_LOG_PREFIX, Step, StepStatus};

type Fixer = fn(&Step) -> Result<Step, String>;

pub struct FixRule {
    pub name: &'static str,
    pattern: Regex,
    fix: Fixer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    /// Step repaired and requeued as `PENDING`.
    Fixed { rule: &'static str, step: Step },
    NeedsManual { rule: Option<&'static str>, reason: String },
}

static RULES: LazyLock<Vec<FixRule>> = LazyLock::new(|| {
    let rules: [(&'static str, &str, Fixer); 7] = [
        (
            "missing-semicolon",
            r"(?i)';' expected|missing semicolon",
            fix_missing_semicolons,
        ),
        (
            "external-dependency-in-domain",
            r"(?i)external dependency|domain layer.*import",
            fix_external_imports,
        ),
        (
            "malformed-refactor-markers",
            r"(?i)refactor marker",
            fix_refactor_markers,
        ),
        ("branch-already-exists", r"(?i)already exists", |step| Ok(step.clone())),
        (
            "uncommitted-changes",
            r"(?i)uncommitted changes|would be overwritten",
            |_| Err("commit or stash local changes, then rerun".to_string()),
        ),
        (
            "missing-mock-data",
            r"(?i)mock\S*\s.*(?:missing|not found|undefined)",
            |_| Err("add the missing mock data to the test fixtures".to_string()),
        ),
        (
            "missing-documentation",
            r"(?i)missing (?:jsdoc|documentation)",
            fix_missing_documentation,
        ),
    ];
    rules
        .into_iter()
        .map(|(name, pattern, fix)| FixRule {
            name,
            pattern: Regex::new(pattern).expect("auto-fix pattern"),
            fix,
        })
        .collect()
});

/// Rule names in match order.
pub fn rule_names() -> Vec<&'static str> {
    RULES.iter().map(|r| r.name).collect()
}

/// Try to repair one `FAILED` step.
pub fn auto_fix(step: &Step) -> FixOutcome {
    if step.status != StepStatus::Failed {
        return FixOutcome::NeedsManual {
            rule: None,
            reason: format!("step is {}, not FAILED", step.status),
        };
    }
    let Some(rule) = RULES.iter().find(|r| r.pattern.is_match(step.latest_attempt_log())) else {
        return FixOutcome::NeedsManual {
            rule: None,
            reason: "no known error pattern in execution log".to_string(),
        };
    };

    match (rule.fix)(step) {
        Ok(mut fixed) => {
            fixed.reset_to_pending();
            fixed.append_log(format!("{AUTO_FIX_LOG_PREFIX}{}", rule.name));
            FixOutcome::Fixed {
                rule: rule.name,
                step: fixed,
            }
        }
        Err(reason) => FixOutcome::NeedsManual {
            rule: Some(rule.name),
            reason,
        },
    }
}

fn template_of(step: &Step) -> Result<&str, String> {
    step.template
        .as_deref()
        .ok_or_else(|| "step has no template to fix".to_string())
}

fn with_template(step: &Step, template: String) -> Result<Step, String> {
    if step.template.as_deref() == Some(template.as_str()) {
        return Err("no mechanical change applies to the template".to_string());
    }
    let mut fixed = step.clone();
    fixed.template = Some(template);
    Ok(fixed)
}

fn fix_missing_semicolons(step: &Step) -> Result<Step, String> {
    let template = template_of(step)?;
    let mut out: Vec<String> = Vec::new();
    for line in template.lines() {
        out.push(if needs_semicolon(line) {
            format!("{line};")
        } else {
            line.to_string()
        });
    }
    with_template(step, rejoin(template, &out))
}

/// Statement lines: not blank, not a comment, not ending in a terminator or
/// an opening or continuation token.
fn needs_semicolon(line: &str) -> bool {
    let trimmed = line.trim_end();
    let start = trimmed.trim_start();
    if start.is_empty() || ["//", "/*", "*", "@"].iter().any(|p| start.starts_with(p)) {
        return false;
    }
    let Some(last) = trimmed.chars().last() else {
        return false;
    };
    if matches!(last, ';' | '{' | '}' | '(' | '[' | ',' | ':' | '>' | '=' | '+' | '-' | '|' | '&' | '.' | '?') {
        return false;
    }
    !["if", "else", "for", "while", "switch", "class", "interface", "function"]
        .iter()
        .any(|kw| start.starts_with(&format!("{kw} ")) || start == *kw)
}

fn fix_external_imports(step: &Step) -> Result<Step, String> {
    let in_domain = step.path.as_deref().and_then(Layer::from_path) == Some(Layer::Domain);
    if !in_domain {
        return Err("step does not write to the domain layer".to_string());
    }
    let template = template_of(step)?;
    let kept: Vec<String> = template
        .lines()
        .filter(|line| {
            imported_modules(line)
                .iter()
                .all(|module| !is_external_module(module))
        })
        .map(str::to_string)
        .collect();
    with_template(step, rejoin(template, &kept))
}

fn fix_refactor_markers(step: &Step) -> Result<Step, String> {
    let template = template_of(step)?;
    let fixed = balance_markers(template)
        .ok_or_else(|| "refactor markers cannot be balanced without guessing".to_string())?;
    with_template(step, fixed)
}

fn fix_missing_documentation(step: &Step) -> Result<Step, String> {
    let template = template_of(step)?;
    let entity = step
        .path
        .as_deref()
        .and_then(entity_name)
        .unwrap_or_else(|| "Module".to_string());
    let mut lines: Vec<String> = template.lines().map(str::to_string).collect();
    let Some(index) = lines
        .iter()
        .position(|line| line.trim_start().starts_with("export"))
    else {
        return Err("no export to document".to_string());
    };
    let indent: String = lines[index]
        .chars()
        .take_while(|c| c.is_whitespace())
        .collect();
    lines.insert(index, format!("{indent}/**\n{indent} * {entity}\n{indent} */"));
    with_template(step, rejoin(template, &lines))
}

fn rejoin(original: &str, lines: &[String]) -> String {
    let mut out = lines.join("\n");
    if original.ends_with('\n') {
        out.push('\n');
    }
    out
}
