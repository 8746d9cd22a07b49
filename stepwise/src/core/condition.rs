//! Guard expressions for `conditional_file` steps.
//!
//! Grammar (one comparison per guard):
//!
//! - `key` : key is present and truthy
//! - `!key` : key is missing or falsy
//! - `key == value` / `key != value` : string comparison, quotes optional
//!
//! Keys may be written with a `metadata.` prefix.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,
    #[error("condition '{0}' has no key")]
    MissingKey(String),
}

/// Evaluate `expr` using `lookup` to resolve keys.
pub fn evaluate<F>(expr: &str, lookup: F) -> Result<bool, ConditionError>
where
    F: Fn(&str) -> Option<String>,
{
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ConditionError::Empty);
    }

    for (op, negate) in [("!=", true), ("==", false)] {
        if let Some((key, value)) = expr.split_once(op) {
            let key = normalize_key(key, expr)?;
            let expected = unquote(value.trim());
            let equal = lookup(key).is_some_and(|actual| actual == expected);
            return Ok(equal != negate);
        }
    }

    if let Some(key) = expr.strip_prefix('!') {
        let key = normalize_key(key, expr)?;
        return Ok(!is_truthy(lookup(key)));
    }
    let key = normalize_key(expr, expr)?;
    Ok(is_truthy(lookup(key)))
}

fn normalize_key<'a>(key: &'a str, expr: &str) -> Result<&'a str, ConditionError> {
    let key = key.trim();
    let key = key.strip_prefix("metadata.").unwrap_or(key);
    if key.is_empty() {
        return Err(ConditionError::MissingKey(expr.to_string()));
    }
    Ok(key)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn is_truthy(value: Option<String>) -> bool {
    match value {
        None => false,
        Some(v) => !matches!(v.trim(), "" | "false" | "0" | "no"),
    }
}
