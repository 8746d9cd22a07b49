//! Find/replace blocks embedded in a `refactor_file` template.
//!
//! ```text
//! <<<FIND>>>
//! old text
//! <<</FIND>>>
//! <<<REPLACE>>>
//! new text
//! <<</REPLACE>>>
//! ```
//!
//! A template holds one or more blocks. Each FIND text must occur in the target
//! file; its first occurrence is replaced.

use thiserror::Error;

pub const FIND_OPEN: &str = "<<<FIND>>>";
pub const FIND_CLOSE: &str = "<<</FIND>>>";
pub const REPLACE_OPEN: &str = "<<<REPLACE>>>";
pub const REPLACE_CLOSE: &str = "<<</REPLACE>>>";

const MARKERS: [&str; 4] = [FIND_OPEN, FIND_CLOSE, REPLACE_OPEN, REPLACE_CLOSE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefactorBlock {
    pub find: String,
    pub replace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefactorError {
    #[error("malformed refactor markers: {0}")]
    Malformed(String),
    #[error("refactor target text not found in file: {0:?}")]
    NotFound(String),
}

/// Parse every block in `template`.
pub fn parse_blocks(template: &str) -> Result<Vec<RefactorBlock>, RefactorError> {
    let mut blocks = Vec::new();
    let mut rest = template;

    loop {
        let Some(open) = rest.find(FIND_OPEN) else {
            if let Some(marker) = first_marker(rest) {
                return Err(RefactorError::Malformed(format!(
                    "unexpected {marker} outside a block"
                )));
            }
            break;
        };
        if let Some(marker) = first_marker(&rest[..open]) {
            return Err(RefactorError::Malformed(format!(
                "unexpected {marker} before {FIND_OPEN}"
            )));
        }

        let after_open = &rest[open + FIND_OPEN.len()..];
        let (find, after_find) = split_block(after_open, FIND_OPEN, FIND_CLOSE)?;

        let after_find = after_find.trim_start();
        let Some(after_replace_open) = after_find.strip_prefix(REPLACE_OPEN) else {
            return Err(RefactorError::Malformed(format!(
                "missing {REPLACE_OPEN} after {FIND_CLOSE}"
            )));
        };
        let (replace, remainder) = split_block(after_replace_open, REPLACE_OPEN, REPLACE_CLOSE)?;

        if find.is_empty() {
            return Err(RefactorError::Malformed("empty FIND block".to_string()));
        }
        blocks.push(RefactorBlock {
            find: find.to_string(),
            replace: replace.to_string(),
        });
        rest = remainder;
    }

    if blocks.is_empty() {
        return Err(RefactorError::Malformed(format!(
            "no {FIND_OPEN} block in template"
        )));
    }
    Ok(blocks)
}

/// Apply blocks in order to `content`.
pub fn apply_blocks(content: &str, blocks: &[RefactorBlock]) -> Result<String, RefactorError> {
    let mut out = content.to_string();
    for block in blocks {
        if !out.contains(&block.find) {
            return Err(RefactorError::NotFound(block.find.clone()));
        }
        out = out.replacen(&block.find, &block.replace, 1);
    }
    Ok(out)
}

/// Close unbalanced blocks where the intent is unambiguous.
///
/// Works on marker lines only. Returns `None` when the template cannot be
/// repaired without guessing content, or when it is already well formed.
pub fn balance_markers(template: &str) -> Option<String> {
    #[derive(PartialEq)]
    enum State {
        Outside,
        InFind,
        AfterFind,
        InReplace,
    }

    let mut state = State::Outside;
    let mut lines: Vec<&str> = Vec::new();
    for line in template.lines() {
        let marker = MARKERS.iter().find(|m| line.trim() == **m).copied();
        match (&state, marker) {
            (_, None) => lines.push(line),
            (State::Outside, Some(FIND_OPEN)) => {
                lines.push(line);
                state = State::InFind;
            }
            // Stray closers and replace blocks without a FIND carry no intent.
            (State::Outside, Some(_)) => {}
            (State::InFind, Some(FIND_CLOSE)) => {
                lines.push(line);
                state = State::AfterFind;
            }
            (State::InFind, Some(REPLACE_OPEN)) => {
                lines.push(FIND_CLOSE);
                lines.push(line);
                state = State::InReplace;
            }
            (State::AfterFind, Some(REPLACE_OPEN)) => {
                lines.push(line);
                state = State::InReplace;
            }
            (State::InReplace, Some(REPLACE_CLOSE)) => {
                lines.push(line);
                state = State::Outside;
            }
            (State::InReplace, Some(FIND_OPEN)) => {
                lines.push(REPLACE_CLOSE);
                lines.push(line);
                state = State::InFind;
            }
            _ => return None,
        }
    }
    match state {
        State::Outside => {}
        State::InReplace => lines.push(REPLACE_CLOSE),
        State::InFind | State::AfterFind => return None,
    }

    let mut fixed = lines.join("\n");
    if template.ends_with('\n') {
        fixed.push('\n');
    }
    if fixed == template || parse_blocks(&fixed).is_err() {
        return None;
    }
    Some(fixed)
}

fn split_block<'a>(
    text: &'a str,
    open: &str,
    close: &str,
) -> Result<(&'a str, &'a str), RefactorError> {
    let Some(end) = text.find(close) else {
        return Err(RefactorError::Malformed(format!("unclosed {open} block")));
    };
    let body = &text[..end];
    if let Some(marker) = first_marker(body) {
        return Err(RefactorError::Malformed(format!(
            "unexpected {marker} inside {open} block"
        )));
    }
    Ok((trim_block(body), &text[end + close.len()..]))
}

/// Markers usually sit on their own lines; drop the newline right after the
/// opener and right before the closer.
fn trim_block(body: &str) -> &str {
    let body = body
        .strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body);
    body.strip_suffix("\r\n")
        .or_else(|| body.strip_suffix('\n'))
        .unwrap_or(body)
}

fn first_marker(text: &str) -> Option<&'static str> {
    MARKERS
        .iter()
        .filter_map(|m| text.find(m).map(|pos| (pos, *m)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, m)| m)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "<<<FIND>>>\nexport class User {}\n<<</FIND>>>\n<<<REPLACE>>>\nexport class User {\n  id = '';\n}\n<<</REPLACE>>>\n";

    #[test]
    fn parses_and_applies_single_block() {
        let blocks = parse_blocks(TEMPLATE).expect("parse");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].find, "export class User {}");

        let out = apply_blocks("// header\nexport class User {}\n", &blocks).expect("apply");
        assert_eq!(out, "// header\nexport class User {\n  id = '';\n}\n");
    }

    #[test]
    fn parses_multiple_blocks_in_order() {
        let template = "<<<FIND>>>a<<</FIND>>><<<REPLACE>>>b<<</REPLACE>>>\n<<<FIND>>>c<<</FIND>>>\n<<<REPLACE>>>d<<</REPLACE>>>";
        let blocks = parse_blocks(template).expect("parse");
        let out = apply_blocks("a c a", &blocks).expect("apply");
        assert_eq!(out, "b d a");
    }

    #[test]
    fn unclosed_find_is_malformed() {
        let err = parse_blocks("<<<FIND>>>\nfoo\n<<<REPLACE>>>\nbar\n<<</REPLACE>>>").unwrap_err();
        assert!(matches!(err, RefactorError::Malformed(_)));
        assert!(err.to_string().contains("refactor markers"));
    }

    #[test]
    fn missing_markers_are_malformed() {
        assert!(matches!(
            parse_blocks("just text"),
            Err(RefactorError::Malformed(_))
        ));
    }

    #[test]
    fn missing_target_text_is_reported() {
        let blocks = parse_blocks(TEMPLATE).expect("parse");
        let err = apply_blocks("export class Account {}\n", &blocks).unwrap_err();
        assert!(matches!(err, RefactorError::NotFound(_)));
    }

    #[test]
    fn balance_closes_find_before_replace_and_trailing_replace() {
        let broken = "<<<FIND>>>\nold\n<<<REPLACE>>>\nnew\n";
        let fixed = balance_markers(broken).expect("fixable");
        assert_eq!(
            fixed,
            "<<<FIND>>>\nold\n<<</FIND>>>\n<<<REPLACE>>>\nnew\n<<</REPLACE>>>\n"
        );
        assert!(parse_blocks(&fixed).is_ok());
    }

    #[test]
    fn balance_refuses_to_guess_missing_replacement() {
        assert_eq!(balance_markers("<<<FIND>>>\nold\n"), None);
        assert_eq!(balance_markers(TEMPLATE), None);
    }
}
