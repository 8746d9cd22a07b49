//! Interactive confirmation.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};

pub trait Prompt {
    /// Ask a yes/no question. `default` is used for an empty answer.
    fn confirm(&self, question: &str, default: bool) -> Result<bool>;
}

/// Reads answers from stdin, writes the question to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let mut stderr = io::stderr();
        write!(stderr, "{question} {hint} ").context("write prompt")?;
        stderr.flush().context("flush prompt")?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("read answer")?;
        Ok(parse_answer(&answer, default))
    }
}

fn parse_answer(answer: &str, default: bool) -> bool {
    match answer.trim().to_ascii_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    }
}
