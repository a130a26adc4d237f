//! `code-formatter`: language-agnostic cleanup of brace-delimited source.
//!
//! `format` re-indents by brace depth and trims trailing whitespace;
//! `minify` drops blank lines and indentation.  Braces inside string
//! literals and line comments do not affect depth.

use serde_json::Value;

use super::text_input;
use crate::config::ResolvedConfig;
use crate::error::{ModuleError, Result};
use crate::module::ExecuteOptions;

pub(super) const OPERATIONS: &[&str] = &["format", "minify"];

const DEFAULT_INDENT: usize = 4;
const MAX_INDENT: usize = 16;

pub(super) fn run(input: Value, options: &ExecuteOptions, config: &ResolvedConfig) -> Result<Value> {
    let source = text_input(input)?;
    let text = match options.operation.as_str() {
        "minify" => minify(&source),
        _ => {
            let unit = match options.param("indent", config) {
                None | Some(Value::Null) => " ".repeat(DEFAULT_INDENT),
                Some(Value::String(s)) if s == "tab" => "\t".to_owned(),
                Some(v) => match v.as_u64() {
                    Some(n) if n as usize <= MAX_INDENT => " ".repeat(n as usize),
                    _ => {
                        return Err(ModuleError::invalid_input(format!(
                            "indent must be \"tab\" or an integer up to {MAX_INDENT}, got {v}"
                        )));
                    }
                },
            };
            format(&source, &unit)
        }
    };
    Ok(Value::String(text))
}

fn format(source: &str, unit: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut depth: usize = 0;
    let mut blank_run = 0;

    for raw in source.lines() {
        let line = raw.trim();
        if line.is_empty() {
            // Collapse runs of blank lines to one.
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push('\n');
            }
            continue;
        }
        blank_run = 0;

        let (opens, closes, leading_closes) = brace_balance(line);
        let level = depth.saturating_sub(leading_closes);
        out.push_str(&unit.repeat(level));
        out.push_str(line);
        out.push('\n');
        depth = (depth + opens).saturating_sub(closes);
    }

    while out.ends_with("\n\n") {
        out.pop();
    }
    out
}

fn minify(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for line in source.lines().map(str::trim).filter(|l| !l.is_empty()) {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Count structural braces on one line: opens, closes, and the closes that
/// appear before any other code (those dedent the line itself).
fn brace_balance(line: &str) -> (usize, usize, usize) {
    let mut opens = 0;
    let mut closes = 0;
    let mut leading = 0;
    let mut seen_code = false;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => {
                quote = Some(c);
                seen_code = true;
            }
            '/' if chars.peek() == Some(&'/') => break,
            '#' if !seen_code => break,
            '{' | '[' | '(' => {
                opens += 1;
                seen_code = true;
            }
            '}' | ']' | ')' => {
                closes += 1;
                if !seen_code {
                    leading += 1;
                }
            }
            c if c.is_whitespace() => {}
            _ => seen_code = true,
        }
    }
    (opens, closes, leading)
}
