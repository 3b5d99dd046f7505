//! JSON decoding for `read_file_as_object`.
//!
//! Content is decoded strictly. When that fails, a lenient pass that strips
//! comments and trailing commas is run only to produce a better message; the
//! read fails either way.

use ghost_core::{GhostError, Result};
use serde_json::Value;

/// Decode `content` read from `path`.
pub fn parse_json(path: &str, content: &[u8]) -> Result<Value> {
    match serde_json::from_slice::<Value>(content) {
        Ok(value) => Ok(value),
        Err(strict) => Err(GhostError::invalid_json(path, diagnose(content, &strict))),
    }
}

fn diagnose(content: &[u8], strict: &serde_json::Error) -> String {
    let text = String::from_utf8_lossy(content);
    let relaxed = strip_lenient_syntax(&text);

    match serde_json::from_str::<Value>(&relaxed) {
        Ok(_) => format!(
            "{} (the file contains comments or trailing commas, which are not allowed)",
            strict
        ),
        Err(e) => format!(
            "Parse error on line {}, column {}: {}\n{}",
            e.line(),
            e.column(),
            e,
            excerpt(&relaxed, e.line())
        ),
    }
}

/// Remove `//` and `/* */` comments and commas that directly precede `}` or `]`.
fn strip_lenient_syntax(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];

        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    // Keep line numbers stable for the diagnostic.
                    if chars[i] == '\n' {
                        out.push('\n');
                    }
                    i += 1;
                }
                i += 2;
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

fn excerpt(text: &str, line: usize) -> String {
    text.lines()
        .nth(line.saturating_sub(1))
        .map(|l| format!("> {}", l.trim_end()))
        .unwrap_or_default()
}
