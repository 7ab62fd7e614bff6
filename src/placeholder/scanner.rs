//! Placeholder tokenizer.
//!
//! Walks the synthesized SQL once. String literals, quoted identifiers and comments are
//! skipped so a marker inside them is left alone. A marker is parsed as
//! `PLACEHOLDER ( kind , search text )` with balanced parentheses; the split happens at the
//! first comma that is neither escaped nor inside a quoted argument.

use super::{sanitize_search_text, Placeholder, PlaceholderKind, PLACEHOLDER_MARKER};
use crate::error::{PipelineError, Result};

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// End (exclusive byte offset) of a literal opened by `quote` at `start`.
/// Doubled quotes are escapes. `None` when the literal is unterminated.
fn quoted_end(src: &str, start: usize, quote: char) -> Option<usize> {
    let mut chars = src[start + quote.len_utf8()..].char_indices().peekable();
    while let Some((offset, c)) = chars.next() {
        if c == quote {
            if chars.peek().map(|(_, next)| *next) == Some(quote) {
                chars.next();
                continue;
            }
            return Some(start + quote.len_utf8() + offset + c.len_utf8());
        }
    }
    None
}

/// Find every placeholder in `sql`, in order of appearance.
pub fn scan(sql: &str) -> Result<Vec<Placeholder>> {
    let mut placeholders = Vec::new();
    let mut pos = 0;

    while let Some(c) = sql[pos..].chars().next() {
        let rest = &sql[pos..];

        if rest.starts_with("--") {
            pos += rest.find('\n').unwrap_or(rest.len());
        } else if rest.starts_with("/*") {
            pos += rest[2..].find("*/").map(|i| i + 4).unwrap_or(rest.len());
        } else if c == '\'' || c == '"' {
            pos = quoted_end(sql, pos, c).unwrap_or(sql.len());
        } else if c == '$' && rest[1..].starts_with(|d: char| d.is_ascii_digit()) {
            let digits = rest[1..]
                .find(|d: char| !d.is_ascii_digit())
                .unwrap_or(rest.len() - 1);
            return Err(PipelineError::PlaceholderParse(format!(
                "synthesized query already contains bind parameter {}",
                &rest[..1 + digits]
            )));
        } else if c.is_alphabetic() || c == '_' {
            let len = rest.find(|ch: char| !is_word_char(ch)).unwrap_or(rest.len());
            if rest[..len].eq_ignore_ascii_case(PLACEHOLDER_MARKER) {
                let placeholder = parse_placeholder(sql, pos, pos + len)?;
                pos = placeholder.span.end;
                placeholders.push(placeholder);
            } else {
                pos += len;
            }
        } else {
            pos += c.len_utf8();
        }
    }

    Ok(placeholders)
}

/// Parse the argument list following a marker spanning `start..marker_end`.
fn parse_placeholder(sql: &str, start: usize, marker_end: usize) -> Result<Placeholder> {
    let after_marker = &sql[marker_end..];
    let open = after_marker.len() - after_marker.trim_start().len();
    if !after_marker[open..].starts_with('(') {
        return Err(PipelineError::PlaceholderParse(format!(
            "{} at offset {} is not followed by an argument list",
            PLACEHOLDER_MARKER, start
        )));
    }

    let args_start = marker_end + open + 1;
    let mut depth = 1usize;
    let mut kind_raw: Option<String> = None;
    let mut current = String::new();
    let mut pos = args_start;

    let end = loop {
        let Some(c) = sql[pos..].chars().next() else {
            return Err(PipelineError::PlaceholderParse(format!(
                "unbalanced parentheses in placeholder starting at offset {}: {}",
                start,
                &sql[start..]
            )));
        };

        match c {
            '\\' => {
                let escaped = sql[pos + 1..].chars().next().ok_or_else(|| {
                    PipelineError::PlaceholderParse(format!(
                        "dangling escape in placeholder starting at offset {}",
                        start
                    ))
                })?;
                current.push(escaped);
                pos += 1 + escaped.len_utf8();
            }
            '\'' | '"' if current.trim().is_empty() => {
                let close = quoted_end(sql, pos, c).ok_or_else(|| {
                    PipelineError::PlaceholderParse(format!(
                        "unterminated quoted argument in placeholder starting at offset {}",
                        start
                    ))
                })?;
                current.push_str(&sql[pos..close]);
                pos = close;
            }
            '(' => {
                depth += 1;
                current.push(c);
                pos += 1;
            }
            ')' => {
                depth -= 1;
                pos += 1;
                if depth == 0 {
                    break pos;
                }
                current.push(c);
            }
            ',' if depth == 1 && kind_raw.is_none() => {
                kind_raw = Some(std::mem::take(&mut current));
                pos += 1;
            }
            _ => {
                current.push(c);
                pos += c.len_utf8();
            }
        }
    };

    let raw_text = &sql[start..end];
    let kind_raw = kind_raw.ok_or_else(|| {
        PipelineError::PlaceholderParse(format!(
            "placeholder {} needs two arguments: kind and search text",
            raw_text
        ))
    })?;
    let kind = PlaceholderKind::parse(&kind_raw)?;

    let search_text = sanitize_search_text(&current);
    if search_text.is_empty() {
        return Err(PipelineError::PlaceholderParse(format!(
            "placeholder {} has no usable search text",
            raw_text
        )));
    }

    Ok(Placeholder {
        kind,
        search_text,
        span: start..end,
    })
}
