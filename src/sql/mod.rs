//! SQL text helpers on top of the `sqlparser` tokenizer.

use crate::error::{PipelineError, Result};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer};

/// Remove trailing whitespace, comments and semicolons so the statement can be embedded
/// in an outer query.
pub fn strip_trailing_trivia(sql: &str) -> Result<&str> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| PipelineError::Execution(format!("could not tokenize SQL: {}", e)))?;

    let trailing = tokens
        .iter()
        .rposition(|t| !matches!(t.token, Token::Whitespace(_) | Token::SemiColon | Token::EOF))
        .map(|last| last + 1)
        .unwrap_or(0);

    let end = match tokens.get(trailing) {
        Some(token) => byte_offset(sql, &token.location).unwrap_or(sql.len()),
        None => sql.len(),
    };
    Ok(sql[..end].trim_end())
}

/// Byte offset of a 1-based line/column (in chars) location.
fn byte_offset(sql: &str, location: &Location) -> Option<usize> {
    let line_index = usize::try_from(location.line).ok()?.checked_sub(1)?;
    let column_index = usize::try_from(location.column).ok()?.checked_sub(1)?;

    let mut line_start = 0;
    for line in sql.split('\n').take(line_index) {
        line_start += line.len() + 1;
    }
    let line = sql.get(line_start..)?;
    line.char_indices()
        .nth(column_index)
        .map(|(offset, _)| line_start + offset)
        .or_else(|| (line.chars().count() == column_index).then_some(sql.len()))
}
