//! Schema description handed to the query synthesizer.
//!
//! A built-in description of the `transactions` table is used unless a text file overrides
//! it. The CLI can also build one from `information_schema.columns`.

use crate::error::{PipelineError, Result};
use crate::execution::classify_sqlx_error;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

pub const DEFAULT_SCHEMA: &str = r#"Table transactions (one row per purchased line item):
- id: integer, primary key
- businessid: text, the business that owns the transaction
- date: date of the transaction
- vendor: text, who was paid (e.g. Amazon, Staples)
- category: text, spending category (e.g. electronics, office supplies)
- item: text, what was bought
- quantity: integer
- total: numeric, amount paid for the line item
- categoryEmbedding, vendorEmbedding, itemEmbedding: vector, embeddings of category, vendor and item. Never reference them directly; use PLACEHOLDER instead."#;

/// Load the description from `path` if given, else the built-in one.
pub fn load_schema_description(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            if text.trim().is_empty() {
                return Err(PipelineError::Config(format!(
                    "schema file {} is empty",
                    path.display()
                )));
            }
            info!("Loaded schema description from {}", path.display());
            Ok(text)
        }
        None => Ok(DEFAULT_SCHEMA.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub table: String,
    pub column: String,
    pub data_type: String,
}

/// Read column names and types for `tables` from the public schema.
pub async fn introspect(pool: &PgPool, tables: &[String]) -> Result<Vec<ColumnInfo>> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT table_name::text, column_name::text, \
                CASE WHEN data_type = 'USER-DEFINED' THEN udt_name::text ELSE data_type::text END \
         FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = ANY($1) \
         ORDER BY table_name, ordinal_position",
    )
    .bind(tables)
    .fetch_all(pool)
    .await
    .map_err(classify_sqlx_error)?;

    Ok(rows
        .into_iter()
        .map(|(table, column, data_type)| ColumnInfo {
            table,
            column,
            data_type,
        })
        .collect())
}

/// Format introspected columns in the same shape as the built-in description.
pub fn describe_columns(columns: &[ColumnInfo]) -> String {
    let mut tables: BTreeMap<&str, Vec<&ColumnInfo>> = BTreeMap::new();
    for column in columns {
        tables.entry(column.table.as_str()).or_default().push(column);
    }
    tables
        .into_iter()
        .map(|(table, columns)| {
            let lines: Vec<String> = columns
                .iter()
                .map(|c| format!("- {}: {}", c.column, c.data_type))
                .collect();
            format!("Table {}:\n{}", table, lines.join("\n"))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
