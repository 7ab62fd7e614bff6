//! PostgreSQL + pgvector datastore

use crate::error::{PipelineError, Result};
use crate::execution::datastore::Datastore;
use crate::execution::error_classifier::classify_sqlx_error;
use crate::execution::result::ResultSet;
use crate::query::{QueryParam, ResolvedQuery};
use crate::sql::strip_trailing_trivia;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPool;
use tracing::debug;

pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Wrap `sql` so every row comes back as one JSON object with column order kept.
/// Trailing semicolons and comments are cut first. The newline before the closing
/// parenthesis keeps a `--` comment inside the statement from swallowing it.
pub fn wrap_query(sql: &str, limit_param: usize) -> Result<String> {
    let inner = strip_trailing_trivia(sql.trim_start())?;
    Ok(format!(
        "SELECT row_to_json(q)::text FROM (\n{}\n) AS q LIMIT ${}",
        inner, limit_param
    ))
}

#[async_trait]
impl Datastore for PgDatastore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn fetch(&self, query: &ResolvedQuery, max_rows: usize) -> Result<ResultSet> {
        let sql = wrap_query(&query.sql, query.params.len() + 1)?;
        debug!("Executing wrapped query: {}", sql);

        let mut statement = sqlx::query_scalar::<_, String>(&sql);
        for param in &query.params {
            statement = match param {
                QueryParam::Vector(vector) => statement.bind(QueryParam::vector_literal(vector)),
            };
        }
        let fetch_limit = i64::try_from(max_rows.saturating_add(1)).unwrap_or(i64::MAX);
        statement = statement.bind(fetch_limit);

        let raw_rows = statement
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => rows.push(map),
                other => {
                    return Err(PipelineError::Execution(format!(
                        "expected a JSON object per row, got {}",
                        other
                    )))
                }
            }
        }
        Ok(ResultSet::from_rows(rows, max_rows))
    }
}
