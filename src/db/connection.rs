//! Database connection management using sqlx

use crate::error::{PipelineError, Result};
use crate::execution::error_classifier::classify_sqlx_error;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Initialize the connection pool and verify that pgvector is installed.
pub async fn init_pool(database_url: &str, acquire_timeout: Duration) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
        .map_err(classify_sqlx_error)?;

    // Test the connection
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(classify_sqlx_error)?;

    let has_vector: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'vector')")
            .fetch_one(&pool)
            .await
            .map_err(classify_sqlx_error)?;
    if !has_vector {
        return Err(PipelineError::Config(
            "the pgvector extension is not installed in this database".to_string(),
        ));
    }

    info!("Connected to PostgreSQL with pgvector");
    Ok(pool)
}
