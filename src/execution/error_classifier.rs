//! Error Classifier
//!
//! Sorts datastore failures into transient connection problems, which the executor may
//! retry once, and query errors, which are final.

use crate::error::PipelineError;

/// SQLSTATE classes that mean the connection, not the query, failed.
fn is_connection_sqlstate(code: &str) -> bool {
    // 08: connection exception, 57P01-57P03: server shutting down / unavailable
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

pub fn classify_sqlx_error(error: sqlx::Error) -> PipelineError {
    match error {
        sqlx::Error::Io(e) => PipelineError::Connection(format!("I/O error: {}", e)),
        sqlx::Error::Tls(e) => PipelineError::Connection(format!("TLS error: {}", e)),
        sqlx::Error::PoolTimedOut => {
            PipelineError::Connection("timed out waiting for a database connection".to_string())
        }
        sqlx::Error::WorkerCrashed => PipelineError::Connection("database worker crashed".to_string()),
        sqlx::Error::PoolClosed => PipelineError::Execution("database pool is closed".to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if is_connection_sqlstate(&code) {
                PipelineError::Connection(format!("{} (SQLSTATE {})", db.message(), code))
            } else if code.is_empty() {
                PipelineError::Execution(db.message().to_string())
            } else {
                PipelineError::Execution(format!("{} (SQLSTATE {})", db.message(), code))
            }
        }
        other => PipelineError::Execution(other.to_string()),
    }
}
