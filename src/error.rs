use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Placeholder parse error: {0}")]
    PlaceholderParse(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Execution error: {0}")]
    Execution(String),

    /// Connectivity failure talking to the datastore. The only error the executor retries.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Transient failures are worth one more attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline stage a request failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validation,
    QuerySynthesis,
    PlaceholderResolution,
    Execution,
    AnswerSynthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Validation => write!(f, "request validation"),
            Stage::QuerySynthesis => write!(f, "query synthesis"),
            Stage::PlaceholderResolution => write!(f, "placeholder resolution"),
            Stage::Execution => write!(f, "query execution"),
            Stage::AnswerSynthesis => write!(f, "answer synthesis"),
        }
    }
}

/// A failed request: which stage broke and why.
#[derive(Error, Debug)]
#[error("{stage} failed for request {request_id}: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    pub request_id: String,
    #[source]
    pub error: PipelineError,
}
