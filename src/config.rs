//! Runtime configuration loaded from the environment (and `.env` via dotenv).

use crate::error::{PipelineError, Result};
use regex::Regex;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Expected vector length; unchecked when unset.
    pub dimensions: Option<usize>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub timeout: Duration,
    pub max_rows: usize,
    pub retry_transient: bool,
}

/// Bounds on the result text handed to the answer model.
#[derive(Debug, Clone)]
pub struct AnswerConfig {
    pub max_rows: usize,
    pub max_chars: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub database_url: Option<String>,
    pub similarity_threshold: f64,
    pub tenant_column: String,
    pub execution: ExecutionConfig,
    pub answer: AnswerConfig,
    pub history_messages: usize,
    pub schema_file: Option<PathBuf>,
    pub server_addr: String,
}

impl AppConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = get("OPENAI_API_KEY").unwrap_or_default();
        let base_url = get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let llm = LlmConfig {
            api_key: api_key.clone(),
            base_url: base_url.clone(),
            model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            timeout: Duration::from_secs(parse_or(&get, "LLM_TIMEOUT_SECS", 60)?),
        };

        let embedding = EmbeddingConfig {
            api_key,
            base_url,
            model: get("EMBEDDING_MODEL").unwrap_or_else(|| "text-embedding-3-small".to_string()),
            dimensions: parse_opt(&get, "EMBEDDING_DIMENSIONS")?,
            timeout: Duration::from_secs(parse_or(&get, "EMBEDDING_TIMEOUT_SECS", 20)?),
        };

        let similarity_threshold: f64 = parse_or(&get, "SIMILARITY_THRESHOLD", DEFAULT_SIMILARITY_THRESHOLD)?;
        if !similarity_threshold.is_finite() || similarity_threshold <= 0.0 {
            return Err(PipelineError::Config(format!(
                "SIMILARITY_THRESHOLD must be a positive number, got {}",
                similarity_threshold
            )));
        }

        let tenant_column = get("TENANT_COLUMN").unwrap_or_else(|| "businessid".to_string());
        let ident = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern");
        if !ident.is_match(&tenant_column) {
            return Err(PipelineError::Config(format!(
                "TENANT_COLUMN '{}' is not a plain column name",
                tenant_column
            )));
        }

        let execution = ExecutionConfig {
            timeout: Duration::from_secs(parse_or(&get, "QUERY_TIMEOUT_SECS", 30)?),
            max_rows: parse_or(&get, "MAX_RESULT_ROWS", 200)?,
            retry_transient: parse_or(&get, "RETRY_TRANSIENT", true)?,
        };

        let answer = AnswerConfig {
            max_rows: parse_or(&get, "ANSWER_CONTEXT_ROWS", 50)?,
            max_chars: parse_or(&get, "ANSWER_CONTEXT_CHARS", 8000)?,
        };

        Ok(Self {
            llm,
            embedding,
            database_url: get("DATABASE_URL"),
            similarity_threshold,
            tenant_column,
            execution,
            answer,
            history_messages: parse_or(&get, "HISTORY_MESSAGES", 6)?,
            schema_file: get("SCHEMA_FILE").map(PathBuf::from),
            server_addr: get("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| PipelineError::Config("DATABASE_URL is not set".to_string()))
    }
}

fn parse_opt<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipelineError::Config(format!("{} has invalid value '{}': {}", key, raw, e))),
        None => Ok(None),
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}
