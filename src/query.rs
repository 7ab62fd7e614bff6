//! Query types flowing between pipeline stages.

use crate::error::{PipelineError, Result};
use crate::placeholder::PlaceholderKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::OnceLock;

/// Vector embedding of a search text.
pub type Embedding = Vec<f32>;

fn business_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static pattern"))
}

/// Tenant identifier. Restricted to a safe alphabet so it can be quoted into prompts and
/// compared with SQL literals verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BusinessId(String);

impl BusinessId {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if !business_id_pattern().is_match(trimmed) {
            return Err(PipelineError::InvalidRequest(format!(
                "business id '{}' must be 1-64 characters of letters, digits, '_' or '-'",
                raw
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BusinessId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BusinessId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// SQL text produced by the language model, possibly containing placeholder tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedQuery(String);

impl SynthesizedQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SynthesizedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value bound to a `$n` parameter of a resolved query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Vector(Embedding),
}

impl QueryParam {
    /// pgvector's text input format: `[0.1,0.2,0.3]`.
    pub fn vector_literal(vector: &[f32]) -> String {
        let parts: Vec<String> = vector.iter().map(|v| v.to_string()).collect();
        format!("[{}]", parts.join(","))
    }

    fn summary(&self) -> String {
        match self {
            QueryParam::Vector(vector) => format!("vector({})", vector.len()),
        }
    }
}

/// One substituted similarity condition.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityPredicate {
    pub kind: PlaceholderKind,
    pub search_text: String,
    /// 1-based index of the bound embedding parameter.
    pub param_index: usize,
    /// Byte range of the substituted condition in the resolved SQL.
    pub span: Range<usize>,
}

/// Fully concrete query: no placeholders left, embeddings carried as bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub predicates: Vec<SimilarityPredicate>,
}

impl ResolvedQuery {
    /// Human readable parameter listing for logs and dry runs.
    pub fn describe_params(&self) -> Vec<String> {
        self.params
            .iter()
            .enumerate()
            .map(|(i, p)| format!("${} = {}", i + 1, p.summary()))
            .collect()
    }
}
