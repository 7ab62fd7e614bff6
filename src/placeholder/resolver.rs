//! Placeholder Resolver
//!
//! Rewrites every placeholder of a synthesized query into
//! `<kind>Embedding <-> $n::vector < threshold`, binding the embedding as parameter `$n`.
//! Text between placeholders is copied through untouched.

use super::scanner::scan;
use crate::embedding::Embedder;
use crate::error::{PipelineError, Result};
use crate::query::{QueryParam, ResolvedQuery, SimilarityPredicate, SynthesizedQuery};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct PlaceholderResolver {
    embedder: Arc<dyn Embedder>,
    similarity_threshold: f64,
    timeout: Duration,
}

impl PlaceholderResolver {
    pub fn new(embedder: Arc<dyn Embedder>, similarity_threshold: f64, timeout: Duration) -> Self {
        Self {
            embedder,
            similarity_threshold,
            timeout,
        }
    }

    /// Resolve all placeholders. Parsing finishes before the first embedding call, so a
    /// malformed query never reaches the embedding service.
    pub async fn resolve(&self, query: &SynthesizedQuery) -> Result<ResolvedQuery> {
        let sql = query.as_str();
        let placeholders = scan(sql)?;
        info!("Resolving {} placeholder(s)", placeholders.len());

        let mut resolved_sql = String::with_capacity(sql.len());
        let mut params = Vec::with_capacity(placeholders.len());
        let mut predicates = Vec::with_capacity(placeholders.len());
        let mut copied_up_to = 0;

        for placeholder in placeholders {
            let embedding = tokio::time::timeout(self.timeout, self.embedder.embed(&placeholder.search_text))
                .await
                .map_err(|_| {
                    PipelineError::Embedding(format!(
                        "embedding '{}' timed out after {:?}",
                        placeholder.search_text, self.timeout
                    ))
                })??;

            params.push(QueryParam::Vector(embedding));
            let param_index = params.len();

            resolved_sql.push_str(&sql[copied_up_to..placeholder.span.start]);
            let span_start = resolved_sql.len();
            resolved_sql.push_str(&format!(
                "{} <-> ${}::vector < {}",
                placeholder.kind.embedding_column(),
                param_index,
                self.similarity_threshold
            ));
            copied_up_to = placeholder.span.end;

            debug!(
                "{} search '{}' bound to ${}",
                placeholder.kind, placeholder.search_text, param_index
            );
            predicates.push(SimilarityPredicate {
                kind: placeholder.kind,
                search_text: placeholder.search_text,
                param_index,
                span: span_start..resolved_sql.len(),
            });
        }
        resolved_sql.push_str(&sql[copied_up_to..]);

        Ok(ResolvedQuery {
            sql: resolved_sql,
            params,
            predicates,
        })
    }
}
