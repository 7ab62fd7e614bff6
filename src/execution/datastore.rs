//! Datastore trait - the contract between the executor and the relational+vector store

use crate::error::Result;
use crate::execution::result::ResultSet;
use crate::query::ResolvedQuery;
use async_trait::async_trait;

/// A store that can run a resolved, read-only query.
///
/// Implementations return at most `max_rows` rows and set `truncated` when more exist.
/// Failures must be classified: connectivity problems as `PipelineError::Connection`,
/// everything else as `PipelineError::Execution`.
#[async_trait]
pub trait Datastore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, query: &ResolvedQuery, max_rows: usize) -> Result<ResultSet>;
}
