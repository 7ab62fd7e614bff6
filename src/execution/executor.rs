//! Query Executor
//!
//! Runs a resolved query against the datastore for one business. The tenant guard always
//! runs first; the datastore call is bounded by a timeout and retried once only when the
//! failure was a transient connection problem.

use crate::config::ExecutionConfig;
use crate::error::{PipelineError, Result};
use crate::execution::datastore::Datastore;
use crate::execution::result::ResultSet;
use crate::query::{BusinessId, ResolvedQuery};
use crate::security::TenantGuard;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct QueryExecutor {
    datastore: Arc<dyn Datastore>,
    guard: TenantGuard,
    config: ExecutionConfig,
}

impl QueryExecutor {
    pub fn new(datastore: Arc<dyn Datastore>, guard: TenantGuard, config: ExecutionConfig) -> Self {
        Self {
            datastore,
            guard,
            config,
        }
    }

    pub async fn execute(&self, business_id: &BusinessId, query: &ResolvedQuery) -> Result<ResultSet> {
        self.guard.check(business_id, query)?;

        let started = Instant::now();
        let result = match self.attempt(query).await {
            Err(e) if e.is_transient() && self.config.retry_transient => {
                warn!("Transient datastore failure, retrying once: {}", e);
                self.attempt(query).await
            }
            other => other,
        }?;

        info!(
            "Query on {} returned {} rows{} in {:?}",
            self.datastore.name(),
            result.row_count(),
            if result.truncated { " (truncated)" } else { "" },
            started.elapsed()
        );
        Ok(result)
    }

    async fn attempt(&self, query: &ResolvedQuery) -> Result<ResultSet> {
        tokio::time::timeout(self.config.timeout, self.datastore.fetch(query, self.config.max_rows))
            .await
            .map_err(|_| {
                PipelineError::Execution(format!("query timed out after {:?}", self.config.timeout))
            })?
    }
}
