//! Question answering pipeline
//!
//! question -> query synthesis -> placeholder resolution -> guarded execution -> answer
//!
//! Stages run strictly in order and the first failure aborts the request. The pipeline
//! holds no per-request state, so one instance can serve concurrent tasks.

use crate::answer_synthesizer::AnswerSynthesizer;
use crate::config::AppConfig;
use crate::db::{init_pool, PgDatastore};
use crate::embedding::{Embedder, EmbeddingClient};
use crate::error::{PipelineError, Result, Stage, StageFailure};
use crate::execution::{Datastore, QueryExecutor};
use crate::llm::{ConversationHistory, LanguageModel, LlmClient};
use crate::placeholder::PlaceholderResolver;
use crate::query::{BusinessId, ResolvedQuery};
use crate::query_synthesizer::QuerySynthesizer;
use crate::schema::load_schema_description;
use crate::security::TenantGuard;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// Shown to users whenever a request fails; details only go to the log.
pub const GENERIC_FAILURE_MESSAGE: &str = "Sorry, I could not process your question.";

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub business_id: BusinessId,
    pub question: String,
    pub history: ConversationHistory,
}

impl AskRequest {
    pub fn new(business_id: BusinessId, question: impl Into<String>) -> Self {
        Self {
            business_id,
            question: question.into(),
            history: ConversationHistory::default(),
        }
    }

    pub fn with_history(mut self, history: ConversationHistory) -> Self {
        self.history = history;
        self
    }
}

pub struct Pipeline {
    synthesizer: QuerySynthesizer,
    resolver: PlaceholderResolver,
    executor: Option<QueryExecutor>,
    answerer: AnswerSynthesizer,
    schema_description: String,
}

impl Pipeline {
    /// Assemble from collaborators. Without a datastore the pipeline can still synthesize
    /// and resolve queries, but `ask` fails at the execution stage.
    pub fn new(
        config: &AppConfig,
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        datastore: Option<Arc<dyn Datastore>>,
        schema_description: String,
    ) -> Self {
        let executor = datastore.map(|store| {
            QueryExecutor::new(
                store,
                TenantGuard::new(config.tenant_column.clone()),
                config.execution.clone(),
            )
        });
        Self {
            synthesizer: QuerySynthesizer::new(llm.clone(), config.tenant_column.clone(), config.llm.timeout),
            resolver: PlaceholderResolver::new(embedder, config.similarity_threshold, config.embedding.timeout),
            executor,
            answerer: AnswerSynthesizer::new(llm, config.answer.clone(), config.llm.timeout),
            schema_description,
        }
    }

    /// Build live HTTP clients and, when `connect_db` is set, a PostgreSQL pool.
    pub async fn from_config(config: &AppConfig, connect_db: bool) -> Result<Self> {
        if config.llm.api_key.is_empty() {
            return Err(PipelineError::Config("OPENAI_API_KEY is not set".to_string()));
        }
        let llm: Arc<dyn LanguageModel> = Arc::new(LlmClient::new(&config.llm)?);
        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::new(&config.embedding)?);
        let datastore: Option<Arc<dyn Datastore>> = if connect_db {
            let pool = init_pool(config.require_database_url()?, config.execution.timeout).await?;
            Some(Arc::new(PgDatastore::new(pool)))
        } else {
            None
        };
        let schema = load_schema_description(config.schema_file.as_deref())?;
        Ok(Self::new(config, llm, embedder, datastore, schema))
    }

    /// Answer the question or report which stage failed.
    pub async fn ask(&self, request: &AskRequest) -> std::result::Result<String, StageFailure> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("ask", request_id = %request_id, business_id = %request.business_id);
        self.run(request, &request_id).instrument(span).await
    }

    /// Answer the question; any failure is logged and replaced by the generic message.
    pub async fn respond(&self, request: &AskRequest) -> String {
        match self.ask(request).await {
            Ok(answer) => answer,
            Err(failure) => {
                error!("{}", failure);
                GENERIC_FAILURE_MESSAGE.to_string()
            }
        }
    }

    /// Synthesize and resolve without executing.
    pub async fn resolve_only(&self, request: &AskRequest) -> std::result::Result<ResolvedQuery, StageFailure> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("resolve", request_id = %request_id, business_id = %request.business_id);
        async {
            validate_question(&request.question).map_err(failure(Stage::Validation, &request_id))?;
            let synthesized = self
                .synthesizer
                .synthesize(&request.business_id, &request.question, &self.schema_description, &request.history)
                .await
                .map_err(failure(Stage::QuerySynthesis, &request_id))?;
            self.resolver
                .resolve(&synthesized)
                .await
                .map_err(failure(Stage::PlaceholderResolution, &request_id))
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: &AskRequest, request_id: &str) -> std::result::Result<String, StageFailure> {
        let started = Instant::now();

        validate_question(&request.question).map_err(failure(Stage::Validation, request_id))?;
        info!("Question: {}", request.question.trim());

        let synthesized = self
            .synthesizer
            .synthesize(&request.business_id, &request.question, &self.schema_description, &request.history)
            .await
            .map_err(failure(Stage::QuerySynthesis, request_id))?;

        let resolved = self
            .resolver
            .resolve(&synthesized)
            .await
            .map_err(failure(Stage::PlaceholderResolution, request_id))?;

        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| PipelineError::Config("no datastore configured".to_string()))
            .map_err(failure(Stage::Execution, request_id))?;
        let results = executor
            .execute(&request.business_id, &resolved)
            .await
            .map_err(failure(Stage::Execution, request_id))?;

        let answer = self
            .answerer
            .answer(&request.question, &results, &request.history)
            .await
            .map_err(failure(Stage::AnswerSynthesis, request_id))?;

        info!("Answered in {:?}", started.elapsed());
        Ok(answer)
    }
}

fn failure(stage: Stage, request_id: &str) -> impl Fn(PipelineError) -> StageFailure + '_ {
    move |error| StageFailure {
        stage,
        request_id: request_id.to_string(),
        error,
    }
}

fn validate_question(question: &str) -> Result<()> {
    if question.trim().is_empty() {
        return Err(PipelineError::InvalidRequest("question is empty".to_string()));
    }
    Ok(())
}
