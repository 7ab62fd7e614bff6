//! Query Synthesizer
//!
//! Asks the language model for a SQL query answering the user's question, scoped to the
//! caller's business and using placeholders for semantic conditions.

use crate::error::{PipelineError, Result};
use crate::llm::{strip_code_fences, ChatMessage, CompletionRequest, ConversationHistory, LanguageModel};
use crate::prompts::query_synthesis_prompt;
use crate::query::{BusinessId, SynthesizedQuery};
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct QuerySynthesizer {
    llm: Arc<dyn LanguageModel>,
    tenant_column: String,
    timeout: Duration,
}

impl QuerySynthesizer {
    pub fn new(llm: Arc<dyn LanguageModel>, tenant_column: impl Into<String>, timeout: Duration) -> Self {
        Self {
            llm,
            tenant_column: tenant_column.into(),
            timeout,
        }
    }

    pub async fn synthesize(
        &self,
        business_id: &BusinessId,
        question: &str,
        schema_description: &str,
        history: &ConversationHistory,
    ) -> Result<SynthesizedQuery> {
        let system = query_synthesis_prompt(business_id, &self.tenant_column, schema_description, Local::now());
        let mut messages: Vec<ChatMessage> = history.messages().cloned().collect();
        messages.push(ChatMessage::user(question.trim()));

        let request = CompletionRequest { system, messages };
        let response = tokio::time::timeout(self.timeout, self.llm.complete(&request))
            .await
            .map_err(|_| {
                PipelineError::Synthesis(format!("query synthesis timed out after {:?}", self.timeout))
            })??;

        let sql = validate_query_response(&response)?;
        info!("Synthesized query for business {}", business_id);
        debug!("Synthesized SQL: {}", sql);
        Ok(SynthesizedQuery::new(sql))
    }
}

/// Accept only non-empty output whose first keyword is SELECT or WITH.
fn validate_query_response(response: &str) -> Result<String> {
    let sql = strip_code_fences(response);
    if sql.is_empty() {
        return Err(PipelineError::Synthesis("language model returned an empty query".to_string()));
    }

    // Parsing can fail on placeholder text (e.g. an apostrophe in a vendor name), so only
    // the leading word is checked here. Opening parentheses of a set operation are skipped.
    let first_word: String = sql
        .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    let starts_like_query = first_word.eq_ignore_ascii_case("select") || first_word.eq_ignore_ascii_case("with");

    if !starts_like_query {
        let preview: String = sql.chars().take(80).collect();
        return Err(PipelineError::Synthesis(format!(
            "language model did not return a SELECT query: {}",
            preview
        )));
    }
    Ok(sql.to_string())
}
