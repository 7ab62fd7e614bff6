//! Answer Synthesizer
//!
//! Turns a result set into a natural-language answer. Results are rendered as a compact
//! tab-separated table bounded by row and character limits before they reach the model.

use crate::config::AnswerConfig;
use crate::error::{PipelineError, Result};
use crate::execution::ResultSet;
use crate::llm::{strip_code_fences, ChatMessage, CompletionRequest, ConversationHistory, LanguageModel};
use crate::prompts::{answer_prompt, answer_user_message};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const EMPTY_RESULT: &str = "(no rows)";

pub struct AnswerSynthesizer {
    llm: Arc<dyn LanguageModel>,
    limits: AnswerConfig,
    timeout: Duration,
}

impl AnswerSynthesizer {
    pub fn new(llm: Arc<dyn LanguageModel>, limits: AnswerConfig, timeout: Duration) -> Self {
        Self { llm, limits, timeout }
    }

    pub async fn answer(
        &self,
        question: &str,
        results: &ResultSet,
        history: &ConversationHistory,
    ) -> Result<String> {
        let rendered = render_results(results, &self.limits);
        debug!("Answer context ({} chars):\n{}", rendered.len(), rendered);

        let mut messages: Vec<ChatMessage> = history.messages().cloned().collect();
        messages.push(ChatMessage::user(answer_user_message(question, &rendered)));
        let request = CompletionRequest {
            system: answer_prompt().to_string(),
            messages,
        };

        let response = tokio::time::timeout(self.timeout, self.llm.complete(&request))
            .await
            .map_err(|_| {
                PipelineError::Synthesis(format!("answer synthesis timed out after {:?}", self.timeout))
            })??;

        let answer = strip_code_fences(&response).trim();
        if answer.is_empty() {
            return Err(PipelineError::Synthesis("language model returned an empty answer".to_string()));
        }
        info!("Synthesized answer from {} rows", results.row_count());
        Ok(answer.to_string())
    }
}

/// Render rows as a header line plus one tab-separated line per row.
///
/// At most `max_rows` rows and roughly `max_chars` characters are written; whenever rows are
/// left out (here or by the datastore) a note saying so is appended.
pub fn render_results(results: &ResultSet, limits: &AnswerConfig) -> String {
    if results.is_empty() {
        return EMPTY_RESULT.to_string();
    }

    // The header counts against the budget too; a very wide one is cut.
    let mut out = results.columns.join("\t");
    let header_cut = out.len() > limits.max_chars;
    if header_cut {
        let end = (0..=limits.max_chars)
            .rev()
            .find(|&i| out.is_char_boundary(i))
            .unwrap_or(0);
        out.truncate(end);
    }
    let mut shown = 0;
    for row in results.rows.iter().take(limits.max_rows) {
        let line: Vec<String> = results
            .columns
            .iter()
            .map(|column| row.get(column).map(render_value).unwrap_or_default())
            .collect();
        let line = line.join("\t");
        if out.len() + 1 + line.len() > limits.max_chars {
            break;
        }
        out.push('\n');
        out.push_str(&line);
        shown += 1;
    }

    let omitted = results.row_count() - shown;
    if omitted > 0 || results.truncated || header_cut {
        let more = if results.truncated { " or more" } else { "" };
        let columns = if header_cut { "columns cut, " } else { "" };
        out.push_str(&format!(
            "\n[truncated: {}showing {} of {}{} rows]",
            columns,
            shown,
            results.row_count(),
            more
        ));
    }
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.replace(['\t', '\n'], " "),
        other => other.to_string(),
    }
}
