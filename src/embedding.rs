//! Embedding client
//!
//! Turns placeholder search texts into vectors using an OpenAI-compatible embeddings API.

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};
use crate::query::Embedding;
use async_trait::async_trait;
use tracing::debug;

/// Anything that can embed a piece of text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding>;
}

/// Embedding client using the `/embeddings` endpoint.
pub struct EmbeddingClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String, // e.g., "text-embedding-3-small"
    dimensions: Option<usize>,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Embedding(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::Embedding(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Embedding(format!("Failed to parse embedding response: {}", e)))?;

        let embedding = extract_embedding(&response_json)?;
        validate_embedding(&embedding, self.dimensions)?;
        debug!("Embedded '{}' into {} dimensions", text, embedding.len());
        Ok(embedding)
    }
}

fn extract_embedding(response_json: &serde_json::Value) -> Result<Embedding> {
    let values = response_json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|arr| arr.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| PipelineError::Embedding("No embedding vector in response".to_string()))?;

    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| PipelineError::Embedding("Non-numeric value in embedding".to_string()))
        })
        .collect()
}

/// Embeddings must be non-empty, finite and, when configured, of the expected length.
pub fn validate_embedding(embedding: &[f32], dimensions: Option<usize>) -> Result<()> {
    if embedding.is_empty() {
        return Err(PipelineError::Embedding("Embedding service returned an empty vector".to_string()));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::Embedding("Embedding contains non-finite values".to_string()));
    }
    if let Some(expected) = dimensions {
        if embedding.len() != expected {
            return Err(PipelineError::Embedding(format!(
                "Embedding has {} dimensions, expected {}",
                embedding.len(),
                expected
            )));
        }
    }
    Ok(())
}
