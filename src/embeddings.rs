//! Contextual embeddings via the Voyage AI API.
//!
//! Requests are auto-batched into groups of at most 128 inputs and issued
//! under a bounded concurrency semaphore so a large extraction cannot flood
//! the API. Query and document embeddings use distinct input types.

use futures_util::future::try_join_all;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{AuraError, Result};

/// Maximum inputs per API request.
const MAX_BATCH: usize = 128;
/// Concurrent in-flight requests.
const MAX_CONCURRENCY: usize = 5;

#[derive(Debug, Deserialize)]
struct ContextualizedResponse {
    data: Vec<DocumentEmbeddings>,
}

#[derive(Debug, Deserialize)]
struct DocumentEmbeddings {
    data: Vec<ChunkEmbedding>,
}

#[derive(Debug, Deserialize)]
struct ChunkEmbedding {
    embedding: Vec<f32>,
}

/// Voyage AI embedding client.
#[derive(Clone)]
pub struct VoyageEmbedder {
    config: EmbeddingConfig,
    http: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl VoyageEmbedder {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENCY)),
        }
    }

    async fn contextualized(
        &self,
        inputs: Vec<Vec<String>>,
        input_type: &str,
    ) -> Result<ContextualizedResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AuraError::Memory("embedder closed".into()))?;

        let body = json!({
            "inputs": inputs,
            "model": self.config.voyage_context_model,
            "input_type": input_type,
        });
        let response = self
            .http
            .post(format!(
                "{}/v1/contextualizedembeddings",
                self.config.voyage_base_url
            ))
            .bearer_auth(&self.config.voyage_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuraError::Memory(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AuraError::Memory(format!("embedding HTTP {status}: {detail}")));
        }
        response
            .json()
            .await
            .map_err(|e| AuraError::Memory(format!("bad embedding response: {e}")))
    }

    /// Embed a single query (`input_type = "query"`).
    pub async fn embed_query_contextual(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .contextualized(vec![vec![text.to_owned()]], "query")
            .await?;
        response
            .data
            .into_iter()
            .next()
            .and_then(|doc| doc.data.into_iter().next())
            .map(|chunk| chunk.embedding)
            .ok_or_else(|| AuraError::Memory("empty embedding response".into()))
    }

    /// Embed related chunks as one document's segments (context is shared
    /// across the chunks).
    pub async fn embed_chunks_contextual(&self, chunks: &[String]) -> Result<Vec<Vec<f32>>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .contextualized(vec![chunks.to_vec()], "document")
            .await?;
        let doc = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AuraError::Memory("empty embedding response".into()))?;
        Ok(doc.data.into_iter().map(|c| c.embedding).collect())
    }

    /// Embed independent texts, each as its own single-chunk document.
    ///
    /// Batched into groups of [`MAX_BATCH`] issued concurrently (bounded by
    /// the semaphore), preserving input order.
    pub async fn embed_texts_contextual(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(texts = texts.len(), "embedding batch");

        let batches: Vec<Vec<Vec<String>>> = texts
            .chunks(MAX_BATCH)
            .map(|batch| batch.iter().map(|t| vec![t.clone()]).collect())
            .collect();

        let futures = batches
            .into_iter()
            .map(|inputs| self.contextualized(inputs, "document"));
        let responses = try_join_all(futures).await?;

        let mut embeddings = Vec::with_capacity(texts.len());
        for response in responses {
            for doc in response.data {
                let chunk = doc
                    .data
                    .into_iter()
                    .next()
                    .ok_or_else(|| AuraError::Memory("document with no embedding".into()))?;
                embeddings.push(chunk.embedding);
            }
        }
        if embeddings.len() != texts.len() {
            return Err(AuraError::Memory(format!(
                "embedding count mismatch: {} texts, {} embeddings",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}
