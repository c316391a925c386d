//! Relevance reranking via the Voyage AI rerank API.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{AuraError, Result};

#[derive(Debug, Deserialize)]
struct RerankResponse {
    data: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f64,
}

/// Voyage AI reranker client.
#[derive(Clone)]
pub struct VoyageReranker {
    config: EmbeddingConfig,
    http: reqwest::Client,
}

impl VoyageReranker {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Reorder `items` by relevance to `query`, judging each item by its
    /// `text_key` field. Returned items gain a `relevance_score` field.
    /// The API call is skipped for zero or one items.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a non-2xx status, or a result
    /// index out of range.
    pub async fn rerank(
        &self,
        query: &str,
        items: Vec<Value>,
        text_key: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<Value>> {
        if items.len() <= 1 {
            return Ok(items);
        }

        let documents: Vec<&str> = items
            .iter()
            .map(|item| item[text_key].as_str().unwrap_or_default())
            .collect();
        let mut body = json!({
            "query": query,
            "documents": documents,
            "model": self.config.rerank_model,
        });
        if let Some(top_k) = top_k {
            body["top_k"] = json!(top_k);
        }

        let response = self
            .http
            .post(format!("{}/v1/rerank", self.config.voyage_base_url))
            .bearer_auth(&self.config.voyage_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuraError::Memory(format!("rerank request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AuraError::Memory(format!("rerank HTTP {status}: {detail}")));
        }
        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| AuraError::Memory(format!("bad rerank response: {e}")))?;

        debug!(kept = parsed.data.len(), from = items.len(), "reranked");
        parsed
            .data
            .into_iter()
            .map(|result| {
                let mut item = items
                    .get(result.index)
                    .cloned()
                    .ok_or_else(|| AuraError::Memory("rerank index out of range".into()))?;
                item["relevance_score"] = json!(result.relevance_score);
                Ok(item)
            })
            .collect()
    }
}
