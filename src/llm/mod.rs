//! Anthropic Messages API clients.
//!
//! [`AnthropicChat`] streams chat completions over SSE, yielding text deltas
//! while concurrently assembling the final structured content (text blocks,
//! tool_use blocks with incrementally accumulated JSON input, and any
//! unknown block types preserved verbatim). [`MessagesClient`] is the small
//! non-streaming variant used by memory extraction and community summaries.
//!
//! # SSE event flow
//!
//! ```text
//! message_start → content_block_start → content_block_delta* → content_block_stop
//!              → ... (more content blocks) ...
//!              → message_delta → message_stop
//! ```

pub mod sse;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::context::{ContentBlock, Message};
use crate::error::{AuraError, Result};
use sse::SseParser;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DELTA_CHANNEL_SIZE: usize = 64;

/// Streaming chat seam between the orchestrator and the LLM provider.
#[async_trait]
pub trait ChatStream: Send + Sync {
    /// Start a streaming completion. Returns a channel of text deltas; the
    /// final structured message is captured for
    /// [`last_response_content`](ChatStream::last_response_content).
    async fn stream_response(
        &self,
        system_blocks: Vec<Value>,
        tools: Vec<Value>,
        messages: Vec<Message>,
    ) -> Result<mpsc::Receiver<Result<String>>>;

    /// Set the cancel flag; the streaming task checks it at every delta.
    fn cancel(&self);

    /// Full content blocks of the last completed stream.
    fn last_response_content(&self) -> Option<Vec<ContentBlock>>;

    /// tool_use blocks from the last completed stream (empty = pure text).
    fn tool_use_blocks(&self) -> Vec<ContentBlock>;
}

/// Anthropic Messages streaming client.
pub struct AnthropicChat {
    config: LlmConfig,
    http: reqwest::Client,
    cancelled: Arc<AtomicBool>,
    last_content: Arc<Mutex<Option<Vec<ContentBlock>>>>,
}

impl AnthropicChat {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            last_content: Arc::new(Mutex::new(None)),
        }
    }

    fn build_body(&self, system: Vec<Value>, tools: Vec<Value>, messages: Vec<Message>) -> Value {
        let mut body = json!({
            "model": self.config.claude_model,
            "max_tokens": self.config.claude_max_tokens,
            "system": system,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        if !self.config.claude_effort.is_empty() {
            body["output_config"] = json!({"effort": self.config.claude_effort});
        }
        body
    }
}

#[async_trait]
impl ChatStream for AnthropicChat {
    async fn stream_response(
        &self,
        system_blocks: Vec<Value>,
        tools: Vec<Value>,
        messages: Vec<Message>,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        self.cancelled.store(false, Ordering::Relaxed);
        // Reset before streaming so stale tool blocks from a previous
        // iteration can never leak into this one.
        *self.last_content.lock().unwrap_or_else(|e| e.into_inner()) = None;

        info!(model = %self.config.claude_model, "LLM streaming");
        let body = self.build_body(system_blocks, tools, messages);
        let response = self
            .http
            .post(format!("{}/v1/messages", self.config.anthropic_base_url))
            .header("x-api-key", &self.config.anthropic_api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuraError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AuraError::Llm(format!("HTTP {status}: {detail}")));
        }

        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_SIZE);
        let cancelled = Arc::clone(&self.cancelled);
        let last_content = Arc::clone(&self.last_content);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::new();
            let mut assembler = BlockAssembler::default();

            'outer: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(AuraError::Llm(format!("stream failed: {e}")))).await;
                        break;
                    }
                };
                for event in parser.push(&chunk) {
                    if cancelled.load(Ordering::Relaxed) {
                        debug!("LLM stream cancelled");
                        break 'outer;
                    }
                    let event_type = event.event_type.as_deref().unwrap_or_default();
                    for delta in assembler.apply(event_type, &event.data) {
                        if tx.send(Ok(delta)).await.is_err() {
                            break 'outer;
                        }
                    }
                }
            }

            let blocks = assembler.finish();
            *last_content.lock().unwrap_or_else(|e| e.into_inner()) = Some(blocks);
        });

        Ok(rx)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn last_response_content(&self) -> Option<Vec<ContentBlock>> {
        self.last_content
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn tool_use_blocks(&self) -> Vec<ContentBlock> {
        self.last_response_content()
            .unwrap_or_default()
            .into_iter()
            .filter(|b| b.as_tool_use().is_some())
            .collect()
    }
}

/// In-flight content block under assembly.
#[derive(Debug)]
enum PendingBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
    Other(Value),
}

/// Assembles the final message content from SSE events while extracting the
/// text deltas to forward downstream.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    pending: Vec<Option<PendingBlock>>,
    finished: Vec<(usize, ContentBlock)>,
}

impl BlockAssembler {
    /// Apply one SSE event; returns text deltas to forward.
    pub fn apply(&mut self, event_type: &str, data: &str) -> Vec<String> {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        match event_type {
            "content_block_start" => {
                let index = value["index"].as_u64().unwrap_or(0) as usize;
                let block = &value["content_block"];
                let pending = match block["type"].as_str() {
                    Some("text") => PendingBlock::Text(
                        block["text"].as_str().unwrap_or_default().to_owned(),
                    ),
                    Some("tool_use") => PendingBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_owned(),
                        name: block["name"].as_str().unwrap_or_default().to_owned(),
                        input_json: String::new(),
                    },
                    _ => PendingBlock::Other(block.clone()),
                };
                while self.pending.len() <= index {
                    self.pending.push(None);
                }
                self.pending[index] = Some(pending);
                Vec::new()
            }
            "content_block_delta" => {
                let index = value["index"].as_u64().unwrap_or(0) as usize;
                let delta = &value["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if let Some(Some(PendingBlock::Text(buffer))) = self.pending.get_mut(index)
                        {
                            buffer.push_str(text);
                        }
                        if text.is_empty() {
                            Vec::new()
                        } else {
                            vec![text.to_owned()]
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(Some(PendingBlock::ToolUse { input_json, .. })) =
                            self.pending.get_mut(index)
                        {
                            input_json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                let index = value["index"].as_u64().unwrap_or(0) as usize;
                if let Some(slot) = self.pending.get_mut(index)
                    && let Some(pending) = slot.take()
                {
                    self.finished.push((index, seal_block(pending)));
                }
                Vec::new()
            }
            "error" => {
                warn!("LLM stream error event: {data}");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Finalize: seal any still-open blocks (cancelled mid-block) and return
    /// the blocks in index order.
    pub fn finish(mut self) -> Vec<ContentBlock> {
        for (index, slot) in self.pending.iter_mut().enumerate() {
            if let Some(pending) = slot.take() {
                self.finished.push((index, seal_block(pending)));
            }
        }
        self.finished.sort_by_key(|(index, _)| *index);
        self.finished.into_iter().map(|(_, block)| block).collect()
    }
}

fn seal_block(pending: PendingBlock) -> ContentBlock {
    match pending {
        PendingBlock::Text(text) => ContentBlock::text_block(text),
        PendingBlock::ToolUse {
            id,
            name,
            input_json,
        } => {
            let input = serde_json::from_str(&input_json).unwrap_or_else(|_| json!({}));
            ContentBlock::tool_use(id, name, input)
        }
        PendingBlock::Other(value) => ContentBlock::Other(value),
    }
}

/// Non-streaming Messages client for extraction and summarization calls.
pub struct MessagesClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl MessagesClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, max_tokens: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.to_owned(),
            api_key: api_key.to_owned(),
            model: model.to_owned(),
            max_tokens,
        }
    }

    /// One-shot completion; returns the text of the first content block.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, a non-2xx status, or a
    /// response with no text content.
    pub async fn complete(&self, system: Option<&str>, user: &str) -> Result<String> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{"role": "user", "content": user}],
        });
        if let Some(system) = system {
            body["system"] = Value::String(system.to_owned());
        }

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuraError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AuraError::Llm(format!("HTTP {status}: {detail}")));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| AuraError::Llm(format!("bad response body: {e}")))?;
        value["content"][0]["text"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| AuraError::Llm("response carried no text content".into()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn start(assembler: &mut BlockAssembler, index: u64, block: Value) {
        let data = json!({"index": index, "content_block": block}).to_string();
        assert!(assembler.apply("content_block_start", &data).is_empty());
    }

    fn stop(assembler: &mut BlockAssembler, index: u64) {
        let data = json!({"index": index}).to_string();
        assembler.apply("content_block_stop", &data);
    }

    #[test]
    fn text_deltas_are_forwarded_and_accumulated() {
        let mut assembler = BlockAssembler::default();
        start(&mut assembler, 0, json!({"type": "text", "text": ""}));
        let deltas = assembler.apply(
            "content_block_delta",
            &json!({"index": 0, "delta": {"type": "text_delta", "text": "I'm fine. "}}).to_string(),
        );
        assert_eq!(deltas, vec!["I'm fine. "]);
        assembler.apply(
            "content_block_delta",
            &json!({"index": 0, "delta": {"type": "text_delta", "text": "Thanks."}}).to_string(),
        );
        stop(&mut assembler, 0);

        let blocks = assembler.finish();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text().unwrap(), "I'm fine. Thanks.");
    }

    #[test]
    fn tool_use_input_is_accumulated_from_partial_json() {
        let mut assembler = BlockAssembler::default();
        start(
            &mut assembler,
            0,
            json!({"type": "tool_use", "id": "toolu_1", "name": "hass_control"}),
        );
        for fragment in ["{\"entity_id\":", "\"light.living_room\",", "\"action\":\"turn_on\"}"] {
            let deltas = assembler.apply(
                "content_block_delta",
                &json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": fragment}})
                    .to_string(),
            );
            assert!(deltas.is_empty());
        }
        stop(&mut assembler, 0);

        let blocks = assembler.finish();
        let (id, name, input) = blocks[0].as_tool_use().unwrap();
        assert_eq!(id, "toolu_1");
        assert_eq!(name, "hass_control");
        assert_eq!(input["entity_id"], "light.living_room");
        assert_eq!(input["action"], "turn_on");
    }

    #[test]
    fn mixed_blocks_keep_index_order() {
        let mut assembler = BlockAssembler::default();
        start(&mut assembler, 0, json!({"type": "text", "text": "Turning it on."}));
        start(
            &mut assembler,
            1,
            json!({"type": "tool_use", "id": "t1", "name": "hass_control"}),
        );
        stop(&mut assembler, 1);
        stop(&mut assembler, 0);

        let blocks = assembler.finish();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].text().is_some());
        assert!(blocks[1].as_tool_use().is_some());
    }

    #[test]
    fn unknown_block_types_are_preserved() {
        let mut assembler = BlockAssembler::default();
        let compaction = json!({"type": "compaction", "content": "earlier summary"});
        start(&mut assembler, 0, compaction.clone());
        stop(&mut assembler, 0);

        let blocks = assembler.finish();
        assert_eq!(blocks[0], ContentBlock::Other(compaction));
    }

    #[test]
    fn unterminated_blocks_are_sealed_on_finish() {
        let mut assembler = BlockAssembler::default();
        start(&mut assembler, 0, json!({"type": "text", "text": ""}));
        assembler.apply(
            "content_block_delta",
            &json!({"index": 0, "delta": {"type": "text_delta", "text": "partial"}}).to_string(),
        );
        let blocks = assembler.finish();
        assert_eq!(blocks[0].text().unwrap(), "partial");
    }

    #[test]
    fn malformed_tool_input_falls_back_to_empty_object() {
        let mut assembler = BlockAssembler::default();
        start(
            &mut assembler,
            0,
            json!({"type": "tool_use", "id": "t1", "name": "hass_control"}),
        );
        assembler.apply(
            "content_block_delta",
            &json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "{broken"}})
                .to_string(),
        );
        stop(&mut assembler, 0);
        let blocks = assembler.finish();
        let (_, _, input) = blocks[0].as_tool_use().unwrap();
        assert_eq!(input, &json!({}));
    }
}
