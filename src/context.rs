//! System prompt assembly and conversation message log.
//!
//! The three-block system prompt layout is designed for prompt caching:
//! persona and RAG context carry cache markers, the per-request dynamic block
//! (datetime, timezone) is last and uncached. Placing anything dynamic
//! between cached blocks would invalidate the cached prefix on every request.

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A typed content block within a message.
///
/// Unknown block types returned by the model (e.g. compaction blocks) are
/// preserved verbatim in [`ContentBlock::Other`] so assistant messages
/// round-trip through the API unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Known(KnownBlock),
    Other(Value),
}

/// The block types the runtime understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    pub fn text_block(text: impl Into<String>) -> Self {
        Self::Known(KnownBlock::Text { text: text.into() })
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::Known(KnownBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        })
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::Known(KnownBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: is_error.then_some(true),
        })
    }

    /// Text payload for text blocks.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Known(KnownBlock::Text { text }) => Some(text.clone()),
            _ => None,
        }
    }

    /// `(id, name, input)` for tool_use blocks.
    pub fn as_tool_use(&self) -> Option<(&str, &str, &Value)> {
        match self {
            Self::Known(KnownBlock::ToolUse { id, name, input }) => Some((id, name, input)),
            _ => None,
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::Known(KnownBlock::ToolResult { .. }))
    }
}

/// Message content: a plain string or an ordered list of content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Whether this content contains tool_result blocks.
    ///
    /// Tool-result messages are constructed with tool_result blocks only, so
    /// this identifies the synthetic user turns that reply to tool execution.
    pub fn has_tool_result(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Blocks(blocks) => blocks.iter().any(ContentBlock::is_tool_result),
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

/// Holds the persona, the current RAG context, and the ordered message log.
///
/// The log is never trimmed here; the sliding window of
/// [`get_recent_messages`](ContextManager::get_recent_messages) is the policy.
#[derive(Debug)]
pub struct ContextManager {
    persona: String,
    rag_context: String,
    messages: Vec<Message>,
}

impl ContextManager {
    pub fn new(persona_text: impl Into<String>) -> Self {
        Self {
            persona: persona_text.into(),
            rag_context: String::new(),
            messages: Vec::new(),
        }
    }

    /// Build the three-block system prompt.
    ///
    /// Order is load-bearing: persona (cached), RAG (cached), dynamic (NOT
    /// cached, last).
    pub fn build_system_blocks(&self) -> Vec<Value> {
        let rag = if self.rag_context.is_empty() {
            "(no additional context)"
        } else {
            &self.rag_context
        };
        let now = Local::now();
        vec![
            json!({
                "type": "text",
                "text": self.persona,
                "cache_control": {"type": "ephemeral"},
            }),
            json!({
                "type": "text",
                "text": rag,
                "cache_control": {"type": "ephemeral"},
            }),
            json!({
                "type": "text",
                "text": format!(
                    "datetime: {}\ntimezone: {}",
                    now.format("%Y-%m-%d %H:%M:%S"),
                    now.format("%Z"),
                ),
            }),
        ]
    }

    /// Build the tool list: web-search first, then registry-generated tools.
    /// The last tool carries the cache marker.
    pub fn build_tools(&self, registry_schemas: Option<Vec<Value>>) -> Vec<Value> {
        let web_search = json!({
            "type": "web_search_20250305",
            "name": "web_search",
            "max_uses": 1,
        });
        let mut tools = vec![web_search];
        if let Some(schemas) = registry_schemas {
            tools.extend(schemas);
        }
        if let Some(last) = tools.last_mut()
            && last.get("cache_control").is_none()
        {
            last["cache_control"] = json!({"type": "ephemeral"});
        }
        tools
    }

    /// Append a message. Block lists are preserved verbatim so assistant
    /// messages containing tool_use blocks round-trip to the API.
    pub fn add_message(&mut self, role: Role, content: impl Into<Content>) {
        self.messages.push(Message {
            role,
            content: content.into(),
        });
    }

    /// Full message log.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages in the log.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// At most `max_turns * 2` trailing messages, trimmed from the left until
    /// the window starts at a user message that is not a tool-result reply.
    pub fn get_recent_messages(&self, max_turns: usize) -> Vec<Message> {
        let max_messages = max_turns.saturating_mul(2);
        let start = self.messages.len().saturating_sub(max_messages);
        let mut window = &self.messages[start..];
        while let Some(first) = window.first() {
            if first.role == Role::User && !first.content.has_tool_result() {
                break;
            }
            window = &window[1..];
        }
        window.to_vec()
    }

    /// Replace the RAG context block.
    pub fn update_rag_context(&mut self, context: impl Into<String>) {
        self.rag_context = context.into();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn system_blocks_place_dynamic_last() {
        let ctx = ContextManager::new("persona text");
        let blocks = ctx.build_system_blocks();
        assert_eq!(blocks.len(), 3);
        assert!(blocks[0].get("cache_control").is_some());
        assert!(blocks[1].get("cache_control").is_some());
        assert!(blocks[2].get("cache_control").is_none());
        let dynamic = blocks[2]["text"].as_str().unwrap();
        assert!(dynamic.starts_with("datetime:"));
        assert!(dynamic.contains("timezone:"));
    }

    #[test]
    fn empty_rag_context_gets_placeholder() {
        let ctx = ContextManager::new("p");
        let blocks = ctx.build_system_blocks();
        assert_eq!(blocks[1]["text"], "(no additional context)");
    }

    #[test]
    fn rag_context_replaces_placeholder() {
        let mut ctx = ContextManager::new("p");
        ctx.update_rag_context("- Alice (person): a friend");
        let blocks = ctx.build_system_blocks();
        assert_eq!(blocks[1]["text"], "- Alice (person): a friend");
    }

    #[test]
    fn web_search_comes_first() {
        let ctx = ContextManager::new("p");
        let tools = ctx.build_tools(None);
        assert_eq!(tools[0]["name"], "web_search");
    }

    #[test]
    fn last_tool_carries_cache_marker() {
        let ctx = ContextManager::new("p");
        let schemas = vec![json!({"name": "hass_control"}), json!({"name": "hass_query"})];
        let tools = ctx.build_tools(Some(schemas));
        assert_eq!(tools.len(), 3);
        assert!(tools[0].get("cache_control").is_none());
        assert!(tools[1].get("cache_control").is_none());
        assert!(tools[2].get("cache_control").is_some());
    }

    #[test]
    fn cache_marker_lands_on_web_search_without_registry() {
        let ctx = ContextManager::new("p");
        let tools = ctx.build_tools(None);
        assert_eq!(tools.len(), 1);
        assert!(tools[0].get("cache_control").is_some());
    }

    #[test]
    fn recent_messages_keeps_trailing_window() {
        let mut ctx = ContextManager::new("p");
        for i in 0..8 {
            ctx.add_message(Role::User, format!("q{i}"));
            ctx.add_message(Role::Assistant, format!("a{i}"));
        }
        let recent = ctx.get_recent_messages(2);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].content, Content::Text("q6".into()));
    }

    #[test]
    fn recent_messages_skips_leading_assistant() {
        let mut ctx = ContextManager::new("p");
        ctx.add_message(Role::User, "q0");
        ctx.add_message(Role::Assistant, "a0");
        ctx.add_message(Role::User, "q1");
        ctx.add_message(Role::Assistant, "a1");
        ctx.add_message(Role::User, "q2");
        // Window of 2 turns starts at a1; the trim must advance to q2.
        let recent = ctx.get_recent_messages(2);
        assert_eq!(recent[0].role, Role::User);
        assert_eq!(recent[0].content, Content::Text("q2".into()));
    }

    #[test]
    fn recent_messages_skips_tool_result_boundary() {
        let mut ctx = ContextManager::new("p");
        ctx.add_message(Role::User, "real question");
        ctx.add_message(
            Role::Assistant,
            Content::Blocks(vec![ContentBlock::tool_use("t1", "hass_control", json!({}))]),
        );
        ctx.add_message(
            Role::User,
            Content::Blocks(vec![ContentBlock::tool_result("t1", "{\"ok\":true}", false)]),
        );
        ctx.add_message(Role::Assistant, "done");
        ctx.add_message(Role::User, "next question");
        ctx.add_message(Role::Assistant, "sure");

        // A 2-turn window would start at the tool_result user message; the
        // trim must advance past it to the next real user turn.
        let recent = ctx.get_recent_messages(2);
        assert_eq!(recent[0].role, Role::User);
        assert!(!recent[0].content.has_tool_result());
        assert_eq!(recent[0].content, Content::Text("next question".into()));
    }

    #[test]
    fn content_blocks_round_trip_through_json() {
        let content = Content::Blocks(vec![
            ContentBlock::text_block("hello"),
            ContentBlock::tool_use("id1", "hass_control", json!({"entity_id": "light.desk"})),
            ContentBlock::Other(json!({"type": "compaction", "content": "summary"})),
        ]);
        let raw = serde_json::to_value(&content).unwrap();
        let back: Content = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(back, content);
        assert_eq!(raw[2]["type"], "compaction");
    }

    #[test]
    fn tool_result_serializes_without_is_error_when_ok() {
        let block = ContentBlock::tool_result("t1", "ok", false);
        let raw = serde_json::to_value(&block).unwrap();
        assert!(raw.get("is_error").is_none());
        let err = ContentBlock::tool_result("t1", "boom", true);
        let raw = serde_json::to_value(&err).unwrap();
        assert_eq!(raw["is_error"], true);
    }
}
