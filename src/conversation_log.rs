//! Daily JSONL conversation archival.
//!
//! One file per local-timezone day, one JSON object per line, append-only.
//! Non-ASCII text is preserved as-is (no escaping, no BOM).

use chrono::Local;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use uuid::Uuid;

use crate::context::Message;
use crate::processing::content_to_text;

/// Saves conversation sessions as daily JSONL files.
#[derive(Debug, Clone)]
pub struct ConversationLogger {
    log_dir: PathBuf,
}

impl ConversationLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    /// Append one session record to today's file.
    ///
    /// Returns the file path, or `None` when `messages` is empty or the write
    /// failed (archival is best-effort; failures are logged, never raised).
    pub fn save_session(&self, session_id: Uuid, messages: &[Message]) -> Option<PathBuf> {
        if messages.is_empty() {
            return None;
        }
        match self.write_record(session_id, messages) {
            Ok(path) => {
                info!(path = %path.display(), messages = messages.len(), "session saved");
                Some(path)
            }
            Err(e) => {
                error!("failed to save session: {e}");
                None
            }
        }
    }

    fn write_record(&self, session_id: Uuid, messages: &[Message]) -> std::io::Result<PathBuf> {
        let now = Local::now();
        let path = self.log_dir.join(format!("{}.jsonl", now.format("%Y-%m-%d")));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let serializable: Vec<_> = messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.name(),
                    "content": content_to_text(&m.content),
                })
            })
            .collect();
        let record = json!({
            "session_id": session_id.to_string(),
            "timestamp": now.to_rfc3339(),
            "messages": serializable,
        });

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        // serde_json emits UTF-8 without escaping non-ASCII.
        let line = serde_json::to_string(&record)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(path)
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::context::{Content, ContentBlock, Role};

    fn msg(role: Role, text: &str) -> Message {
        Message {
            role,
            content: Content::Text(text.to_owned()),
        }
    }

    #[test]
    fn empty_session_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ConversationLogger::new(dir.path());
        assert!(logger.save_session(Uuid::new_v4(), &[]).is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn record_round_trips_as_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ConversationLogger::new(dir.path());
        let session_id = Uuid::new_v4();
        let messages = vec![
            msg(Role::User, "안녕, 오늘 어때?"),
            msg(Role::Assistant, "좋아! 너는?"),
        ];
        let path = logger.save_session(session_id, &messages).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["session_id"], session_id.to_string());
        assert_eq!(record["messages"][0]["role"], "user");
        assert_eq!(record["messages"][0]["content"], "안녕, 오늘 어때?");
        // Non-ASCII preserved verbatim, not \u-escaped.
        assert!(lines[0].contains("안녕"));
        assert!(record["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn sessions_append_to_the_same_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ConversationLogger::new(dir.path());
        let first = logger
            .save_session(Uuid::new_v4(), &[msg(Role::User, "one")])
            .unwrap();
        let second = logger
            .save_session(Uuid::new_v4(), &[msg(Role::User, "two")])
            .unwrap();
        assert_eq!(first, second);
        let raw = std::fs::read_to_string(&first).unwrap();
        assert_eq!(raw.lines().count(), 2);
        for line in raw.lines() {
            assert!(serde_json::from_str::<serde_json::Value>(line).is_ok());
        }
    }

    #[test]
    fn block_content_is_flattened_for_archival() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ConversationLogger::new(dir.path());
        let messages = vec![Message {
            role: Role::Assistant,
            content: Content::Blocks(vec![
                ContentBlock::text_block("turning it on"),
                ContentBlock::tool_use("t1", "hass_control", serde_json::json!({})),
            ]),
        }];
        let path = logger.save_session(Uuid::new_v4(), &messages).unwrap();
        let record: serde_json::Value =
            serde_json::from_str(std::fs::read_to_string(path).unwrap().lines().next().unwrap())
                .unwrap();
        assert_eq!(record["messages"][0]["content"], "turning it on");
    }
}
