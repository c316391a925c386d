//! Incremental Server-Sent Events parser for the LLM byte stream.
//!
//! Feed chunks of bytes via [`SseParser::push`]; complete events come out as
//! `(event_type, data)` pairs. Handles multi-line `data:` fields, comment
//! lines, and CRLF line endings.

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if any.
    pub event_type: Option<String>,
    /// Joined `data:` payload.
    pub data: String,
}

#[derive(Debug, Default)]
struct EventBuilder {
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl EventBuilder {
    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.data_lines.is_empty() {
                return None;
            }
            return Some(SseEvent {
                event_type: self.event_type.take(),
                data: std::mem::take(&mut self.data_lines).join("\n"),
            });
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(colon) = line.find(':') {
            let field = &line[..colon];
            let value = line[colon + 1..].strip_prefix(' ').unwrap_or(&line[colon + 1..]);
            match field {
                "data" => self.data_lines.push(value.to_owned()),
                "event" => self.event_type = Some(value.to_owned()),
                _ => {}
            }
        }
        None
    }
}

/// Streaming SSE parser with internal line buffering.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buffer: String,
    builder: EventBuilder,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes, returning any events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let text = String::from_utf8_lossy(chunk);
        let mut events = Vec::new();
        for ch in text.chars() {
            if ch == '\n' {
                let line = std::mem::take(&mut self.line_buffer);
                let line = line.strip_suffix('\r').unwrap_or(&line);
                if let Some(event) = self.builder.process_line(line) {
                    events.push(event);
                }
            } else {
                self.line_buffer.push(ch);
            }
        }
        events
    }
}
