//! Streaming speech-to-text over a persistent WebSocket session.
//!
//! Protocol (Deepgram-style): audio flows up as binary frames; the service
//! sends JSON text frames — a `Connected` acknowledgement on session open,
//! `Results` frames carrying partial/committed transcripts, and
//! `UtteranceEnd` frames marking the end of an utterance. All committed
//! transcripts for an utterance are delivered before its utterance end.
//!
//! Events are posted to the orchestrator over a channel; the orchestrator
//! never blocks on the socket.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SttConfig;
use crate::error::{AuraError, Result};

/// Transcript events delivered to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    Transcript { text: String, is_final: bool },
    UtteranceEnd,
}

/// STT session seam between the orchestrator and the transport.
#[async_trait]
pub trait SttLink: Send + Sync {
    /// Open (or reuse) a session. Reentrant: an open session is kept; a
    /// session closed by the peer is replaced.
    async fn connect(&self) -> Result<()>;

    /// Whether a live session exists.
    fn is_connected(&self) -> bool;

    /// Send one PCM chunk. Fire-and-forget from the caller's view; a send
    /// failure tears the session down and reports not-connected.
    async fn send_audio(&self, chunk: Bytes) -> Result<()>;

    /// Close the session.
    async fn disconnect(&self);
}

const CONNECT_ATTEMPTS: u32 = 4;
const SESSION_STARTED_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct Session {
    sink: WsSink,
    recv_task: JoinHandle<()>,
}

/// Deepgram streaming client.
pub struct DeepgramStt {
    config: SttConfig,
    sample_rate: u32,
    event_tx: mpsc::UnboundedSender<SttEvent>,
    session: tokio::sync::Mutex<Option<Session>>,
    /// Set false by the receive task when the peer closes the socket.
    connected: Arc<AtomicBool>,
}

impl DeepgramStt {
    pub fn new(
        config: SttConfig,
        sample_rate: u32,
        event_tx: mpsc::UnboundedSender<SttEvent>,
    ) -> Self {
        Self {
            config,
            sample_rate,
            event_tx,
            session: tokio::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn session_url(&self) -> Result<Url> {
        Url::parse_with_params(
            &self.config.deepgram_url,
            &[
                ("model", self.config.deepgram_model.as_str()),
                ("language", self.config.stt_language.as_str()),
                ("encoding", "linear16"),
                ("sample_rate", &self.sample_rate.to_string()),
                ("smart_format", "true"),
                ("interim_results", "true"),
                ("utterance_end_ms", "1000"),
                ("endpointing", &self.config.deepgram_endpointing.to_string()),
            ],
        )
        .map_err(|e| AuraError::Stt(format!("bad session URL: {e}")))
    }

    async fn dial(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let url = self.session_url()?;
        let auth: tokio_tungstenite::tungstenite::http::HeaderValue =
            format!("Token {}", self.config.deepgram_api_key)
                .parse()
                .map_err(|_| AuraError::Stt("invalid API key header".into()))?;

        let mut delay = Duration::from_millis(500);
        let mut last_err = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| AuraError::Stt(format!("bad request: {e}")))?;
            request.headers_mut().insert("Authorization", auth.clone());
            match connect_async(request).await {
                Ok((stream, _response)) => return Ok(stream),
                Err(e) => {
                    last_err = e.to_string();
                    warn!(attempt, "STT connect failed: {last_err}");
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(AuraError::Stt(format!(
            "connect failed after {CONNECT_ATTEMPTS} attempts: {last_err}"
        )))
    }

    async fn teardown(&self) {
        let mut guard = self.session.lock().await;
        if let Some(mut session) = guard.take() {
            let _ = session
                .sink
                .send(WsMessage::Text("{\"type\":\"CloseStream\"}".into()))
                .await;
            let _ = session.sink.close().await;
            session.recv_task.abort();
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl SttLink for DeepgramStt {
    async fn connect(&self) -> Result<()> {
        {
            let guard = self.session.lock().await;
            if guard.is_some() && self.connected.load(Ordering::Relaxed) {
                debug!("reusing open STT session");
                return Ok(());
            }
        }
        // Closed or never opened: replace the session.
        self.teardown().await;

        let stream = match self.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                return Err(e);
            }
        };
        let (sink, mut source) = stream.split();

        match tokio::time::timeout(SESSION_STARTED_TIMEOUT, wait_session_started(&mut source)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.connected.store(false, Ordering::Relaxed);
                return Err(e);
            }
            Err(_) => {
                self.connected.store(false, Ordering::Relaxed);
                return Err(AuraError::Stt("session-started ack timed out".into()));
            }
        }

        let event_tx = self.event_tx.clone();
        let connected = Arc::clone(&self.connected);
        let recv_task = tokio::spawn(async move {
            run_receive_loop(source, event_tx, connected).await;
        });

        *self.session.lock().await = Some(Session { sink, recv_task });
        self.connected.store(true, Ordering::Relaxed);
        info!("STT session open");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send_audio(&self, chunk: Bytes) -> Result<()> {
        let send_result = {
            let mut guard = self.session.lock().await;
            match guard.as_mut() {
                Some(session) => session.sink.send(WsMessage::Binary(chunk.to_vec())).await,
                None => return Ok(()),
            }
        };
        if let Err(e) = send_result {
            warn!("STT send failed, disconnecting: {e}");
            self.teardown().await;
            return Err(AuraError::Stt(format!("send failed: {e}")));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }
}

/// Read frames until the service acknowledges the session start.
async fn wait_session_started(source: &mut WsSource) -> Result<()> {
    while let Some(frame) = source.next().await {
        let frame = frame.map_err(|e| AuraError::Stt(format!("recv failed: {e}")))?;
        if let WsMessage::Text(raw) = frame
            && let Ok(value) = serde_json::from_str::<Value>(&raw)
            && value["type"] == "Connected"
        {
            return Ok(());
        }
    }
    Err(AuraError::Stt("socket closed before session start".into()))
}

async fn run_receive_loop(
    mut source: WsSource,
    event_tx: mpsc::UnboundedSender<SttEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(raw)) => {
                let Ok(value) = serde_json::from_str::<Value>(&raw) else {
                    debug!("unparsable STT frame: {raw}");
                    continue;
                };
                for event in events_from_frame(&value) {
                    if event_tx.send(event).is_err() {
                        connected.store(false, Ordering::Relaxed);
                        return;
                    }
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("STT recv error: {e}");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    debug!("STT receive loop ended");
}

/// Map one service frame to transcript events.
///
/// Committed transcripts always precede the utterance end derived from the
/// same frame.
fn events_from_frame(value: &Value) -> Vec<SttEvent> {
    let mut events = Vec::new();
    match value["type"].as_str() {
        Some("Results") => {
            let text = transcript_text(value);
            let is_final = value["is_final"].as_bool().unwrap_or(false);
            if !text.is_empty() {
                events.push(SttEvent::Transcript { text, is_final });
            }
            if is_final && value["speech_final"].as_bool().unwrap_or(false) {
                events.push(SttEvent::UtteranceEnd);
            }
        }
        Some("UtteranceEnd") => events.push(SttEvent::UtteranceEnd),
        Some("Error") => warn!("STT service error: {value}"),
        _ => {}
    }
    events
}

/// Extract the transcript, reconstructing from the word array when present.
///
/// Joining `punctuated_word || word` with single spaces recovers word
/// boundaries the raw transcript field can omit (notably for Korean).
fn transcript_text(value: &Value) -> String {
    let alternative = &value["channel"]["alternatives"][0];
    if let Some(words) = alternative["words"].as_array()
        && !words.is_empty()
    {
        let joined = words
            .iter()
            .filter_map(|w| {
                w["punctuated_word"]
                    .as_str()
                    .or_else(|| w["word"].as_str())
            })
            .collect::<Vec<_>>()
            .join(" ");
        return joined.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    alternative["transcript"]
        .as_str()
        .unwrap_or_default()
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn partial_results_map_to_interim_transcript() {
        let frame = json!({
            "type": "Results",
            "is_final": false,
            "channel": {"alternatives": [{"transcript": "hello wor"}]},
        });
        assert_eq!(
            events_from_frame(&frame),
            vec![SttEvent::Transcript {
                text: "hello wor".into(),
                is_final: false
            }]
        );
    }

    #[test]
    fn committed_results_precede_utterance_end() {
        let frame = json!({
            "type": "Results",
            "is_final": true,
            "speech_final": true,
            "channel": {"alternatives": [{"transcript": "hello world."}]},
        });
        assert_eq!(
            events_from_frame(&frame),
            vec![
                SttEvent::Transcript {
                    text: "hello world.".into(),
                    is_final: true
                },
                SttEvent::UtteranceEnd,
            ]
        );
    }

    #[test]
    fn standalone_utterance_end_frame() {
        let frame = json!({"type": "UtteranceEnd"});
        assert_eq!(events_from_frame(&frame), vec![SttEvent::UtteranceEnd]);
    }

    #[test]
    fn empty_transcript_is_dropped() {
        let frame = json!({
            "type": "Results",
            "is_final": false,
            "channel": {"alternatives": [{"transcript": ""}]},
        });
        assert!(events_from_frame(&frame).is_empty());
    }

    #[test]
    fn word_array_reconstruction_prefers_punctuated() {
        let frame = json!({
            "type": "Results",
            "is_final": true,
            "channel": {"alternatives": [{
                "transcript": "안녕하세요오늘어때",
                "words": [
                    {"word": "안녕하세요", "punctuated_word": "안녕하세요,"},
                    {"word": "오늘"},
                    {"word": "어때", "punctuated_word": "어때?"},
                ],
            }]},
        });
        let events = events_from_frame(&frame);
        assert_eq!(
            events[0],
            SttEvent::Transcript {
                text: "안녕하세요, 오늘 어때?".into(),
                is_final: true
            }
        );
    }

    #[test]
    fn word_array_whitespace_is_normalized() {
        let frame = json!({
            "channel": {"alternatives": [{
                "words": [{"word": " hello "}, {"word": "world"}],
            }]},
        });
        assert_eq!(transcript_text(&frame), "hello world");
    }

    #[test]
    fn error_frames_produce_no_events() {
        let frame = json!({"type": "Error", "description": "bad audio"});
        assert!(events_from_frame(&frame).is_empty());
    }
}
