//! Streaming text-to-speech via the ElevenLabs API.
//!
//! `stream_audio` yields raw PCM frames over a channel as they arrive.
//! `flush()` sets a cancel flag that breaks the forwarding loop. Network
//! errors terminate the stream silently — the caller treats zero frames as
//! "nothing to play".

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TtsConfig;
use crate::error::{AuraError, Result};

const FRAME_CHANNEL_SIZE: usize = 16;

/// Speech synthesis seam between the orchestrator and the TTS provider.
#[async_trait]
pub trait SpeechSynth: Send + Sync {
    /// Synthesize `text`, returning a channel of PCM frames.
    async fn stream_audio(&self, text: &str) -> mpsc::Receiver<Bytes>;

    /// Cancel the current stream.
    fn flush(&self);

    /// Pre-open the HTTP connection pool with a lightweight probe.
    async fn warm(&self);
}

/// ElevenLabs streaming TTS client.
pub struct ElevenLabsTts {
    config: TtsConfig,
    http: reqwest::Client,
    cancelled: Arc<AtomicBool>,
}

impl ElevenLabsTts {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn open_stream(&self, text: &str) -> Result<reqwest::Response> {
        let url = format!(
            "{}/v1/text-to-speech/{}/stream",
            self.config.elevenlabs_base_url, self.config.elevenlabs_voice_id
        );
        let body = json!({
            "text": text,
            "model_id": self.config.elevenlabs_model,
            "voice_settings": {
                "stability": 0.0,
                "similarity_boost": 0.75,
                "style": 0.2,
                "use_speaker_boost": true,
                "speed": 1.0,
            },
        });
        let response = self
            .http
            .post(url)
            .query(&[("output_format", self.config.elevenlabs_output_format.as_str())])
            .header("xi-api-key", &self.config.elevenlabs_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuraError::Tts(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AuraError::Tts(format!("HTTP {status}: {detail}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl SpeechSynth for ElevenLabsTts {
    async fn stream_audio(&self, text: &str) -> mpsc::Receiver<Bytes> {
        self.cancelled.store(false, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_SIZE);

        let preview: String = text.chars().take(30).collect();
        info!(text = %preview, model = %self.config.elevenlabs_model, "TTS stream");

        let response = match self.open_stream(text).await {
            Ok(response) => response,
            Err(e) => {
                // Zero frames signals "nothing to play" downstream.
                warn!("TTS stream failed: {e}");
                return rx;
            }
        };

        let cancelled = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(frame) = stream.next().await {
                if cancelled.load(Ordering::Relaxed) {
                    debug!("TTS stream flushed");
                    break;
                }
                match frame {
                    Ok(frame) => {
                        if !frame.is_empty() && tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("TTS stream failed (network): {e}");
                        break;
                    }
                }
            }
        });

        rx
    }

    fn flush(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    async fn warm(&self) {
        let url = format!("{}/v1/voices", self.config.elevenlabs_base_url);
        match self
            .http
            .get(url)
            .header("xi-api-key", &self.config.elevenlabs_api_key)
            .send()
            .await
        {
            Ok(_) => info!("TTS connection warmed"),
            Err(e) => debug!("TTS warm failed: {e}"),
        }
    }
}
