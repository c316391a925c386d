//! Voice activity detection.
//!
//! Each audio chunk is scored for speech probability by a [`SpeechScorer`]
//! (Silero VAD in production). A hysteretic counter suppresses single-chunk
//! spurious triggers: speech is reported only after
//! `speech_count_threshold` consecutive over-threshold chunks (~90 ms at
//! 16 kHz / 512-sample chunks with the default of 3).
//!
//! A bounded ring of the last N raw chunks is retained so audio preceding
//! the detection threshold can be recovered and forwarded to STT ahead of
//! the live stream.

pub mod silero;

use bytes::Bytes;
use std::collections::VecDeque;

use crate::config::VadConfig;
use crate::error::Result;

pub use silero::SileroVad;

/// Per-chunk speech probability model.
///
/// Implementations must be cheap enough to run inline on the orchestrator
/// thread (<5 ms per chunk).
pub trait SpeechScorer: Send {
    /// Speech probability in `[0, 1]` for one s16le PCM chunk.
    fn score(&mut self, pcm: &[u8]) -> Result<f32>;

    /// Reset any internal streaming state.
    fn reset(&mut self);
}

/// Hysteresis and pre-buffer wrapper around a [`SpeechScorer`].
pub struct VadProcessor {
    scorer: Box<dyn SpeechScorer>,
    threshold: f32,
    speech_count_threshold: u32,
    speech_count: u32,
    prebuffer: VecDeque<Bytes>,
    prebuffer_capacity: usize,
}

impl VadProcessor {
    pub fn new(scorer: Box<dyn SpeechScorer>, config: &VadConfig) -> Self {
        Self {
            scorer,
            threshold: config.vad_threshold,
            speech_count_threshold: config.speech_count_threshold,
            speech_count: 0,
            prebuffer: VecDeque::with_capacity(config.vad_prebuffer_chunks),
            prebuffer_capacity: config.vad_prebuffer_chunks,
        }
    }

    /// Current probability threshold.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Externally writable threshold; the orchestrator raises it while the
    /// assistant is speaking.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    /// Score one chunk, update hysteresis, and retain it in the pre-buffer.
    ///
    /// Returns `true` once the consecutive-speech counter reaches the
    /// configured threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if model inference fails.
    pub fn is_speech(&mut self, chunk: &Bytes) -> Result<bool> {
        if self.prebuffer_capacity > 0 {
            if self.prebuffer.len() == self.prebuffer_capacity {
                let _ = self.prebuffer.pop_front();
            }
            self.prebuffer.push_back(chunk.clone());
        }

        let prob = self.scorer.score(chunk)?;
        if prob >= self.threshold {
            self.speech_count = self.speech_count.saturating_add(1);
        } else {
            self.speech_count = 0;
        }
        Ok(self.speech_count >= self.speech_count_threshold)
    }

    /// Drain the pre-trigger ring, oldest first.
    pub fn drain_prebuffer(&mut self) -> Vec<Bytes> {
        self.prebuffer.drain(..).collect()
    }

    /// Reset the hysteresis counter, the pre-buffer, and the model state.
    pub fn reset(&mut self) {
        self.speech_count = 0;
        self.prebuffer.clear();
        self.scorer.reset();
    }
}
