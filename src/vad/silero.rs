//! Silero VAD speech scoring via ONNX Runtime.
//!
//! The streaming Silero model takes a 512-sample window plus a recurrent
//! state tensor and returns a speech probability. State is carried across
//! calls and zeroed on `reset()` so a new utterance starts clean.

use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::Tensor;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::SpeechScorer;
use crate::error::{AuraError, Result};

/// Recurrent state shape of the streaming Silero model.
const STATE_DIMS: [usize; 3] = [2, 1, 128];

/// Silero VAD scorer.
pub struct SileroVad {
    session: Session,
    state: Vec<f32>,
    sample_rate: i64,
}

impl SileroVad {
    /// Load the Silero VAD model from an ONNX file.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded.
    pub fn new(model_path: &Path, sample_rate: u32) -> Result<Self> {
        let session = Session::builder()
            .and_then(|b| Ok(b.with_intra_threads(1)?))
            .and_then(|mut b| b.commit_from_file(model_path))
            .map_err(|e| AuraError::Vad(format!("silero model load failed: {e}")))?;

        info!(path = %model_path.display(), "silero VAD ready");

        Ok(Self {
            session,
            state: vec![0.0; STATE_DIMS.iter().product()],
            sample_rate: i64::from(sample_rate),
        })
    }
}

/// Convert an s16le PCM buffer to normalized f32 samples.
fn pcm_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0)
        .collect()
}

impl SpeechScorer for SileroVad {
    fn score(&mut self, pcm: &[u8]) -> Result<f32> {
        let samples = pcm_to_f32(pcm);
        let window = samples.len();

        let input = Tensor::from_array(([1, window], samples))
            .map_err(|e| AuraError::Vad(format!("input tensor failed: {e}")))?;
        let state = Tensor::from_array((STATE_DIMS, self.state.clone()))
            .map_err(|e| AuraError::Vad(format!("state tensor failed: {e}")))?;
        let sr = Tensor::from_array(([1], vec![self.sample_rate]))
            .map_err(|e| AuraError::Vad(format!("sr tensor failed: {e}")))?;

        let mut feed: HashMap<String, SessionInputValue> = HashMap::new();
        feed.insert("input".to_owned(), input.into());
        feed.insert("state".to_owned(), state.into());
        feed.insert("sr".to_owned(), sr.into());

        let outputs = self
            .session
            .run(SessionInputs::from(feed))
            .map_err(|e| AuraError::Vad(format!("silero inference failed: {e}")))?;

        let (_shape, prob) = outputs["output"]
            .try_extract_tensor::<f32>()
            .map_err(|e| AuraError::Vad(format!("probability extraction failed: {e}")))?;
        let (_shape, next_state) = outputs["stateN"]
            .try_extract_tensor::<f32>()
            .map_err(|e| AuraError::Vad(format!("state extraction failed: {e}")))?;

        self.state.clear();
        self.state.extend_from_slice(next_state);

        Ok(prob.first().copied().unwrap_or(0.0))
    }

    fn reset(&mut self) {
        self.state.iter_mut().for_each(|v| *v = 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_conversion_is_normalized() {
        // i16::MIN, 0, i16::MAX as little-endian pairs.
        let pcm = [0x00, 0x80, 0x00, 0x00, 0xFF, 0x7F];
        let samples = pcm_to_f32(&pcm);
        assert_eq!(samples.len(), 3);
        assert!((samples[0] + 1.0).abs() < 1e-4);
        assert_eq!(samples[1], 0.0);
        assert!((samples[2] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        let pcm = [0x00, 0x00, 0x01];
        assert_eq!(pcm_to_f32(&pcm).len(), 1);
    }
}
