//! Microphone capture and PCM playback.

pub mod capture;
pub mod playback;

pub use capture::MicCapture;
pub use playback::{AudioOut, AudioPlayer};
