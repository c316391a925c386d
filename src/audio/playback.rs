//! PCM playback through a local `paplay` subprocess.
//!
//! Lifecycle: `start -> play_chunk* -> finish` (graceful drain) or `kill`
//! (immediate teardown for barge-in). After `finish`/`kill` the process
//! handle is cleared and subsequent calls are no-ops.

use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::error::{AuraError, Result};

const VALID_FORMATS: [&str; 5] = ["s16le", "s16be", "u8", "float32le", "float32be"];

/// Sink for synthesized PCM frames.
#[async_trait]
pub trait AudioOut: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn play_chunk(&self, data: Bytes) -> Result<()>;
    async fn finish(&self) -> Result<()>;
    async fn kill(&self) -> Result<()>;
}

/// `paplay`-backed PCM player.
pub struct AudioPlayer {
    rate: u32,
    channels: u8,
    format: String,
    process: tokio::sync::Mutex<Option<Child>>,
}

impl AudioPlayer {
    /// Create a player, validating the output parameters.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown format, channel count outside
    /// `{1, 2}`, or a rate outside `[8000, 192000]`.
    pub fn new(rate: u32, channels: u8, format: &str) -> Result<Self> {
        if !VALID_FORMATS.contains(&format) {
            return Err(AuraError::Audio(format!("invalid format: {format}")));
        }
        if !matches!(channels, 1 | 2) {
            return Err(AuraError::Audio(format!("invalid channels: {channels}")));
        }
        if !(8_000..=192_000).contains(&rate) {
            return Err(AuraError::Audio(format!("invalid rate: {rate}")));
        }
        Ok(Self {
            rate,
            channels,
            format: format.to_owned(),
            process: tokio::sync::Mutex::new(None),
        })
    }
}

#[async_trait]
impl AudioOut for AudioPlayer {
    async fn start(&self) -> Result<()> {
        let child = Command::new("paplay")
            .arg(format!("--format={}", self.format))
            .arg(format!("--rate={}", self.rate))
            .arg(format!("--channels={}", self.channels))
            .arg("--raw")
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| AuraError::Audio(format!("failed to spawn paplay: {e}")))?;
        *self.process.lock().await = Some(child);
        Ok(())
    }

    async fn play_chunk(&self, data: Bytes) -> Result<()> {
        let mut guard = self.process.lock().await;
        if let Some(child) = guard.as_mut()
            && let Some(stdin) = child.stdin.as_mut()
        {
            stdin
                .write_all(&data)
                .await
                .map_err(|e| AuraError::Audio(format!("playback write failed: {e}")))?;
        }
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        let mut guard = self.process.lock().await;
        if let Some(mut child) = guard.take() {
            // Closing stdin lets paplay drain its buffer and exit.
            drop(child.stdin.take());
            let _ = child.wait().await;
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        let mut guard = self.process.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }
}
