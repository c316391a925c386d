//! Microphone audio capture using cpal.
//!
//! Captures at the device's native sample rate, converts to mono, downsamples
//! to the configured pipeline rate, and emits fixed-size s16le chunks over a
//! bounded channel. The cpal callback runs on the driver's audio thread and
//! must never block: chunks are posted with `try_send` and dropped under
//! back-pressure.

use bytes::Bytes;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AudioConfig;
use crate::error::{AuraError, Result};

/// Audio capture from the system microphone via cpal.
pub struct MicCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    target_chunk_frames: usize,
}

impl MicCapture {
    /// Create a capture instance for the configured device index.
    ///
    /// An invalid index falls back to the system default input device.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = match config.mic_device_index {
            Some(index) => {
                let selected = host
                    .input_devices()
                    .map_err(|e| AuraError::Audio(format!("cannot enumerate devices: {e}")))?
                    .nth(index);
                match selected {
                    Some(device) => device,
                    None => {
                        warn!("input device index {index} not found, using default");
                        host.default_input_device()
                            .ok_or_else(|| AuraError::Audio("no default input device".into()))?
                    }
                }
            }
            None => host
                .default_input_device()
                .ok_or_else(|| AuraError::Audio("no default input device".into()))?,
        };

        let default_config = device
            .default_input_config()
            .map_err(|e| AuraError::Audio(format!("no default input config: {e}")))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();
        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "input config: native {}Hz x{} -> target {}Hz mono",
            native_rate, native_channels, config.sample_rate
        );

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.sample_rate,
            target_chunk_frames: config.chunk_size,
        })
    }

    /// Run the capture loop, posting s16le chunks to `tx` until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the input stream cannot be created or started.
    pub async fn run(&self, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let chunk_frames = self.target_chunk_frames.max(1);
        let mut pending: VecDeque<f32> = VecDeque::with_capacity(chunk_frames * 4);

        // Rate-limited drop reporting from the audio callback thread.
        let dropped = AtomicU64::new(0);
        let last_report_ms = AtomicU64::new(0);
        let tx_closed = AtomicBool::new(false);

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = if native_rate != target_rate {
                        downsample(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };
                    pending.extend(samples);

                    while pending.len() >= chunk_frames {
                        if tx_closed.load(Ordering::Relaxed) {
                            pending.clear();
                            break;
                        }
                        let mut pcm = Vec::with_capacity(chunk_frames * 2);
                        for _ in 0..chunk_frames {
                            if let Some(s) = pending.pop_front() {
                                let v = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
                                pcm.extend_from_slice(&v.to_le_bytes());
                            }
                        }
                        match tx.try_send(Bytes::from(pcm)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                tx_closed.store(true, Ordering::Relaxed);
                            }
                        }

                        let now_ms = std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0);
                        let last = last_report_ms.load(Ordering::Relaxed);
                        if now_ms.saturating_sub(last) >= 2_000
                            && last_report_ms
                                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                                .is_ok()
                        {
                            let n = dropped.swap(0, Ordering::Relaxed);
                            if n > 0 {
                                debug!("audio channel full, dropped {n} chunks (last 2s)");
                            }
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| AuraError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| AuraError::Audio(format!("failed to start input stream: {e}")))?;

        info!("audio capture started");
        cancel.cancelled().await;
        drop(stream);
        info!("audio capture stopped");
        Ok(())
    }
}

/// Average interleaved multi-channel audio down to mono.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation downsampler. Sufficient for speech: energy is below
/// 8 kHz, so no anti-alias filter is needed for 48k -> 16k.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;
        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        output.push(sample as f32);
    }
    output
}
