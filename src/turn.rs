//! Monotonic turn clock for per-turn latency logging.

use std::sync::Mutex;
use std::time::Instant;

/// Marks the start of a conversational turn so log lines can carry a
/// consistent `elapsed_ms` field from speech onset to playback.
#[derive(Debug, Default)]
pub struct TurnClock {
    started: Mutex<Option<Instant>>,
}

impl TurnClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a new turn (overwrites any previous marker).
    pub fn start(&self) {
        if let Ok(mut guard) = self.started.lock() {
            *guard = Some(Instant::now());
        }
    }

    /// Clear the turn marker.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.started.lock() {
            *guard = None;
        }
    }

    /// Milliseconds since the turn started, or 0 when no turn is active.
    pub fn elapsed_ms(&self) -> u64 {
        self.started
            .lock()
            .ok()
            .and_then(|g| g.map(|t| t.elapsed().as_millis() as u64))
            .unwrap_or(0)
    }
}
