//! Conversation turn state machine.
//!
//! Six states with a fixed transition table; every transition goes through a
//! named operation so invalid moves fail fast. The VAD threshold is derived
//! from the current state: elevated while the assistant is speaking to reduce
//! self-triggering on playback audio.

use crate::error::{AuraError, Result};
use std::sync::Mutex;

/// Turn state of the pipeline. Exactly one state exists per pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not listening; waiting for speech.
    Idle,
    /// Speech detected; forwarding audio to STT.
    Listening,
    /// Utterance complete; generating a response.
    Processing,
    /// Streaming synthesized audio to the player.
    Speaking,
    /// Reply finished; mic hot until the active timeout fires.
    Active,
    /// User barged in mid-reply; cancellation in progress.
    Interrupted,
}

impl State {
    /// Lower-case state name for logs and the HTTP surface.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Active => "active",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn transition_allowed(from: State, to: State) -> bool {
    matches!(
        (from, to),
        (State::Idle, State::Listening)
            | (State::Listening, State::Processing)
            | (State::Processing, State::Speaking)
            | (State::Speaking, State::Active)
            | (State::Speaking, State::Interrupted)
            | (State::Speaking, State::Processing)
            | (State::Active, State::Idle)
            | (State::Active, State::Listening)
            | (State::Interrupted, State::Listening)
    )
}

/// Thread-safe state machine with guarded transitions.
///
/// All operations are synchronous and therefore atomic between suspension
/// points of the orchestrator's event loop.
#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<State>,
    vad_normal: f32,
    vad_speaking: f32,
}

impl StateMachine {
    pub fn new(vad_threshold_normal: f32, vad_threshold_speaking: f32) -> Self {
        Self {
            state: Mutex::new(State::Idle),
            vad_normal: vad_threshold_normal,
            vad_speaking: vad_threshold_speaking,
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// VAD threshold derived from the current state: elevated while speaking.
    pub fn vad_threshold(&self) -> f32 {
        if self.state() == State::Speaking {
            self.vad_speaking
        } else {
            self.vad_normal
        }
    }

    fn transition(&self, to: State) -> Result<()> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !transition_allowed(*guard, to) {
            return Err(AuraError::InvalidTransition { from: *guard, to });
        }
        *guard = to;
        Ok(())
    }

    /// Speech detected: `Idle|Active -> Listening`, `Speaking -> Interrupted`.
    pub fn on_speech_detected(&self) -> Result<()> {
        let from = self.state();
        match from {
            State::Idle | State::Active => self.transition(State::Listening),
            State::Speaking => self.transition(State::Interrupted),
            _ => Err(AuraError::InvalidTransition {
                from,
                to: State::Listening,
            }),
        }
    }

    /// Utterance complete: `Listening -> Processing`.
    pub fn on_utterance_complete(&self) -> Result<()> {
        self.transition(State::Processing)
    }

    /// TTS started: `Processing -> Speaking`.
    pub fn on_tts_started(&self) -> Result<()> {
        self.transition(State::Speaking)
    }

    /// TTS complete (strict): `Speaking -> Active`, fails otherwise.
    pub fn on_tts_complete(&self) -> Result<()> {
        self.transition(State::Active)
    }

    /// TTS complete (try): `Speaking -> Active`, returns `false` if the state
    /// changed (e.g. a concurrent barge-in moved it to `Interrupted`) since
    /// streaming began.
    pub fn try_on_tts_complete(&self) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *guard == State::Speaking {
            *guard = State::Active;
            true
        } else {
            false
        }
    }

    /// Active timeout fired: `Active -> Idle`.
    pub fn on_active_timeout(&self) -> Result<()> {
        self.transition(State::Idle)
    }

    /// Barge-in handled: `Interrupted -> Listening`.
    pub fn on_interrupt_handled(&self) -> Result<()> {
        self.transition(State::Listening)
    }

    /// LLM requested another tool iteration: `Speaking -> Processing`.
    pub fn on_tool_iteration(&self) -> Result<()> {
        self.transition(State::Processing)
    }

    /// Recovery escape hatch: set the state directly, bypassing the
    /// transition table. Used only by the orchestrator's failure paths
    /// (STT connect fallback to `Idle`, exception recovery to `Active`).
    pub fn force(&self, to: State) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *guard = to;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn machine() -> StateMachine {
        StateMachine::new(0.5, 0.8)
    }

    fn drive_to_speaking(sm: &StateMachine) {
        sm.on_speech_detected().unwrap();
        sm.on_utterance_complete().unwrap();
        sm.on_tts_started().unwrap();
    }

    #[test]
    fn initial_state_is_idle() {
        assert_eq!(machine().state(), State::Idle);
    }

    #[test]
    fn speech_detected_in_idle_goes_to_listening() {
        let sm = machine();
        sm.on_speech_detected().unwrap();
        assert_eq!(sm.state(), State::Listening);
    }

    #[test]
    fn full_happy_path() {
        let sm = machine();
        drive_to_speaking(&sm);
        assert_eq!(sm.state(), State::Speaking);
        sm.on_tts_complete().unwrap();
        assert_eq!(sm.state(), State::Active);
        sm.on_active_timeout().unwrap();
        assert_eq!(sm.state(), State::Idle);
    }

    #[test]
    fn speech_detected_in_active_goes_to_listening() {
        let sm = machine();
        drive_to_speaking(&sm);
        sm.on_tts_complete().unwrap();
        sm.on_speech_detected().unwrap();
        assert_eq!(sm.state(), State::Listening);
    }

    #[test]
    fn barge_in_goes_to_interrupted_then_listening() {
        let sm = machine();
        drive_to_speaking(&sm);
        sm.on_speech_detected().unwrap();
        assert_eq!(sm.state(), State::Interrupted);
        sm.on_interrupt_handled().unwrap();
        assert_eq!(sm.state(), State::Listening);
    }

    #[test]
    fn tool_iteration_returns_to_processing() {
        let sm = machine();
        drive_to_speaking(&sm);
        sm.on_tool_iteration().unwrap();
        assert_eq!(sm.state(), State::Processing);
    }

    #[test]
    fn invalid_transition_fails() {
        let sm = machine();
        let err = sm.on_utterance_complete().unwrap_err();
        assert!(matches!(
            err,
            AuraError::InvalidTransition {
                from: State::Idle,
                to: State::Processing
            }
        ));
        assert_eq!(sm.state(), State::Idle);
    }

    #[test]
    fn speech_detected_in_processing_fails() {
        let sm = machine();
        sm.on_speech_detected().unwrap();
        sm.on_utterance_complete().unwrap();
        assert!(sm.on_speech_detected().is_err());
    }

    #[test]
    fn try_tts_complete_succeeds_from_speaking() {
        let sm = machine();
        drive_to_speaking(&sm);
        assert!(sm.try_on_tts_complete());
        assert_eq!(sm.state(), State::Active);
    }

    #[test]
    fn try_tts_complete_returns_false_after_interrupt() {
        let sm = machine();
        drive_to_speaking(&sm);
        sm.on_speech_detected().unwrap();
        assert!(!sm.try_on_tts_complete());
        assert_eq!(sm.state(), State::Interrupted);
    }

    #[test]
    fn vad_threshold_elevated_while_speaking() {
        let sm = machine();
        assert_eq!(sm.vad_threshold(), 0.5);
        drive_to_speaking(&sm);
        assert_eq!(sm.vad_threshold(), 0.8);
        sm.on_tts_complete().unwrap();
        assert_eq!(sm.vad_threshold(), 0.5);
    }

    #[test]
    fn force_bypasses_table() {
        let sm = machine();
        drive_to_speaking(&sm);
        sm.force(State::Idle);
        assert_eq!(sm.state(), State::Idle);
    }
}
