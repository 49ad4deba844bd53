//! The play-state machine (§4.2) shared by the control host and the audio
//! backend, plus the broadcast events that drive its transitions.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PlayState {
    Stop = 0,
    RealtimePerformanceStarted,
    RealtimePerformancePaused,
    RealtimePerformanceResumed,
    RealtimePerformanceEnded,
    RenderStarted,
    RenderEnded,
}

impl PlayState {
    /// States from which `stop()` is legal (§3.5).
    pub fn is_stopable(self) -> bool {
        matches!(
            self,
            PlayState::RealtimePerformanceStarted
                | PlayState::RenderStarted
                | PlayState::RealtimePerformancePaused
                | PlayState::RealtimePerformanceResumed
        )
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => PlayState::Stop,
            1 => PlayState::RealtimePerformanceStarted,
            2 => PlayState::RealtimePerformancePaused,
            3 => PlayState::RealtimePerformanceResumed,
            4 => PlayState::RealtimePerformanceEnded,
            5 => PlayState::RenderStarted,
            6 => PlayState::RenderEnded,
            _ => unreachable!("invalid play state tag {v}"),
        }
    }
}

/// Cross-thread mirror of the canonical play state, kept by the control
/// host and read by the audio backend without a lock.
pub struct PlayStateCell(AtomicU8);

impl PlayStateCell {
    pub fn new(initial: PlayState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> PlayState {
        PlayState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: PlayState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

impl Default for PlayStateCell {
    fn default() -> Self {
        Self::new(PlayState::Stop)
    }
}

/// A play-state transition as broadcast worker -> host (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayStateChange(pub PlayState);

/// A log/diagnostic line broadcast worker -> host.
#[derive(Debug, Clone)]
pub struct LogMessage(pub String);

/// Everything that can arrive on the worker -> host broadcast channel
/// (§4.5: "a single handler dispatches inbound messages... messages carry
/// either `{log}` ... or `{playStateChange}`").
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    Log(LogMessage),
    PlayStateChange(PlayStateChange),
}

#[cfg(test)]
mod play_state_tests {
    use super::*;

    #[test]
    fn stopable_set_matches_specification() {
        assert!(PlayState::RealtimePerformanceStarted.is_stopable());
        assert!(PlayState::RenderStarted.is_stopable());
        assert!(PlayState::RealtimePerformancePaused.is_stopable());
        assert!(PlayState::RealtimePerformanceResumed.is_stopable());
        assert!(!PlayState::Stop.is_stopable());
        assert!(!PlayState::RealtimePerformanceEnded.is_stopable());
        assert!(!PlayState::RenderEnded.is_stopable());
    }

    #[test]
    fn cell_round_trips() {
        let cell = PlayStateCell::new(PlayState::Stop);
        cell.set(PlayState::RealtimePerformanceStarted);
        assert_eq!(cell.get(), PlayState::RealtimePerformanceStarted);
    }
}
