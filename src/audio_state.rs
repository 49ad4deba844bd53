//! The shared `audio_state` vector: one `AtomicI32` per [`AudioStateField`],
//! read and written across the control host, synthesis worker, and audio
//! backend without any lock.
//!
//! Grounded on the bit-cast atomic fields in `gecko_core::stream::SharedState`
//! (pack reference: `enscrypted-gecko/crates/gecko_core/src/stream.rs`) and
//! on the plain `Arc<AtomicU64>` counters the teacher threads through its
//! `RealTimeAudioProcessor` (`realtime_audio.rs`) for cross-thread stats.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::constants::AudioStateField;

/// Atomically-accessed shared state vector.
///
/// Every field is a plain 32-bit signed word; ordering is `SeqCst` throughout
/// since this is a coordination structure, not a hot per-sample path — the
/// per-sample path touches the rings, not `audio_state`.
#[derive(Debug)]
pub struct AudioState {
    words: [AtomicI32; AudioStateField::COUNT],
}

impl AudioState {
    /// Build a fresh state vector from the constant template: everything
    /// zero except the sizing fields, which are supplied by the caller at
    /// `initialize` time and never change for the lifetime of the region
    /// (Non-goal: dynamic reconfiguration).
    pub fn from_template(hw_buffer_size: i32, sw_buffer_size: i32) -> Self {
        let state = Self {
            words: std::array::from_fn(|_| AtomicI32::new(0)),
        };
        state.store(AudioStateField::HwBufferSize, hw_buffer_size);
        state.store(AudioStateField::SwBufferSize, sw_buffer_size);
        state
    }

    #[inline]
    pub fn load(&self, field: AudioStateField) -> i32 {
        self.words[field.index()].load(Ordering::SeqCst)
    }

    #[inline]
    pub fn store(&self, field: AudioStateField, value: i32) {
        self.words[field.index()].store(value, Ordering::SeqCst);
    }

    #[inline]
    pub fn fetch_add(&self, field: AudioStateField, delta: i32) -> i32 {
        self.words[field.index()].fetch_add(delta, Ordering::SeqCst)
    }

    #[inline]
    pub fn fetch_sub(&self, field: AudioStateField, delta: i32) -> i32 {
        self.words[field.index()].fetch_sub(delta, Ordering::SeqCst)
    }

    #[inline]
    pub fn compare_exchange(&self, field: AudioStateField, current: i32, new: i32) -> bool {
        self.words[field.index()]
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Zero every field except the sizing fields, which are re-stamped from
    /// the values supplied at construction. Per Design Note §9: the original
    /// allocates a brand-new state vector on reset; this port instead zeroes
    /// the existing one in place, since backend code never holds a stale
    /// reference across a reset (the backend re-reads the config on the next
    /// `realtimePerformanceStarted`, unchanged from the original's contract).
    pub fn reset_to_template(&self, hw_buffer_size: i32, sw_buffer_size: i32) {
        for field in AudioStateField::ALL {
            self.store(field, 0);
        }
        self.store(AudioStateField::HwBufferSize, hw_buffer_size);
        self.store(AudioStateField::SwBufferSize, sw_buffer_size);
    }

    /// `true` iff every field equals the template for the given sizing.
    /// Used by tests asserting the post-`realtimePerformanceEnded` invariant
    /// from the specification's testable properties.
    pub fn matches_template(&self, hw_buffer_size: i32, sw_buffer_size: i32) -> bool {
        for field in AudioStateField::ALL {
            let expected = match field {
                AudioStateField::HwBufferSize => hw_buffer_size,
                AudioStateField::SwBufferSize => sw_buffer_size,
                _ => 0,
            };
            if self.load(field) != expected {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod audio_state_tests {
    use super::*;

    #[test]
    fn template_zeroes_everything_but_sizing() {
        let state = AudioState::from_template(512, 128);
        assert_eq!(state.load(AudioStateField::HwBufferSize), 512);
        assert_eq!(state.load(AudioStateField::SwBufferSize), 128);
        assert_eq!(state.load(AudioStateField::IsPerforming), 0);
        assert!(state.matches_template(512, 128));
    }

    #[test]
    fn reset_clears_cursors_but_keeps_sizing() {
        let state = AudioState::from_template(512, 128);
        state.store(AudioStateField::IsPerforming, 1);
        state.store(AudioStateField::InputReadIndex, 77);
        state.store(AudioStateField::AvailOutBufs, 200);

        state.reset_to_template(512, 128);

        assert!(state.matches_template(512, 128));
    }

    #[test]
    fn fetch_add_and_sub_are_atomic_round_trips() {
        let state = AudioState::from_template(0, 0);
        state.fetch_add(AudioStateField::AvailOutBufs, 128);
        assert_eq!(state.load(AudioStateField::AvailOutBufs), 128);
        state.fetch_sub(AudioStateField::AvailOutBufs, 48);
        assert_eq!(state.load(AudioStateField::AvailOutBufs), 80);
    }
}
