//! The two flat audio rings (`in_ring`, `out_ring`).
//!
//! `std` has no `AtomicF64`, so samples are stored as `AtomicU64` holding the
//! IEEE-754 bit pattern — the same trick `gecko_core::stream::SharedState`
//! uses for its `f32` peak meters and master-volume word
//! (`enscrypted-gecko/crates/gecko_core/src/stream.rs`), scaled up to `f64`
//! here to match the specification's sample width.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::constants::{MAX_CHANNELS, MAX_HARDWARE_BUFFER_SIZE};

/// A flat, channel-major ring of `f64` samples normalized to `[-1.0, 1.0]`.
///
/// Channel `c` occupies `[c * MAX_HARDWARE_BUFFER_SIZE, (c+1) * MAX_HARDWARE_BUFFER_SIZE)`.
/// Only `hw_buffer_size` frames per channel are meaningful in a given
/// performance; the rest of the allocation is unused headroom sized for the
/// largest layout this crate supports.
pub struct AudioRing {
    slots: Vec<AtomicU64>,
}

impl AudioRing {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_CHANNELS * MAX_HARDWARE_BUFFER_SIZE);
        slots.resize_with(MAX_CHANNELS * MAX_HARDWARE_BUFFER_SIZE, || AtomicU64::new(0));
        Self { slots }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    #[inline]
    fn offset(channel: usize, frame: usize) -> usize {
        channel * MAX_HARDWARE_BUFFER_SIZE + frame
    }

    #[inline]
    pub fn load(&self, channel: usize, frame: usize) -> f64 {
        f64::from_bits(self.slots[Self::offset(channel, frame)].load(Ordering::SeqCst))
    }

    #[inline]
    pub fn store(&self, channel: usize, frame: usize, value: f64) {
        self.slots[Self::offset(channel, frame)].store(value.to_bits(), Ordering::SeqCst);
    }
}

impl Default for AudioRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod ring_tests {
    use super::*;

    #[test]
    fn channels_are_disjoint_ranges() {
        let ring = AudioRing::new();
        ring.store(0, 10, 0.25);
        ring.store(1, 10, -0.5);
        assert_eq!(ring.load(0, 10), 0.25);
        assert_eq!(ring.load(1, 10), -0.5);
    }

    #[test]
    fn default_is_silence() {
        let ring = AudioRing::new();
        assert_eq!(ring.load(3, 100), 0.0);
    }
}
