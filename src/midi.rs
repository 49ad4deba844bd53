//! The MIDI event ring: host-produced, worker-consumed, three `i32` words
//! per event (`status`, `data1`, `data2`).

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::constants::{MIDI_BUFFER_PAYLOAD_SIZE, MIDI_BUFFER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub status: i32,
    pub data1: i32,
    pub data2: i32,
}

pub struct MidiRing {
    slots: Vec<AtomicI32>,
}

impl MidiRing {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MIDI_BUFFER_SIZE);
        slots.resize_with(MIDI_BUFFER_SIZE, || AtomicI32::new(0));
        Self { slots }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Append one event at the given absolute slot index (already computed
    /// by the caller as `(avail * payload_size + index) mod MIDI_BUFFER_SIZE`,
    /// per §4.1's `on_midi` formula).
    pub fn write_at(&self, slot: usize, event: MidiEvent) {
        self.slots[slot].store(event.status, Ordering::SeqCst);
        self.slots[(slot + 1) % MIDI_BUFFER_SIZE].store(event.data1, Ordering::SeqCst);
        self.slots[(slot + 2) % MIDI_BUFFER_SIZE].store(event.data2, Ordering::SeqCst);
    }

    pub fn read_at(&self, slot: usize) -> MidiEvent {
        MidiEvent {
            status: self.slots[slot].load(Ordering::SeqCst),
            data1: self.slots[(slot + 1) % MIDI_BUFFER_SIZE].load(Ordering::SeqCst),
            data2: self.slots[(slot + 2) % MIDI_BUFFER_SIZE].load(Ordering::SeqCst),
        }
    }

    pub const fn payload_size() -> usize {
        MIDI_BUFFER_PAYLOAD_SIZE
    }

    pub const fn capacity_events() -> usize {
        MIDI_BUFFER_SIZE / MIDI_BUFFER_PAYLOAD_SIZE
    }
}

impl Default for MidiRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod midi_ring_tests {
    use super::*;

    #[test]
    fn round_trips_an_event() {
        let ring = MidiRing::new();
        ring.write_at(0, MidiEvent { status: 0x90, data1: 60, data2: 100 });
        assert_eq!(ring.read_at(0), MidiEvent { status: 0x90, data1: 60, data2: 100 });
    }

    #[test]
    fn wraps_at_buffer_end() {
        let ring = MidiRing::new();
        let last_slot = MIDI_BUFFER_SIZE - MIDI_BUFFER_PAYLOAD_SIZE;
        ring.write_at(last_slot, MidiEvent { status: 0x80, data1: 1, data2: 2 });
        assert_eq!(ring.read_at(last_slot), MidiEvent { status: 0x80, data1: 1, data2: 2 });
    }
}
