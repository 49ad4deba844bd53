//! The callback RPC channel (§4.4): how the host calls non-performance
//! engine entry points while the worker holds the render loop.
//!
//! `callback_req_ring` is a flat, fixed-capacity ring of request records;
//! `callback_str_data` and `callback_f64_data` hold the variable-length
//! string/float-array payloads those records point into. The specification
//! leaves the exact record framing as an open question ("prepend an explicit
//! length word, or bound arguments to a fixed record size"); this port picks
//! the former — every string/float-array payload is stored as an explicit
//! length word followed by its data, the same framing the teacher's
//! `network` module uses for its variable-length UDP payloads.

use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::constants::{CALLBACK_DATA_BUFFER_SIZE, CALLBACK_REQUEST_SLOTS};

const HEADER_WORDS: usize = 10;
// header layout, one record: [uid_lo, uid_hi, opcode, int0..int3, flags, str_offset, f64_offset]
const FLAG_HAS_STRING: i32 = 0b01;
const FLAG_HAS_FLOATS: i32 = 0b10;
const NO_OFFSET: i32 = -1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallbackError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("argument region truncated")]
    TruncatedArguments,
    #[error("callback ring buffer overflow")]
    BufferOverflow,
    #[error("render loop ended before this call was serviced")]
    Terminal,
}

/// Inline + out-of-line arguments for one callback request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackArgs {
    pub ints: [i32; 4],
    pub string: Option<String>,
    pub floats: Option<Vec<f64>>,
}

impl CallbackArgs {
    pub fn with_ints(ints: [i32; 4]) -> Self {
        Self { ints, ..Default::default() }
    }

    pub fn with_string(mut self, s: impl Into<String>) -> Self {
        self.string = Some(s.into());
        self
    }

    pub fn with_floats(mut self, floats: Vec<f64>) -> Self {
        self.floats = Some(floats);
        self
    }
}

/// Return value of a serviced callback, or the error tag from §4.4.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackValue {
    None,
    Int(i32),
    Float(f64),
    FloatArray(Vec<f64>),
    Str(String),
    Error(CallbackError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallbackRequest {
    pub uid: u64,
    pub opcode: u32,
    pub args: CallbackArgs,
}

/// Posted on the worker -> host reply channel (§4.4, §6): `{uid, value}`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackReply {
    pub uid: u64,
    pub value: CallbackValue,
}

/// The three shared callback buffers plus the bookkeeping needed for a
/// single-producer (host), single-consumer (worker) discipline.
pub struct CallbackRing {
    header: Vec<AtomicI32>,
    write_slot: AtomicUsize,
    read_slot: AtomicUsize,
    pending: AtomicUsize,

    str_data: Vec<AtomicI32>, // bytes widened to i32 slots for atomic convenience
    str_cursor: AtomicUsize,

    f64_data: Vec<AtomicU64>, // bit-cast f64 slots
    f64_cursor: AtomicUsize,
}

impl CallbackRing {
    pub fn new() -> Self {
        let mut header = Vec::with_capacity(CALLBACK_REQUEST_SLOTS * HEADER_WORDS);
        header.resize_with(CALLBACK_REQUEST_SLOTS * HEADER_WORDS, || AtomicI32::new(0));

        let mut str_data = Vec::with_capacity(CALLBACK_DATA_BUFFER_SIZE);
        str_data.resize_with(CALLBACK_DATA_BUFFER_SIZE, || AtomicI32::new(0));

        let mut f64_data = Vec::with_capacity(CALLBACK_DATA_BUFFER_SIZE);
        f64_data.resize_with(CALLBACK_DATA_BUFFER_SIZE, || AtomicU64::new(0));

        Self {
            header,
            write_slot: AtomicUsize::new(0),
            read_slot: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            str_data,
            str_cursor: AtomicUsize::new(0),
            f64_data,
            f64_cursor: AtomicUsize::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Host-side enqueue. Single producer: callers must serialize among
    /// themselves (the control host façade does this with an internal
    /// mutex — §4.1, the host is not on the real-time path so this is not a
    /// lock-free violation).
    pub fn enqueue(&self, uid: u64, opcode: u32, args: &CallbackArgs) -> Result<(), CallbackError> {
        if self.pending.load(Ordering::SeqCst) >= CALLBACK_REQUEST_SLOTS {
            return Err(CallbackError::BufferOverflow);
        }

        let str_offset = match &args.string {
            Some(s) => Some(self.write_string(s)?),
            None => None,
        };
        let f64_offset = match &args.floats {
            Some(f) => Some(self.write_floats(f)?),
            None => None,
        };

        let slot = self.write_slot.fetch_add(1, Ordering::SeqCst) % CALLBACK_REQUEST_SLOTS;
        let base = slot * HEADER_WORDS;
        self.header[base].store((uid & 0xFFFF_FFFF) as i32, Ordering::SeqCst);
        self.header[base + 1].store((uid >> 32) as i32, Ordering::SeqCst);
        self.header[base + 2].store(opcode as i32, Ordering::SeqCst);
        for (i, v) in args.ints.iter().enumerate() {
            self.header[base + 3 + i].store(*v, Ordering::SeqCst);
        }
        let mut flags = 0;
        if str_offset.is_some() {
            flags |= FLAG_HAS_STRING;
        }
        if f64_offset.is_some() {
            flags |= FLAG_HAS_FLOATS;
        }
        self.header[base + 7].store(flags, Ordering::SeqCst);
        self.header[base + 8].store(str_offset.map(|o| o as i32).unwrap_or(NO_OFFSET), Ordering::SeqCst);
        self.header[base + 9].store(f64_offset.map(|o| o as i32).unwrap_or(NO_OFFSET), Ordering::SeqCst);

        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Worker-side drain: pop every record enqueued since the last drain, in
    /// FIFO order. Called once per wake (§4.3 step 4).
    pub fn drain(&self) -> Vec<CallbackRequest> {
        let mut out = Vec::new();
        loop {
            let pending = self.pending.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            if self
                .pending
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            let slot = self.read_slot.fetch_add(1, Ordering::SeqCst) % CALLBACK_REQUEST_SLOTS;
            let base = slot * HEADER_WORDS;
            let uid_lo = self.header[base].load(Ordering::SeqCst) as u32 as u64;
            let uid_hi = self.header[base + 1].load(Ordering::SeqCst) as u32 as u64;
            let uid = uid_lo | (uid_hi << 32);
            let opcode = self.header[base + 2].load(Ordering::SeqCst) as u32;
            let mut ints = [0i32; 4];
            for (i, slot_val) in ints.iter_mut().enumerate() {
                *slot_val = self.header[base + 3 + i].load(Ordering::SeqCst);
            }
            let flags = self.header[base + 7].load(Ordering::SeqCst);
            let str_offset = self.header[base + 8].load(Ordering::SeqCst);
            let f64_offset = self.header[base + 9].load(Ordering::SeqCst);

            let string = if flags & FLAG_HAS_STRING != 0 && str_offset != NO_OFFSET {
                self.read_string(str_offset as usize)
            } else {
                None
            };
            let floats = if flags & FLAG_HAS_FLOATS != 0 && f64_offset != NO_OFFSET {
                self.read_floats(f64_offset as usize)
            } else {
                None
            };

            out.push(CallbackRequest {
                uid,
                opcode,
                args: CallbackArgs { ints, string, floats },
            });
        }
        out
    }

    fn write_string(&self, s: &str) -> Result<usize, CallbackError> {
        let bytes = s.as_bytes();
        if bytes.len() + 1 > CALLBACK_DATA_BUFFER_SIZE {
            return Err(CallbackError::BufferOverflow);
        }
        let start = self.str_cursor.fetch_add(bytes.len() + 1, Ordering::SeqCst) % CALLBACK_DATA_BUFFER_SIZE;
        self.str_data[start].store(bytes.len() as i32, Ordering::SeqCst);
        for (i, b) in bytes.iter().enumerate() {
            self.str_data[(start + 1 + i) % CALLBACK_DATA_BUFFER_SIZE].store(*b as i32, Ordering::SeqCst);
        }
        Ok(start)
    }

    fn read_string(&self, start: usize) -> Option<String> {
        let len = self.str_data[start].load(Ordering::SeqCst);
        if len < 0 {
            return None;
        }
        let len = len as usize;
        let mut bytes = Vec::with_capacity(len);
        for i in 0..len {
            bytes.push(self.str_data[(start + 1 + i) % CALLBACK_DATA_BUFFER_SIZE].load(Ordering::SeqCst) as u8);
        }
        String::from_utf8(bytes).ok()
    }

    fn write_floats(&self, floats: &[f64]) -> Result<usize, CallbackError> {
        if floats.len() + 1 > CALLBACK_DATA_BUFFER_SIZE {
            return Err(CallbackError::BufferOverflow);
        }
        let start = self.f64_cursor.fetch_add(floats.len() + 1, Ordering::SeqCst) % CALLBACK_DATA_BUFFER_SIZE;
        self.f64_data[start].store(floats.len() as u64, Ordering::SeqCst);
        for (i, v) in floats.iter().enumerate() {
            self.f64_data[(start + 1 + i) % CALLBACK_DATA_BUFFER_SIZE].store(v.to_bits(), Ordering::SeqCst);
        }
        Ok(start)
    }

    fn read_floats(&self, start: usize) -> Option<Vec<f64>> {
        let len = self.f64_data[start].load(Ordering::SeqCst) as usize;
        let mut floats = Vec::with_capacity(len);
        for i in 0..len {
            floats.push(f64::from_bits(
                self.f64_data[(start + 1 + i) % CALLBACK_DATA_BUFFER_SIZE].load(Ordering::SeqCst),
            ));
        }
        Some(floats)
    }
}

impl Default for CallbackRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod callback_ring_tests {
    use super::*;

    #[test]
    fn round_trips_int_args() {
        let ring = CallbackRing::new();
        ring.enqueue(7, 42, &CallbackArgs::with_ints([1, 2, 3, 4])).unwrap();
        let drained = ring.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].uid, 7);
        assert_eq!(drained[0].opcode, 42);
        assert_eq!(drained[0].args.ints, [1, 2, 3, 4]);
    }

    #[test]
    fn round_trips_string_and_float_array() {
        let ring = CallbackRing::new();
        let args = CallbackArgs::with_ints([0, 0, 0, 0])
            .with_string("i a4 440 0.5")
            .with_floats(vec![1.0, -1.0, 0.25]);
        ring.enqueue(1, 99, &args).unwrap();

        let drained = ring.drain();
        assert_eq!(drained[0].args.string.as_deref(), Some("i a4 440 0.5"));
        assert_eq!(drained[0].args.floats, Some(vec![1.0, -1.0, 0.25]));
    }

    #[test]
    fn drains_in_fifo_order() {
        let ring = CallbackRing::new();
        for uid in 0..5 {
            ring.enqueue(uid, 1, &CallbackArgs::default()).unwrap();
        }
        let drained = ring.drain();
        let uids: Vec<u64> = drained.iter().map(|r| r.uid).collect();
        assert_eq!(uids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn rejects_enqueue_past_capacity() {
        let ring = CallbackRing::new();
        for uid in 0..CALLBACK_REQUEST_SLOTS as u64 {
            ring.enqueue(uid, 0, &CallbackArgs::default()).unwrap();
        }
        let overflow = ring.enqueue(999, 0, &CallbackArgs::default());
        assert_eq!(overflow, Err(CallbackError::BufferOverflow));
    }
}
