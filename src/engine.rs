//! The opaque synthesis engine ABI (§6, "External Interfaces — Engine ABI").
//!
//! Out of scope per §1: the engine itself is a sandboxed collaborator,
//! accessed only through this fixed entry-point set. `MockSynthEngine` is
//! the test double standing in for it, in the same spirit as the teacher's
//! tests exercising pure logic (`AudioFrame`, the jitter buffer) directly
//! rather than a real device/codec.

use crate::callback::{CallbackArgs, CallbackError, CallbackValue};

/// Opcode for one of the engine's "other control/query entry points" not
/// named explicitly in §6 (e.g. `csoundGetVersion`, `csoundGetControlChannel`).
/// The concrete opcode table is engine-specific; this crate only needs FIFO
/// delivery and a stable mapping, which `invoke` provides.
pub trait SynthEngine: Send {
    /// One-time instantiation of the engine (distinct from `initialize`,
    /// which prepares it for a particular performance).
    fn create(&mut self) -> Result<(), i32>;

    fn initialize(&mut self) -> Result<(), i32>;

    /// Render one `ksmps`-sized block. Returns 0 to continue, non-zero when
    /// the engine has reached the end of its performance.
    fn perform_block(&mut self) -> i32;

    fn stop(&mut self);

    fn reset(&mut self);

    /// Engine-owned input buffer, `ksmps * nchnls_i` samples, scaled to
    /// `±0dBFS`.
    fn spin(&mut self) -> &mut [f64];

    /// Engine-owned output buffer, `ksmps * nchnls` samples, scaled to
    /// `±0dBFS`.
    fn spout(&self) -> &[f64];

    fn sample_rate(&self) -> i32;
    fn ksmps(&self) -> i32;
    fn nchnls(&self) -> i32;
    fn nchnls_i(&self) -> i32;
    fn zero_db_fs(&self) -> f64;

    /// Name of the configured input device/bus; the worker only queries
    /// `nchnls_i` when this contains `"adc"` (§4.3 Setup).
    fn input_name(&self) -> String;

    fn is_requesting_rtmidi(&self) -> bool;

    fn push_midi(&mut self, status: i32, data1: i32, data2: i32);

    /// Dispatch one of the enumerated "other" control/query entry points by
    /// opcode, used by both the direct worker proxy path and the callback
    /// RPC drain (§4.4).
    fn invoke(&mut self, opcode: u32, args: &CallbackArgs) -> Result<CallbackValue, CallbackError>;

    /// Trailing diagnostic lines queued since the last drain. The worker
    /// drains these once more right before broadcasting
    /// `realtimePerformanceEnded`/`renderEnded` (Design Note §9: the
    /// original's `setTimeout(..., 0)` lets trailing log messages flush
    /// before the end state fires; this is that step made explicit).
    fn drain_log_lines(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// Well-known opcodes `MockSynthEngine` understands; a real engine binding
/// would have a much larger, engine-specific table.
pub mod opcodes {
    pub const GET_VERSION: u32 = 1;
    pub const GET_CHANNEL: u32 = 2;
    pub const SET_CHANNEL: u32 = 3;
}

/// A deterministic stand-in for the real engine: copies `spin` to `spout`
/// each block (used by the round-trip law test in §8) unless
/// `silence_output` is set, in which case it emits silence and simply
/// counts blocks performed.
pub struct MockSynthEngine {
    sample_rate: i32,
    ksmps: i32,
    nchnls: i32,
    nchnls_i: i32,
    zero_db_fs: f64,
    input_name: String,
    wants_rtmidi: bool,

    spin: Vec<f64>,
    spout: Vec<f64>,
    blocks_performed: u64,
    end_after_blocks: Option<u64>,
    received_midi: Vec<(i32, i32, i32)>,
    channels: std::collections::HashMap<String, f64>,
    silence_output: bool,
}

impl MockSynthEngine {
    pub fn new(sample_rate: i32, ksmps: i32, nchnls: i32, nchnls_i: i32) -> Self {
        Self {
            sample_rate,
            ksmps,
            nchnls,
            nchnls_i,
            zero_db_fs: 32768.0,
            input_name: "adc".to_string(),
            wants_rtmidi: false,
            spin: vec![0.0; (ksmps * nchnls_i.max(1)) as usize],
            spout: vec![0.0; (ksmps * nchnls) as usize],
            blocks_performed: 0,
            end_after_blocks: None,
            received_midi: Vec::new(),
            channels: std::collections::HashMap::new(),
            silence_output: false,
        }
    }

    pub fn wanting_rtmidi(mut self) -> Self {
        self.wants_rtmidi = true;
        self
    }

    pub fn ending_after(mut self, blocks: u64) -> Self {
        self.end_after_blocks = Some(blocks);
        self
    }

    pub fn silent(mut self) -> Self {
        self.silence_output = true;
        self
    }

    pub fn received_midi(&self) -> &[(i32, i32, i32)] {
        &self.received_midi
    }

    pub fn blocks_performed(&self) -> u64 {
        self.blocks_performed
    }
}

impl SynthEngine for MockSynthEngine {
    fn create(&mut self) -> Result<(), i32> {
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), i32> {
        Ok(())
    }

    fn perform_block(&mut self) -> i32 {
        if self.silence_output {
            self.spout.fill(0.0);
        } else {
            let copy_len = self.spout.len().min(self.spin.len());
            self.spout[..copy_len].copy_from_slice(&self.spin[..copy_len]);
            for sample in &mut self.spout[copy_len..] {
                *sample = 0.0;
            }
        }
        self.blocks_performed += 1;
        match self.end_after_blocks {
            Some(n) if self.blocks_performed >= n => 1,
            _ => 0,
        }
    }

    fn stop(&mut self) {}

    fn reset(&mut self) {
        self.blocks_performed = 0;
        self.spin.fill(0.0);
        self.spout.fill(0.0);
    }

    fn spin(&mut self) -> &mut [f64] {
        &mut self.spin
    }

    fn spout(&self) -> &[f64] {
        &self.spout
    }

    fn sample_rate(&self) -> i32 {
        self.sample_rate
    }

    fn ksmps(&self) -> i32 {
        self.ksmps
    }

    fn nchnls(&self) -> i32 {
        self.nchnls
    }

    fn nchnls_i(&self) -> i32 {
        self.nchnls_i
    }

    fn zero_db_fs(&self) -> f64 {
        self.zero_db_fs
    }

    fn input_name(&self) -> String {
        self.input_name.clone()
    }

    fn is_requesting_rtmidi(&self) -> bool {
        self.wants_rtmidi
    }

    fn push_midi(&mut self, status: i32, data1: i32, data2: i32) {
        self.received_midi.push((status, data1, data2));
    }

    fn invoke(&mut self, opcode: u32, args: &CallbackArgs) -> Result<CallbackValue, CallbackError> {
        match opcode {
            opcodes::GET_VERSION => Ok(CallbackValue::Int(6_190)),
            opcodes::GET_CHANNEL => {
                let name = args.string.clone().ok_or(CallbackError::TruncatedArguments)?;
                Ok(CallbackValue::Float(*self.channels.get(&name).unwrap_or(&0.0)))
            }
            opcodes::SET_CHANNEL => {
                let name = args.string.clone().ok_or(CallbackError::TruncatedArguments)?;
                let value = args.floats.as_ref().and_then(|f| f.first()).copied().unwrap_or(0.0);
                self.channels.insert(name, value);
                Ok(CallbackValue::None)
            }
            other => Err(CallbackError::UnknownOpcode(other)),
        }
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;

    #[test]
    fn pass_through_copies_spin_to_spout() {
        let mut engine = MockSynthEngine::new(48_000, 32, 2, 2);
        engine.spin()[0] = 1234.0;
        engine.perform_block();
        assert_eq!(engine.spout()[0], 1234.0);
    }

    #[test]
    fn ends_after_configured_block_count() {
        let mut engine = MockSynthEngine::new(48_000, 32, 2, 2).ending_after(2);
        assert_eq!(engine.perform_block(), 0);
        assert_eq!(engine.perform_block(), 1);
    }

    #[test]
    fn invoke_rejects_unknown_opcode() {
        let mut engine = MockSynthEngine::new(48_000, 32, 2, 2);
        let result = engine.invoke(999, &CallbackArgs::default());
        assert_eq!(result, Err(CallbackError::UnknownOpcode(999)));
    }

    #[test]
    fn invoke_round_trips_a_named_channel() {
        let mut engine = MockSynthEngine::new(48_000, 32, 2, 2);
        let set_args = CallbackArgs::default().with_string("gain").with_floats(vec![0.75]);
        engine.invoke(opcodes::SET_CHANNEL, &set_args).unwrap();

        let get_args = CallbackArgs::default().with_string("gain");
        let value = engine.invoke(opcodes::GET_CHANNEL, &get_args).unwrap();
        assert_eq!(value, CallbackValue::Float(0.75));
    }
}
