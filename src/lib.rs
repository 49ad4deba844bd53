//! # synth-transport
//!
//! A lock-free, shared-memory transport bridging a sandboxed real-time
//! synthesis engine to a host-style audio backend. Three cooperating
//! agents share a set of flat, atomically-accessed buffers with no mutex
//! on the audio-thread path:
//!
//! - **Control host** ([`Transport`]): owns the shared region, spawns the
//!   synthesis worker, and exposes the public operation namespace (start,
//!   stop, pause, resume, MIDI input, callback RPC, play-state/log
//!   callback registration).
//! - **Synthesis worker**: a dedicated thread running the render loop
//!   against a [`SynthEngine`] implementation, parked on a condvar-backed
//!   doorbell between wakes.
//! - **Audio backend** ([`AudioBackend`]): an external collaborator
//!   producing/consuming frames through the shared rings; [`CpalAudioBackend`]
//!   is the reference `cpal`-based implementation.
//!
//! ## Architecture
//!
//! - [`constants`]: shared-memory sizing constants and the `audio_state`
//!   field table.
//! - [`audio_state`]: the atomic `audio_state` word vector.
//! - [`rings`]: the two flat `f64` audio rings (`in_ring`, `out_ring`).
//! - [`midi`]: the MIDI event ring.
//! - [`callback`]: the callback RPC protocol (request/reply rings, argument
//!   encoding).
//! - [`play_state`]: the play-state machine and broadcast message types.
//! - [`doorbell`]: the condvar-backed wait/notify primitives standing in
//!   for `Atomics.wait`/`Atomics.notify`.
//! - [`engine`]: the [`SynthEngine`] ABI boundary and [`MockSynthEngine`]
//!   test double.
//! - [`backend`]: the [`AudioBackend`] trait and its `cpal` reference
//!   implementation.
//! - [`worker`]: the synthesis render loop.
//! - [`transport`]: the control host façade.
//! - [`midi_source`]: an optional polling adapter feeding `on_midi`.
//! - [`config`]: persisted transport settings.
//! - [`error`]: the crate's error type.

pub mod audio_state;
pub mod backend;
pub mod callback;
pub mod config;
pub mod constants;
pub mod doorbell;
pub mod engine;
pub mod error;
pub mod midi;
pub mod midi_source;
pub mod play_state;
pub mod rings;
pub mod transport;
pub mod worker;

pub use audio_state::AudioState;
pub use backend::{AudioBackend, CpalAudioBackend, NullAudioBackend, RealtimeConfig};
pub use callback::{CallbackArgs, CallbackError, CallbackValue};
pub use config::{ConfigManager, TransportSettings};
pub use engine::{MockSynthEngine, SynthEngine};
pub use error::{TransportError, TransportResult};
pub use play_state::PlayState;
pub use transport::Transport;
