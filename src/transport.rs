//! The control host façade (§4.1): the single public entry point embedding
//! code talks to. Owns the shared-memory region, spawns the synthesis
//! worker, and dispatches every operation either as a direct proxy call
//! (when no performance is running) or through the callback RPC ring (when
//! the worker is busy rendering).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use log::warn;

use crate::audio_state::AudioState;
use crate::backend::{AudioBackend, RealtimeConfig};
use crate::callback::{CallbackArgs, CallbackError, CallbackReply, CallbackRing, CallbackValue};
use crate::constants::AudioStateField;
use crate::doorbell::{Doorbell, PauseGate};
use crate::engine::SynthEngine;
use crate::error::{TransportError, TransportResult};
use crate::midi::{MidiEvent, MidiRing};
use crate::play_state::{BroadcastMessage, PlayState, PlayStateCell};
use crate::rings::AudioRing;
use crate::worker::{self, WorkerCommand, WorkerShared};

/// How long a direct/callback round trip waits for its reply before giving
/// up. The specification leaves no timeout on the render loop itself (§5);
/// this only bounds how long the *host* is willing to block on a reply that
/// may never arrive if the worker has already exited.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

type MessageCallback = Box<dyn Fn(&str) + Send + 'static>;
type PlayStateCallback = Box<dyn Fn(PlayState) + Send + 'static>;

/// The control host. One instance owns exactly one shared-memory region and
/// at most one live worker thread (Non-goal: one engine instance per
/// region).
pub struct Transport {
    audio_state: Arc<AudioState>,
    in_ring: Arc<AudioRing>,
    out_ring: Arc<AudioRing>,
    midi_ring: Arc<MidiRing>,
    callback_ring: Arc<CallbackRing>,
    doorbell: Arc<Doorbell>,
    pause_gate: Arc<PauseGate>,

    play_state: Arc<PlayStateCell>,
    backend: Arc<Mutex<Box<dyn AudioBackend>>>,

    pending_engine: Option<Box<dyn SynthEngine>>,
    cmd_tx: Option<Sender<WorkerCommand>>,
    worker_handle: Option<std::thread::JoinHandle<()>>,

    initialized: AtomicBool,
    next_uid: AtomicU64,
    return_queue: Arc<Mutex<HashMap<u64, Sender<CallbackValue>>>>,

    message_callbacks: Arc<Mutex<Vec<MessageCallback>>>,
    play_state_callbacks: Arc<Mutex<Vec<PlayStateCallback>>>,

    dispatcher_handle: Option<std::thread::JoinHandle<()>>,
    reply_handle: Option<std::thread::JoinHandle<()>>,
}

impl Transport {
    /// Build a new, uninitialized transport around the given engine and
    /// audio backend. No threads are started and no shared buffers are
    /// sized for a particular performance until [`Transport::initialize`]
    /// runs.
    pub fn new(engine: Box<dyn SynthEngine>, backend: Box<dyn AudioBackend>) -> Self {
        let audio_state = Arc::new(AudioState::from_template(0, 0));
        Self {
            in_ring: AudioRing::shared(),
            out_ring: AudioRing::shared(),
            midi_ring: MidiRing::shared(),
            callback_ring: CallbackRing::shared(),
            doorbell: Arc::new(Doorbell::new(audio_state.clone())),
            pause_gate: Arc::new(PauseGate::new(audio_state.clone())),
            audio_state,
            play_state: Arc::new(PlayStateCell::default()),
            backend: Arc::new(Mutex::new(backend)),
            pending_engine: Some(engine),
            cmd_tx: None,
            worker_handle: None,
            initialized: AtomicBool::new(false),
            next_uid: AtomicU64::new(1),
            return_queue: Arc::new(Mutex::new(HashMap::new())),
            message_callbacks: Arc::new(Mutex::new(Vec::new())),
            play_state_callbacks: Arc::new(Mutex::new(Vec::new())),
            dispatcher_handle: None,
            reply_handle: None,
        }
    }

    /// One-time setup: create and initialize the engine, size the shared
    /// region, and spawn the worker thread and its two listener threads.
    /// Not re-entrant (§4.1): a second call returns
    /// [`TransportError::AlreadyInitialized`].
    pub fn initialize(
        &mut self,
        hw_buffer_size: i32,
        sw_buffer_size: i32,
    ) -> TransportResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyInitialized);
        }

        let mut engine = self
            .pending_engine
            .take()
            .expect("pending_engine consumed without initialized flag set");
        engine.create().map_err(TransportError::Engine)?;
        engine.initialize().map_err(TransportError::Engine)?;

        self.audio_state.reset_to_template(hw_buffer_size, sw_buffer_size);

        let (cmd_tx, cmd_rx) = channel::unbounded();
        let (broadcast_tx, broadcast_rx) = channel::unbounded();
        let (reply_tx, reply_rx) = channel::unbounded();

        let shared = WorkerShared {
            audio_state: self.audio_state.clone(),
            in_ring: self.in_ring.clone(),
            out_ring: self.out_ring.clone(),
            midi_ring: self.midi_ring.clone(),
            callback_ring: self.callback_ring.clone(),
            doorbell: self.doorbell.clone(),
            pause_gate: self.pause_gate.clone(),
        };

        self.worker_handle = Some(worker::spawn(engine, shared, cmd_rx, broadcast_tx, reply_tx));
        self.cmd_tx = Some(cmd_tx);
        self.dispatcher_handle = Some(self.spawn_broadcast_dispatcher(broadcast_rx));
        self.reply_handle = Some(self.spawn_reply_dispatcher(reply_rx));

        Ok(())
    }

    fn spawn_broadcast_dispatcher(&self, broadcast_rx: Receiver<BroadcastMessage>) -> std::thread::JoinHandle<()> {
        let play_state = self.play_state.clone();
        let audio_state = self.audio_state.clone();
        let backend = self.backend.clone();
        let message_callbacks = self.message_callbacks.clone();
        let play_state_callbacks = self.play_state_callbacks.clone();

        std::thread::Builder::new()
            .name("synth-transport-broadcast".into())
            .spawn(move || {
                while let Ok(message) = broadcast_rx.recv() {
                    match message {
                        BroadcastMessage::Log(log) => {
                            Self::run_message_callbacks(&message_callbacks, &log.0);
                        }
                        BroadcastMessage::PlayStateChange(change) => {
                            play_state.set(change.0);
                            // §4.2/§8: on realtimePerformanceEnded/renderEnded,
                            // audio_state is re-initialized from its constant
                            // template — not deferred to the next start() or
                            // an explicit reset() call.
                            if matches!(
                                change.0,
                                PlayState::RealtimePerformanceEnded | PlayState::RenderEnded
                            ) {
                                let hw = audio_state.load(AudioStateField::HwBufferSize);
                                let sw = audio_state.load(AudioStateField::SwBufferSize);
                                audio_state.reset_to_template(hw, sw);
                            }
                            if let Ok(mut backend) = backend.lock() {
                                if let Err(e) = backend.on_play_state(change.0) {
                                    warn!("audio backend rejected play-state transition {:?}: {e}", change.0);
                                }
                            }
                            Self::run_play_state_callbacks(&play_state_callbacks, change.0);
                        }
                    }
                }
            })
            .expect("failed to spawn broadcast dispatcher thread")
    }

    fn spawn_reply_dispatcher(&self, reply_rx: Receiver<CallbackReply>) -> std::thread::JoinHandle<()> {
        let return_queue = self.return_queue.clone();
        std::thread::Builder::new()
            .name("synth-transport-replies".into())
            .spawn(move || {
                while let Ok(reply) = reply_rx.recv() {
                    let sender = return_queue.lock().unwrap().remove(&reply.uid);
                    if let Some(sender) = sender {
                        let _ = sender.send(reply.value);
                    }
                }
            })
            .expect("failed to spawn reply dispatcher thread")
    }

    fn run_message_callbacks(callbacks: &Mutex<Vec<MessageCallback>>, line: &str) {
        for callback in callbacks.lock().unwrap().iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(line))).is_err() {
                warn!("a message callback panicked while handling a log line");
            }
        }
    }

    fn run_play_state_callbacks(callbacks: &Mutex<Vec<PlayStateCallback>>, state: PlayState) {
        for callback in callbacks.lock().unwrap().iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
                warn!("a play-state callback panicked while handling {state:?}");
            }
        }
    }

    fn require_cmd_tx(&self) -> TransportResult<&Sender<WorkerCommand>> {
        self.cmd_tx.as_ref().ok_or(TransportError::NotInitialized)
    }

    /// §4.2's handshake: read the resolved configuration off the (already
    /// initialized) engine-adjacent fields and hand it to the backend in one
    /// call. Called by [`Transport::start`] before the worker's setup runs.
    fn prepare_realtime_performance(&self, config: RealtimeConfig) -> TransportResult<()> {
        self.backend
            .lock()
            .unwrap()
            .configure(config)
            .map_err(|e| TransportError::Config(e.to_string()))
    }

    /// Begin a realtime performance. Returns the spec-mandated literal `-1`
    /// when called from a non-stopped state, `0` on success (§4.1, §7).
    pub fn start(&self, config: RealtimeConfig) -> TransportResult<i32> {
        if self.play_state.get() != PlayState::Stop {
            return Ok(-1);
        }
        self.prepare_realtime_performance(config)?;
        self.require_cmd_tx()?
            .send(WorkerCommand::StartRealtime(config))
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(0)
    }

    /// Begin an offline render. Same literal-return convention as `start`.
    /// `sink`, if given, receives one interleaved `Vec<f64>` per block
    /// performed, for a caller that wants to capture the render (e.g. to a
    /// WAV file) instead of discarding it.
    pub fn start_render(&self, sink: Option<Sender<Vec<f64>>>) -> TransportResult<i32> {
        if self.play_state.get() != PlayState::Stop {
            return Ok(-1);
        }
        self.require_cmd_tx()?
            .send(WorkerCommand::StartRender { sink })
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(0)
    }

    /// Stop the current performance. Legal only from a stopable state
    /// (§3.5); returns the literal `-1`/`0` convention (§4.1, §7).
    pub fn stop(&self) -> TransportResult<i32> {
        let state = self.play_state.get();
        if !state.is_stopable() {
            return Ok(-1);
        }
        self.audio_state.store(AudioStateField::Stop, 1);
        self.audio_state.store(AudioStateField::IsPerforming, 0);
        if self.audio_state.compare_exchange(AudioStateField::IsPaused, 1, 0) {
            self.pause_gate.notify();
        }
        if state != PlayState::RenderStarted {
            self.doorbell.notify();
        }
        Ok(0)
    }

    pub fn pause(&self) -> TransportResult<()> {
        if self.play_state.get() != PlayState::RealtimePerformanceStarted
            && self.play_state.get() != PlayState::RealtimePerformanceResumed
        {
            return Err(TransportError::InvalidPlayState(self.play_state.get()));
        }
        self.audio_state.store(AudioStateField::IsPaused, 1);
        self.transition_to(PlayState::RealtimePerformancePaused);
        Ok(())
    }

    pub fn resume(&self) -> TransportResult<()> {
        if self.play_state.get() != PlayState::RealtimePerformancePaused {
            return Err(TransportError::InvalidPlayState(self.play_state.get()));
        }
        self.audio_state.store(AudioStateField::IsPaused, 0);
        self.pause_gate.notify();
        self.doorbell.notify();
        self.transition_to(PlayState::RealtimePerformanceResumed);
        Ok(())
    }

    /// Apply a host-initiated play-state transition (pause/resume are
    /// decided synchronously by the host, unlike started/ended which the
    /// worker broadcasts): update the canonical cell, forward to the
    /// backend best-effort, then run every registered callback (§4.2).
    fn transition_to(&self, state: PlayState) {
        self.play_state.set(state);
        if let Ok(mut backend) = self.backend.lock() {
            if let Err(e) = backend.on_play_state(state) {
                warn!("audio backend rejected play-state transition {state:?}: {e}");
            }
        }
        Self::run_play_state_callbacks(&self.play_state_callbacks, state);
    }

    /// §4.1/§9: if currently in a stopable state, first stops the
    /// performance (queuing the engine-reset command behind whatever
    /// `StartRealtime`/`StartRender` loop is still winding down, so the
    /// engine always sees `stop()` before `reset()`); then forwards a reset
    /// to the engine; then re-initializes `audio_state` from its constant
    /// template in place (Design Note §9) rather than swapping in a new
    /// allocation.
    pub fn reset(&self) -> TransportResult<()> {
        if self.play_state.get().is_stopable() {
            self.stop()?;
        }
        self.require_cmd_tx()?
            .send(WorkerCommand::Reset)
            .map_err(|_| TransportError::ChannelClosed)?;

        let hw = self.audio_state.load(AudioStateField::HwBufferSize);
        let sw = self.audio_state.load(AudioStateField::SwBufferSize);
        self.audio_state.reset_to_template(hw, sw);
        Ok(())
    }

    /// Host-side MIDI enqueue (§4.1, §4.5). Writes the event into the MIDI
    /// ring at the slot computed from `AVAIL_RTMIDI_EVENTS`/`RTMIDI_INDEX`
    /// and bumps the pending-event count for the worker to drain on its
    /// next wake.
    pub fn on_midi(&self, status: i32, data1: i32, data2: i32) -> TransportResult<()> {
        let payload = MidiRing::payload_size();
        let capacity = crate::constants::MIDI_BUFFER_SIZE;

        let avail = self.audio_state.load(AudioStateField::AvailRtmidiEvents).max(0) as usize;
        let base = self.audio_state.load(AudioStateField::RtmidiIndex).max(0) as usize;
        let slot = (base + avail * payload) % capacity;

        self.midi_ring.write_at(slot, MidiEvent { status, data1, data2 });
        self.audio_state.fetch_add(AudioStateField::AvailRtmidiEvents, 1);
        Ok(())
    }

    pub fn add_message_callback(&self, callback: impl Fn(&str) + Send + 'static) {
        self.message_callbacks.lock().unwrap().push(Box::new(callback));
    }

    pub fn set_message_callback(&self, callback: impl Fn(&str) + Send + 'static) {
        let mut callbacks = self.message_callbacks.lock().unwrap();
        callbacks.clear();
        callbacks.push(Box::new(callback));
    }

    pub fn add_play_state_callback(&self, callback: impl Fn(PlayState) + Send + 'static) {
        self.play_state_callbacks.lock().unwrap().push(Box::new(callback));
    }

    pub fn set_play_state_callback(&self, callback: impl Fn(PlayState) + Send + 'static) {
        let mut callbacks = self.play_state_callbacks.lock().unwrap();
        callbacks.clear();
        callbacks.push(Box::new(callback));
    }

    pub fn play_state(&self) -> PlayState {
        self.play_state.get()
    }

    /// Every other engine API entry point (§6): routed directly to the
    /// worker when no performance is running, or through the callback RPC
    /// ring when it is (§4.1). Blocks the calling thread until the reply
    /// arrives or [`CALL_TIMEOUT`] elapses.
    pub fn call(&self, opcode: u32, args: CallbackArgs) -> TransportResult<CallbackValue> {
        let uid = self.next_uid.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.return_queue.lock().unwrap().insert(uid, reply_tx);

        if self.play_state.get() == PlayState::Stop {
            self.require_cmd_tx()?
                .send(WorkerCommand::DirectCall { uid, opcode, args })
                .map_err(|_| TransportError::ChannelClosed)?;
        } else {
            self.callback_ring.enqueue(uid, opcode, &args)?;
            self.doorbell.notify();
        }

        match reply_rx.recv_timeout(CALL_TIMEOUT) {
            Ok(CallbackValue::Error(e)) => Err(TransportError::Callback(e)),
            Ok(value) => Ok(value),
            Err(_) => {
                self.return_queue.lock().unwrap().remove(&uid);
                Err(TransportError::Callback(CallbackError::Terminal))
            }
        }
    }

    /// Thin filesystem passthrough stubs (§6): the sandboxed filesystem
    /// bridge itself is out of scope (§1), so these exist only to keep the
    /// public namespace complete.
    pub fn write_to_fs(&self, _path: &str, _data: &[u8]) -> TransportResult<()> {
        Err(TransportError::Unsupported)
    }

    pub fn read_from_fs(&self, _path: &str) -> TransportResult<Vec<u8>> {
        Err(TransportError::Unsupported)
    }

    pub fn ls_fs(&self, _path: &str) -> TransportResult<Vec<String>> {
        Err(TransportError::Unsupported)
    }

    pub fn ll_fs(&self, _path: &str) -> TransportResult<Vec<String>> {
        Err(TransportError::Unsupported)
    }

    pub fn rmrf_fs(&self, _path: &str) -> TransportResult<()> {
        Err(TransportError::Unsupported)
    }

    /// Tear down the worker and its listener threads. Not part of the
    /// specified operation namespace; exists so the demo binary and tests
    /// can shut down cleanly instead of leaking parked threads.
    pub fn shutdown(&mut self) {
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let _ = cmd_tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reply_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use crate::backend::NullAudioBackend;
    use crate::engine::MockSynthEngine;
    use std::sync::mpsc;

    fn make_transport() -> Transport {
        let engine = Box::new(MockSynthEngine::new(48_000, 32, 2, 2).silent());
        let backend = Box::new(NullAudioBackend::default());
        Transport::new(engine, backend)
    }

    #[test]
    fn starts_in_stop_state() {
        let transport = make_transport();
        assert_eq!(transport.play_state(), PlayState::Stop);
    }

    #[test]
    fn second_initialize_call_is_rejected() {
        let mut transport = make_transport();
        transport.initialize(512, 128).unwrap();
        let err = transport.initialize(512, 128).unwrap_err();
        assert!(matches!(err, TransportError::AlreadyInitialized));
    }

    #[test]
    fn stop_outside_stopable_state_returns_negative_one() {
        let mut transport = make_transport();
        transport.initialize(512, 128).unwrap();
        assert_eq!(transport.stop().unwrap(), -1);
    }

    #[test]
    fn start_pause_resume_stop_reaches_stop_again() {
        let mut transport = make_transport();
        transport.initialize(512, 128).unwrap();

        let (tx, rx) = mpsc::channel();
        transport.add_play_state_callback(move |state| {
            let _ = tx.send(state);
        });

        let config = RealtimeConfig {
            nchnls_out: 2,
            nchnls_in: 2,
            sample_rate: 48_000,
            hw_buffer_frames: 512,
            sw_buffer_frames: 128,
            wants_midi: false,
        };
        assert_eq!(transport.start(config).unwrap(), 0);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PlayState::RealtimePerformanceStarted
        );

        transport.pause().unwrap();
        assert_eq!(transport.play_state(), PlayState::RealtimePerformancePaused);

        // Park the worker inside the pause wait (not just the doorbell
        // wait) before stopping, so this exercises scenario 3: stop()
        // must still unblock it and the template reset must hold.
        transport.doorbell.notify();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(transport.stop().unwrap(), 0);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PlayState::RealtimePerformanceEnded
        );
        assert!(transport.audio_state.matches_template(512, 128));
    }

    #[test]
    fn resume_processes_the_pending_wake_in_one_go() {
        let mut transport = make_transport();
        transport.initialize(512, 128).unwrap();

        let (tx, rx) = mpsc::channel();
        transport.add_play_state_callback(move |state| {
            let _ = tx.send(state);
        });

        let config = RealtimeConfig {
            nchnls_out: 2,
            nchnls_in: 2,
            sample_rate: 48_000,
            hw_buffer_frames: 512,
            sw_buffer_frames: 128,
            wants_midi: false,
        };
        assert_eq!(transport.start(config).unwrap(), 0);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PlayState::RealtimePerformanceStarted
        );

        transport.pause().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PlayState::RealtimePerformancePaused
        );

        // §8 scenario 2: feed input and wake the worker while still paused.
        // It must park in the pause wait and must not advance AvailOutBufs.
        transport
            .audio_state
            .fetch_add(AudioStateField::AvailInBufs, 128);
        transport.doorbell.notify();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.audio_state.load(AudioStateField::AvailOutBufs), 0);

        // resume() must unblock the worker out of the pause wait and have
        // it fall through to copy_block for the wake it's already in.
        transport.resume().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PlayState::RealtimePerformanceResumed
        );

        let mut waited = Duration::ZERO;
        while transport.audio_state.load(AudioStateField::AvailOutBufs) < 128
            && waited < Duration::from_secs(1)
        {
            std::thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        assert_eq!(transport.audio_state.load(AudioStateField::AvailOutBufs), 128);
        assert_eq!(transport.audio_state.load(AudioStateField::AvailInBufs), 0);
    }

    #[test]
    fn on_midi_before_initialize_still_records_into_the_ring() {
        let transport = make_transport();
        transport.on_midi(0x90, 60, 100).unwrap();
        assert_eq!(transport.audio_state.load(AudioStateField::AvailRtmidiEvents), 1);
    }

    #[test]
    fn fs_passthrough_is_unimplemented() {
        let transport = make_transport();
        assert!(matches!(transport.write_to_fs("x", b""), Err(TransportError::Unsupported)));
        assert!(matches!(transport.read_from_fs("x"), Err(TransportError::Unsupported)));
    }

    #[test]
    fn direct_call_while_stopped_resolves_the_reply() {
        let mut transport = make_transport();
        transport.initialize(512, 128).unwrap();

        let value = transport
            .call(crate::engine::opcodes::GET_VERSION, CallbackArgs::default())
            .unwrap();
        assert_eq!(value, CallbackValue::Int(6_190));
    }
}
