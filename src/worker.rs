//! The synthesis worker (§4.3): owns the engine instance, runs the render
//! loop, drains MIDI and callback requests once per wake, and broadcasts
//! play-state transitions.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender};
use log::{debug, info};

use crate::audio_state::AudioState;
use crate::backend::RealtimeConfig;
use crate::callback::{CallbackError, CallbackReply, CallbackRing, CallbackValue};
use crate::constants::AudioStateField;
use crate::doorbell::{Doorbell, PauseGate};
use crate::engine::SynthEngine;
use crate::midi::MidiRing;
use crate::play_state::{BroadcastMessage, LogMessage, PlayState, PlayStateChange};
use crate::rings::AudioRing;

/// Sent on the control -> worker channel. Covers both performance kickoff
/// and the "direct proxy" non-performance calls §4.1 makes when the
/// transport is not currently performing (i.e. not routed through the
/// callback RPC ring).
pub enum WorkerCommand {
    StartRealtime(RealtimeConfig),
    /// Offline render mode (§4.3). `sink`, if given, receives one `Vec<f64>`
    /// of interleaved output samples per block performed — not part of the
    /// specified transport surface, but a convenient tap for a caller that
    /// wants to capture a render to a file instead of discarding it.
    StartRender { sink: Option<Sender<Vec<f64>>> },
    DirectCall {
        uid: u64,
        opcode: u32,
        args: crate::callback::CallbackArgs,
    },
    /// §4.1/§9: `reset()`'s "forwards reset to engine" step, queued after the
    /// preceding `stop()`'s `StartRealtime`/`StartRender` loop has returned
    /// so it always runs after the engine has actually stopped.
    Reset,
    Shutdown,
}

pub struct WorkerShared {
    pub audio_state: Arc<AudioState>,
    pub in_ring: Arc<AudioRing>,
    pub out_ring: Arc<AudioRing>,
    pub midi_ring: Arc<MidiRing>,
    pub callback_ring: Arc<CallbackRing>,
    pub doorbell: Arc<Doorbell>,
    pub pause_gate: Arc<PauseGate>,
}

pub fn spawn(
    mut engine: Box<dyn SynthEngine>,
    shared: WorkerShared,
    cmd_rx: Receiver<WorkerCommand>,
    broadcast_tx: Sender<BroadcastMessage>,
    reply_tx: Sender<CallbackReply>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("synth-worker".into())
        .spawn(move || {
            #[cfg(feature = "realtime-priority")]
            rtprio::try_raise_priority();

            let mut worker = Worker {
                engine: engine.as_mut(),
                shared,
                cmd_rx,
                broadcast_tx,
                reply_tx,
            };
            worker.run();
        })
        .expect("failed to spawn synth-worker thread")
}

struct Worker<'e> {
    engine: &'e mut dyn SynthEngine,
    shared: WorkerShared,
    cmd_rx: Receiver<WorkerCommand>,
    broadcast_tx: Sender<BroadcastMessage>,
    reply_tx: Sender<CallbackReply>,
}

impl<'e> Worker<'e> {
    fn run(&mut self) {
        while let Ok(command) = self.cmd_rx.recv() {
            match command {
                WorkerCommand::StartRealtime(config) => self.run_realtime(config),
                WorkerCommand::StartRender { sink } => self.run_render(sink),
                WorkerCommand::DirectCall { uid, opcode, args } => self.service_direct_call(uid, opcode, &args),
                WorkerCommand::Reset => self.engine.reset(),
                WorkerCommand::Shutdown => break,
            }
        }
    }

    fn broadcast(&self, state: PlayState) {
        let _ = self.broadcast_tx.send(BroadcastMessage::PlayStateChange(PlayStateChange(state)));
    }

    fn log(&self, message: impl Into<String>) {
        let _ = self.broadcast_tx.send(BroadcastMessage::Log(LogMessage(message.into())));
    }

    fn service_direct_call(&mut self, uid: u64, opcode: u32, args: &crate::callback::CallbackArgs) {
        let value = match self.engine.invoke(opcode, args) {
            Ok(v) => v,
            Err(e) => CallbackValue::Error(e),
        };
        let _ = self.reply_tx.send(CallbackReply { uid, value });
    }

    /// Drain every request pending on the callback ring and reply for each,
    /// in FIFO submission order (§4.4). Never aborts the render loop on a
    /// per-call failure; failures are delivered as a tagged error reply.
    fn drain_callbacks(&mut self) {
        for request in self.shared.callback_ring.drain() {
            let value = match self.engine.invoke(request.opcode, &request.args) {
                Ok(v) => v,
                Err(e) => CallbackValue::Error(e),
            };
            let _ = self.reply_tx.send(CallbackReply { uid: request.uid, value });
        }
    }

    fn flush_pending_logs(&mut self) {
        for line in self.engine.drain_log_lines() {
            self.log(line);
        }
    }

    /// §4.3 Setup: publish the engine's resolved configuration into
    /// `audio_state` and flip on performance.
    fn setup_realtime(&mut self, config: RealtimeConfig) {
        let state = &self.shared.audio_state;
        state.reset_to_template(config.hw_buffer_frames, config.sw_buffer_frames);

        let nchnls_i = if self.engine.input_name().contains("adc") {
            self.engine.nchnls_i()
        } else {
            0
        };

        state.store(AudioStateField::Nchnls, self.engine.nchnls());
        state.store(AudioStateField::NchnlsI, nchnls_i);
        state.store(AudioStateField::SampleRate, self.engine.sample_rate());
        state.store(
            AudioStateField::IsRequestingRtmidi,
            self.engine.is_requesting_rtmidi() as i32,
        );
        state.store(AudioStateField::IsPerforming, 1);

        info!(
            "realtime performance starting: nchnls={} nchnls_i={} sr={} ksmps={}",
            self.engine.nchnls(),
            nchnls_i,
            self.engine.sample_rate(),
            self.engine.ksmps(),
        );
        self.broadcast(PlayState::RealtimePerformanceStarted);
    }

    fn run_realtime(&mut self, config: RealtimeConfig) {
        self.setup_realtime(config);

        let ksmps = self.engine.ksmps().max(1) as usize;
        let zero_db_fs = self.engine.zero_db_fs();
        let hw_size = self.shared.audio_state.load(AudioStateField::HwBufferSize).max(1) as usize;
        let sw_size = self.shared.audio_state.load(AudioStateField::SwBufferSize).max(1) as usize;
        let nchnls = self.engine.nchnls().max(0) as usize;
        let nchnls_i = self.shared.audio_state.load(AudioStateField::NchnlsI).max(0) as usize;

        let mut last_return = 0;
        let mut performance_ended = false;

        loop {
            self.shared.doorbell.wait();

            let state = &self.shared.audio_state;
            let stop_requested = state.load(AudioStateField::Stop) == 1;
            let still_performing = state.load(AudioStateField::IsPerforming) == 1;

            if stop_requested || !still_performing || performance_ended {
                if !performance_ended {
                    self.engine.stop();
                    self.engine.perform_block();
                }
                self.flush_pending_logs();
                state.store(AudioStateField::IsPerforming, 0);
                self.broadcast(PlayState::RealtimePerformanceEnded);
                break;
            }

            if state.load(AudioStateField::IsPaused) == 1 {
                // §4.3 step 2: block until unpaused, then fall through into
                // steps 3-7 for *this* wake rather than re-entering the
                // doorbell wait. Rearming here would race `resume()`'s
                // `doorbell.notify()` and could clobber a pending wake back
                // to 0 before it was ever serviced.
                self.shared.pause_gate.wait_while_paused();
            }

            if state.load(AudioStateField::IsRequestingRtmidi) == 1 {
                self.drain_midi();
            }

            self.drain_callbacks();

            self.copy_block(ksmps, hw_size, sw_size, nchnls, nchnls_i, zero_db_fs, &mut last_return, &mut performance_ended);

            self.shared.doorbell.rearm();
        }
    }

    fn drain_midi(&mut self) {
        let state = &self.shared.audio_state;
        let n = state.load(AudioStateField::AvailRtmidiEvents);
        if n <= 0 {
            return;
        }
        let n = n as usize;
        let start = state.load(AudioStateField::RtmidiIndex) as usize;
        let payload = MidiRing::payload_size();
        let capacity = crate::constants::MIDI_BUFFER_SIZE;

        for i in 0..n {
            let slot = (start + i * payload) % capacity;
            let event = self.shared.midi_ring.read_at(slot);
            self.engine.push_midi(event.status, event.data1, event.data2);
        }

        let new_index = (start + n * payload) % capacity;
        state.store(AudioStateField::RtmidiIndex, new_index as i32);
        state.fetch_sub(AudioStateField::AvailRtmidiEvents, n as i32);
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_block(
        &mut self,
        ksmps: usize,
        hw_size: usize,
        sw_size: usize,
        nchnls: usize,
        nchnls_i: usize,
        zero_db_fs: f64,
        last_return: &mut i32,
        performance_ended: &mut bool,
    ) {
        let state = &self.shared.audio_state;
        let has_input = state.load(AudioStateField::AvailInBufs) >= sw_size as i32;
        let input_read_index = state.load(AudioStateField::InputReadIndex).max(0) as usize % hw_size.max(1);
        let output_write_index = state.load(AudioStateField::OutputWriteIndex).max(0) as usize;

        for i in 0..sw_size {
            let ci = (input_read_index + i) % hw_size;
            let co = (output_write_index + i) % hw_size;
            let pi = ci % ksmps;
            let po = co % ksmps;

            if po == 0 && !*performance_ended {
                if *last_return == 0 {
                    *last_return = self.engine.perform_block();
                } else {
                    *performance_ended = true;
                }
            }

            let spout = self.engine.spout();
            for k in 0..nchnls {
                let idx = po * nchnls + k;
                let raw = spout.get(idx).copied().unwrap_or(0.0);
                let sample = if raw.is_finite() { raw / zero_db_fs } else { 0.0 };
                self.shared.out_ring.store(k, co, sample);
            }

            if has_input {
                for k in 0..nchnls_i {
                    let sample = self.shared.in_ring.load(k, ci) * zero_db_fs;
                    let spin = self.engine.spin();
                    if let Some(slot) = spin.get_mut(pi * nchnls_i + k) {
                        *slot = sample;
                    }
                }
                state.fetch_add(AudioStateField::InputReadIndex, 1);
                if state.load(AudioStateField::InputReadIndex) >= hw_size as i32 {
                    state.store(AudioStateField::InputReadIndex, 0);
                }
            }

            state.fetch_add(AudioStateField::OutputWriteIndex, 1);
            if state.load(AudioStateField::OutputWriteIndex) >= hw_size as i32 {
                state.store(AudioStateField::OutputWriteIndex, 0);
            }
        }

        if has_input {
            state.fetch_sub(AudioStateField::AvailInBufs, sw_size as i32);
        }
        state.fetch_add(AudioStateField::AvailOutBufs, sw_size as i32);
        debug!("wake processed {sw_size} frames, has_input={has_input}");
    }

    /// §4.3 offline render mode: repeatedly performs blocks with no ring
    /// copying until the engine signals completion or `STOP` is set.
    fn run_render(&mut self, sink: Option<Sender<Vec<f64>>>) {
        self.shared.audio_state.store(AudioStateField::IsPerforming, 1);
        self.broadcast(PlayState::RenderStarted);

        loop {
            if self.shared.audio_state.load(AudioStateField::Stop) == 1 {
                break;
            }
            if self.shared.audio_state.load(AudioStateField::IsPaused) == 1 {
                self.shared.pause_gate.wait_while_paused();
                continue;
            }
            self.drain_callbacks();
            let done = self.engine.perform_block() != 0;
            if let Some(sink) = &sink {
                if sink.send(self.engine.spout().to_vec()).is_err() {
                    break;
                }
            }
            if done {
                break;
            }
        }

        self.shared.audio_state.store(AudioStateField::IsPerforming, 0);
        self.flush_pending_logs();
        self.broadcast(PlayState::RenderEnded);
    }
}

#[cfg(feature = "realtime-priority")]
mod rtprio {
    pub fn try_raise_priority() {
        #[cfg(unix)]
        unsafe {
            // Best-effort: a non-privileged process may not be allowed to
            // raise its own scheduling priority; failure is silently
            // ignored, matching §7's "best-effort only" timing guarantee.
            let param = libc::sched_param { sched_priority: 10 };
            let _ = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        }
    }
}

#[cfg(test)]
mod worker_tests {
    use super::*;
    use crate::callback::CallbackArgs;
    use crate::engine::{opcodes, MockSynthEngine};
    use std::time::Duration;

    fn make_shared(hw: i32, sw: i32) -> WorkerShared {
        let audio_state = Arc::new(AudioState::from_template(hw, sw));
        WorkerShared {
            doorbell: Arc::new(Doorbell::new(audio_state.clone())),
            pause_gate: Arc::new(PauseGate::new(audio_state.clone())),
            in_ring: AudioRing::shared(),
            out_ring: AudioRing::shared(),
            midi_ring: MidiRing::shared(),
            callback_ring: CallbackRing::shared(),
            audio_state,
        }
    }

    #[test]
    fn happy_path_copies_a_block_of_silence() {
        let shared = make_shared(512, 128);
        let engine: Box<dyn SynthEngine> = Box::new(MockSynthEngine::new(48_000, 32, 2, 2).silent());
        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();
        let (broadcast_tx, broadcast_rx) = crossbeam::channel::unbounded();
        let (reply_tx, _reply_rx) = crossbeam::channel::unbounded();

        let state = shared.audio_state.clone();
        let doorbell = shared.doorbell.clone();

        let mut engine_box = engine;
        let handle = std::thread::spawn(move || {
            let mut worker = Worker {
                engine: engine_box.as_mut(),
                shared,
                cmd_rx,
                broadcast_tx,
                reply_tx,
            };
            worker.run();
        });

        cmd_tx
            .send(WorkerCommand::StartRealtime(RealtimeConfig {
                nchnls_out: 2,
                nchnls_in: 2,
                sample_rate: 48_000,
                hw_buffer_frames: 512,
                sw_buffer_frames: 128,
                wants_midi: false,
            }))
            .unwrap();

        // wait for realtimePerformanceStarted
        let started = broadcast_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            started,
            BroadcastMessage::PlayStateChange(PlayStateChange(PlayState::RealtimePerformanceStarted))
        ));

        state.fetch_add(AudioStateField::AvailInBufs, 128);
        doorbell.notify();

        // poll for the wake to complete
        let mut waited = Duration::ZERO;
        while state.load(AudioStateField::AvailOutBufs) < 128 && waited < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }

        assert_eq!(state.load(AudioStateField::AvailOutBufs), 128);
        assert_eq!(state.load(AudioStateField::AvailInBufs), 0);
        assert_eq!(state.load(AudioStateField::OutputWriteIndex), 128);

        cmd_tx.send(WorkerCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn pause_then_resume_processes_the_same_wake() {
        let shared = make_shared(512, 128);
        let engine: Box<dyn SynthEngine> = Box::new(MockSynthEngine::new(48_000, 32, 2, 2).silent());
        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();
        let (broadcast_tx, broadcast_rx) = crossbeam::channel::unbounded();
        let (reply_tx, _reply_rx) = crossbeam::channel::unbounded();

        let state = shared.audio_state.clone();
        let doorbell = shared.doorbell.clone();
        let pause_gate = shared.pause_gate.clone();

        let mut engine_box = engine;
        let handle = std::thread::spawn(move || {
            let mut worker = Worker {
                engine: engine_box.as_mut(),
                shared,
                cmd_rx,
                broadcast_tx,
                reply_tx,
            };
            worker.run();
        });

        cmd_tx
            .send(WorkerCommand::StartRealtime(RealtimeConfig {
                nchnls_out: 2,
                nchnls_in: 2,
                sample_rate: 48_000,
                hw_buffer_frames: 512,
                sw_buffer_frames: 128,
                wants_midi: false,
            }))
            .unwrap();

        let started = broadcast_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            started,
            BroadcastMessage::PlayStateChange(PlayStateChange(PlayState::RealtimePerformanceStarted))
        ));

        // §8 scenario 2: pause, then feed input and wake the worker while
        // still paused so it actually parks inside the pause wait.
        state.store(AudioStateField::IsPaused, 1);
        state.fetch_add(AudioStateField::AvailInBufs, 128);
        doorbell.notify();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(state.load(AudioStateField::AvailOutBufs), 0);

        // Unpause exactly the way `Transport::resume()` does: flip the
        // flag, notify the pause gate, then the doorbell. The worker is
        // parked in `wait_while_paused`, not `doorbell.wait`, at this
        // point, so it must fall through to copy_block for the wake it's
        // already in rather than rearming and going back to sleep.
        state.store(AudioStateField::IsPaused, 0);
        pause_gate.notify();
        doorbell.notify();

        let mut waited = Duration::ZERO;
        while state.load(AudioStateField::AvailOutBufs) < 128 && waited < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }

        assert_eq!(state.load(AudioStateField::AvailOutBufs), 128);
        assert_eq!(state.load(AudioStateField::AvailInBufs), 0);

        cmd_tx.send(WorkerCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn direct_call_replies_on_the_reply_channel() {
        let shared = make_shared(512, 128);
        let engine: Box<dyn SynthEngine> = Box::new(MockSynthEngine::new(48_000, 32, 2, 2));
        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();
        let (broadcast_tx, _broadcast_rx) = crossbeam::channel::unbounded();
        let (reply_tx, reply_rx) = crossbeam::channel::unbounded();

        let mut engine_box = engine;
        let handle = std::thread::spawn(move || {
            let mut worker = Worker {
                engine: engine_box.as_mut(),
                shared,
                cmd_rx,
                broadcast_tx,
                reply_tx,
            };
            worker.run();
        });

        cmd_tx
            .send(WorkerCommand::DirectCall {
                uid: 55,
                opcode: opcodes::GET_VERSION,
                args: CallbackArgs::default(),
            })
            .unwrap();

        let reply = reply_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.uid, 55);
        assert_eq!(reply.value, CallbackValue::Int(6_190));

        cmd_tx.send(WorkerCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn unknown_direct_call_replies_with_tagged_error() {
        let shared = make_shared(512, 128);
        let engine: Box<dyn SynthEngine> = Box::new(MockSynthEngine::new(48_000, 32, 2, 2));
        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();
        let (broadcast_tx, _broadcast_rx) = crossbeam::channel::unbounded();
        let (reply_tx, reply_rx) = crossbeam::channel::unbounded();

        let mut engine_box = engine;
        let handle = std::thread::spawn(move || {
            let mut worker = Worker {
                engine: engine_box.as_mut(),
                shared,
                cmd_rx,
                broadcast_tx,
                reply_tx,
            };
            worker.run();
        });

        cmd_tx
            .send(WorkerCommand::DirectCall {
                uid: 1,
                opcode: 12345,
                args: CallbackArgs::default(),
            })
            .unwrap();

        let reply = reply_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.value, CallbackValue::Error(CallbackError::UnknownOpcode(12345)));

        cmd_tx.send(WorkerCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }
}
