//! The audio backend: an external collaborator, out of scope per §1, that
//! produces frames into `in_ring` and consumes them from `out_ring`,
//! notifying the worker's doorbell as it goes. `AudioBackend` is the trait
//! boundary; `CpalAudioBackend` is a reference implementation grounded on
//! the teacher's `RealTimeAudioProcessor` (`realtime_audio.rs`), swapping
//! its `ringbuf`-backed frame queues for direct writes into the shared
//! `AudioRing`/`AudioState` the rest of this crate already owns.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use log::{error, info, warn};
use ringbuf::traits::{Consumer as _, Producer as _, Split as _};
use ringbuf::HeapRb;

use crate::constants::AudioStateField;
use crate::play_state::PlayState;
use crate::rings::AudioRing;
use crate::AudioState;

/// Computed once per performance in `prepare_realtime_performance` and
/// handed to the backend a single time, replacing the ad-hoc field mutation
/// the original performs on the backend object (Design Note §9).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealtimeConfig {
    pub nchnls_out: i32,
    pub nchnls_in: i32,
    pub sample_rate: i32,
    pub hw_buffer_frames: i32,
    pub sw_buffer_frames: i32,
    pub wants_midi: bool,
}

/// The backend's side of the relationship: no reference back to the host,
/// only this trait boundary plus whatever lifecycle events it chooses to
/// act on (Design Note §9: "explicit one-way references plus an event
/// channel").
pub trait AudioBackend: Send {
    /// Stamp the resolved performance configuration onto the backend. Called
    /// once, from `prepare_realtime_performance`.
    fn configure(&mut self, config: RealtimeConfig) -> Result<()>;

    /// Forwarded best-effort on every play-state transition (§4.2); errors
    /// are logged and swallowed by the caller, never propagated into a
    /// broken transition (§7d).
    fn on_play_state(&mut self, state: PlayState) -> Result<()>;
}

/// A backend that does nothing; used by tests and by `reset()`/offline
/// render where no real device is attached.
#[derive(Default)]
pub struct NullAudioBackend {
    pub last_config: Option<RealtimeConfig>,
    pub last_state: Option<PlayState>,
}

impl AudioBackend for NullAudioBackend {
    fn configure(&mut self, config: RealtimeConfig) -> Result<()> {
        self.last_config = Some(config);
        Ok(())
    }

    fn on_play_state(&mut self, state: PlayState) -> Result<()> {
        self.last_state = Some(state);
        Ok(())
    }
}

/// Reference `cpal`-backed implementation: reads the shared `out_ring` into
/// the output device callback and writes the input device callback into the
/// shared `in_ring`, the same split the teacher's `RealTimeAudioProcessor`
/// performs with its own private ring buffers (`realtime_audio.rs`), except
/// here the rings *are* the transport's shared `AudioRing`s, so no extra
/// copy is needed between "device buffer" and "transport buffer".
pub struct CpalAudioBackend {
    state: Arc<AudioState>,
    in_ring: Arc<AudioRing>,
    out_ring: Arc<AudioRing>,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,
    config: Option<RealtimeConfig>,
}

impl CpalAudioBackend {
    pub fn new(state: Arc<AudioState>, in_ring: Arc<AudioRing>, out_ring: Arc<AudioRing>) -> Self {
        Self {
            state,
            in_ring,
            out_ring,
            input_stream: None,
            output_stream: None,
            config: None,
        }
    }

    fn build_streams(&mut self, config: RealtimeConfig) -> Result<()> {
        let host = cpal::default_host();
        let output_device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device available"))?;

        let stream_config = StreamConfig {
            channels: config.nchnls_out as u16,
            sample_rate: SampleRate(config.sample_rate as u32),
            buffer_size: BufferSize::Default,
        };

        let state = self.state.clone();
        let out_ring = self.out_ring.clone();
        let nchnls = config.nchnls_out as usize;

        let output_stream = output_device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    Self::output_callback(data, nchnls, &state, &out_ring);
                },
                |err| error!("audio output stream error: {err}"),
                None,
            )
            .context("failed to build cpal output stream")?;
        output_stream.play().context("failed to start cpal output stream")?;
        self.output_stream = Some(output_stream);

        if config.nchnls_in > 0 {
            if let Some(input_device) = host.default_input_device() {
                let input_stream_config = StreamConfig {
                    channels: config.nchnls_in as u16,
                    sample_rate: SampleRate(config.sample_rate as u32),
                    buffer_size: BufferSize::Default,
                };
                let state = self.state.clone();
                let in_ring = self.in_ring.clone();
                let nchnls_in = config.nchnls_in as usize;
                let input_stream = input_device
                    .build_input_stream(
                        &input_stream_config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            Self::input_callback(data, nchnls_in, &state, &in_ring);
                        },
                        |err| error!("audio input stream error: {err}"),
                        None,
                    )
                    .context("failed to build cpal input stream")?;
                input_stream.play().context("failed to start cpal input stream")?;
                self.input_stream = Some(input_stream);
            } else {
                warn!("realtime config requests {} input channels but no input device is available", config.nchnls_in);
            }
        }

        Ok(())
    }

    /// Hardware output callback: reads as many frames as are available in
    /// `out_ring` (bounded by `AVAIL_OUT_BUFS`), mirroring them into the
    /// device buffer and advancing the shared cursors. Runs on the
    /// platform's real-time audio thread, outside this crate's control.
    fn output_callback(data: &mut [f32], nchnls: usize, state: &AudioState, out_ring: &AudioRing) {
        if state.load(AudioStateField::IsPerforming) != 1 {
            data.fill(0.0);
            return;
        }
        let hw_size = state.load(AudioStateField::HwBufferSize).max(1) as usize;
        let frames = data.len() / nchnls.max(1);
        let available = state.load(AudioStateField::AvailOutBufs).max(0) as usize;
        let to_read = frames.min(available);

        let read_index = (state.load(AudioStateField::OutputWriteIndex) as usize + hw_size - available) % hw_size;
        for i in 0..to_read {
            let idx = (read_index + i) % hw_size;
            for ch in 0..nchnls {
                data[i * nchnls + ch] = out_ring.load(ch, idx) as f32;
            }
        }
        for sample in &mut data[to_read * nchnls..] {
            *sample = 0.0;
        }
        if to_read > 0 {
            state.fetch_sub(AudioStateField::AvailOutBufs, to_read as i32);
        }
    }

    /// Hardware input callback: writes captured frames into `in_ring` and
    /// bumps `AVAIL_IN_BUFS` for the worker to consume on its next wake.
    fn input_callback(data: &[f32], nchnls: usize, state: &AudioState, in_ring: &AudioRing) {
        if state.load(AudioStateField::IsPerforming) != 1 {
            return;
        }
        let hw_size = state.load(AudioStateField::HwBufferSize).max(1) as usize;
        let frames = data.len() / nchnls.max(1);
        let avail = state.load(AudioStateField::AvailInBufs).max(0) as usize;
        let write_index = (state.load(AudioStateField::InputReadIndex) as usize + avail) % hw_size;

        for i in 0..frames {
            let idx = (write_index + i) % hw_size;
            for ch in 0..nchnls {
                in_ring.store(ch, idx, data[i * nchnls + ch] as f64);
            }
        }
        state.fetch_add(AudioStateField::AvailInBufs, frames as i32);
    }
}

impl AudioBackend for CpalAudioBackend {
    fn configure(&mut self, config: RealtimeConfig) -> Result<()> {
        self.config = Some(config);
        self.build_streams(config)
    }

    fn on_play_state(&mut self, state: PlayState) -> Result<()> {
        match state {
            PlayState::RealtimePerformancePaused => {
                if let Some(s) = &self.output_stream {
                    s.pause().context("failed to pause output stream")?;
                }
            }
            PlayState::RealtimePerformanceResumed => {
                if let Some(s) = &self.output_stream {
                    s.play().context("failed to resume output stream")?;
                }
            }
            PlayState::RealtimePerformanceEnded | PlayState::Stop => {
                self.output_stream = None;
                self.input_stream = None;
                info!("audio backend torn down streams after {state:?}");
            }
            _ => {}
        }
        Ok(())
    }
}

/// A lock-free staging queue for feeding device-sized callback chunks from a
/// non-realtime producer, for host code that wants to push raw PCM into
/// `in_ring` without owning a `cpal` device (e.g. the demo binary's offline
/// render path). Grounded on `ringbuf::HeapRb` usage in
/// `realtime_audio.rs`.
pub struct StagingQueue {
    producer: ringbuf::HeapProd<f32>,
    consumer: ringbuf::HeapCons<f32>,
}

impl StagingQueue {
    pub fn new(capacity: usize) -> Self {
        let rb = HeapRb::<f32>::new(capacity);
        let (producer, consumer) = rb.split();
        Self { producer, consumer }
    }

    pub fn push_slice(&mut self, samples: &[f32]) -> usize {
        self.producer.push_slice(samples)
    }

    pub fn pop_slice(&mut self, out: &mut [f32]) -> usize {
        self.consumer.pop_slice(out)
    }

    pub fn occupied_len(&self) -> usize {
        self.consumer.occupied_len()
    }
}

#[cfg(test)]
mod backend_tests {
    use super::*;
    use crate::play_state::PlayState;

    #[test]
    fn null_backend_remembers_config_and_state() {
        let mut backend = NullAudioBackend::default();
        let config = RealtimeConfig {
            nchnls_out: 2,
            nchnls_in: 0,
            sample_rate: 48_000,
            hw_buffer_frames: 512,
            sw_buffer_frames: 128,
            wants_midi: false,
        };
        backend.configure(config).unwrap();
        backend.on_play_state(PlayState::RealtimePerformanceStarted).unwrap();

        assert_eq!(backend.last_config, Some(config));
        assert_eq!(backend.last_state, Some(PlayState::RealtimePerformanceStarted));
    }

    #[test]
    fn staging_queue_round_trips_samples() {
        let mut queue = StagingQueue::new(64);
        let written = queue.push_slice(&[0.1, 0.2, 0.3]);
        assert_eq!(written, 3);

        let mut out = [0.0f32; 3];
        let read = queue.pop_slice(&mut out);
        assert_eq!(read, 3);
        assert_eq!(out, [0.1, 0.2, 0.3]);
    }

    #[test]
    fn output_callback_emits_silence_when_not_performing() {
        let state = Arc::new(AudioState::from_template(512, 128));
        let out_ring = AudioRing::shared();
        let mut data = vec![1.0f32; 8];
        CpalAudioBackend::output_callback(&mut data, 2, &state, &out_ring);
        assert!(data.iter().all(|&s| s == 0.0));
    }
}
