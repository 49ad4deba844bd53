//! Optional convenience producer feeding [`crate::transport::Transport::on_midi`]
//! (§4.5 supplement). The engine-facing MIDI ring is unchanged; this only
//! adds a host-side input source so a real backend (`midir` and similar, as
//! several repos in the retrieval pack use) can be wired up without the
//! caller hand-rolling a polling loop, mirroring how the teacher's
//! `network::NetworkManager` runs a dedicated receive loop feeding a
//! processing thread instead of requiring callers to poll sockets directly.

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::transport::Transport;

/// One raw MIDI message, `(status, data1, data2)`.
pub trait MidiSource: Send {
    /// Return the next pending message, if any, without blocking.
    fn poll(&mut self) -> Option<(i32, i32, i32)>;
}

/// Polls a [`MidiSource`] on a dedicated thread and forwards every message
/// to `on_midi`. Dropping the handle stops the polling thread.
pub struct MidiPump {
    stop: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MidiPump {
    pub fn spawn(
        transport: Arc<Transport>,
        mut source: Box<dyn MidiSource>,
        poll_interval: Duration,
    ) -> Self {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_for_thread = stop.clone();

        let handle = std::thread::Builder::new()
            .name("synth-transport-midi-pump".into())
            .spawn(move || {
                while !stop_for_thread.load(std::sync::atomic::Ordering::SeqCst) {
                    while let Some((status, data1, data2)) = source.poll() {
                        if let Err(e) = transport.on_midi(status, data1, data2) {
                            warn!("failed to enqueue polled MIDI event: {e}");
                        }
                    }
                    std::thread::sleep(poll_interval);
                }
            })
            .expect("failed to spawn MIDI pump thread");

        Self { stop, handle: Some(handle) }
    }
}

impl Drop for MidiPump {
    fn drop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod midi_source_tests {
    use super::*;
    use crate::backend::NullAudioBackend;
    use crate::engine::MockSynthEngine;
    use std::sync::Mutex;

    struct QueueSource(Arc<Mutex<Vec<(i32, i32, i32)>>>);

    impl MidiSource for QueueSource {
        fn poll(&mut self) -> Option<(i32, i32, i32)> {
            self.0.lock().unwrap().pop()
        }
    }

    #[test]
    fn pump_forwards_polled_events_into_the_transport() {
        let mut transport = Transport::new(
            Box::new(MockSynthEngine::new(48_000, 32, 2, 2)),
            Box::new(NullAudioBackend::default()),
        );
        transport.initialize(512, 128).unwrap();
        let transport = Arc::new(transport);

        let queue = Arc::new(Mutex::new(vec![(0x90, 60, 100)]));
        let pump = MidiPump::spawn(transport.clone(), Box::new(QueueSource(queue.clone())), Duration::from_millis(5));

        let mut waited = Duration::ZERO;
        while queue.lock().unwrap().len() > 0 && waited < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }

        drop(pump);
        assert!(queue.lock().unwrap().is_empty());
    }
}
