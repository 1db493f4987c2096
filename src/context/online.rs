//! The `AudioContext` type

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::context::{
    AudioContextLatencyCategory, AudioContextOptions, AudioContextState, BaseAudioContext,
    CompletionNotifier, ConcreteBaseAudioContext, StateChangeCompletion,
};
use crate::events::EventLoop;
use crate::io::{self, AudioBackendManager, ControlThreadInit};
use crate::render::graph::Graph;
use crate::render::scheduler::GraphScheduler;
use crate::render::LifecycleRequest;
use crate::Error;

/// Maximum number of simultaneously open contexts playing to an output device
pub const MAX_HARDWARE_CONTEXTS: usize = 4;

static HARDWARE_CONTEXTS: AtomicUsize = AtomicUsize::new(0);

/// Claim on one of the [`MAX_HARDWARE_CONTEXTS`] slots, released on drop
#[derive(Debug)]
struct HardwareSlot;

impl HardwareSlot {
    fn acquire() -> Result<Self, Error> {
        HARDWARE_CONTEXTS
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < MAX_HARDWARE_CONTEXTS).then(|| n + 1)
            })
            .map(|_| Self)
            .map_err(|_| {
                Error::InvalidState(format!(
                    "cannot open more than {} audio contexts at once",
                    MAX_HARDWARE_CONTEXTS
                ))
            })
    }
}

impl Drop for HardwareSlot {
    fn drop(&mut self) {
        HARDWARE_CONTEXTS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// This interface represents an audio graph whose `AudioDestinationNode` is routed to a real-time
/// output device that produces a signal directed at the user.
// the naming comes from the web audio specification
#[allow(clippy::module_name_repetitions)]
pub struct AudioContext {
    /// represents the underlying `BaseAudioContext`
    base: ConcreteBaseAudioContext,
    /// audio backend (play/pause functionality)
    backend: Box<dyn AudioBackendManager>,
    /// suspend, resume and close requests to the render thread
    lifecycle_send: Sender<LifecycleRequest>,
    _slot: HardwareSlot,
}

impl std::fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContext")
            .field("sink_id", &self.sink_id())
            .field("backend", &self.backend.name())
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl BaseAudioContext for AudioContext {
    fn base(&self) -> &ConcreteBaseAudioContext {
        &self.base
    }
}

impl AudioContext {
    /// Creates and returns a new `AudioContext` object.
    ///
    /// This will play live audio on the default output device, or on the sink given in the
    /// options. The context starts rendering right away, its state turns to `Running` once the
    /// first quantum is requested by the device.
    ///
    /// ```no_run
    /// use web_audio_graph::context::{AudioContext, AudioContextLatencyCategory, AudioContextOptions};
    ///
    /// // Request a sample rate of 44.1 kHz and default latency (buffer size 128, if available)
    /// let opts = AudioContextOptions {
    ///     sample_rate: Some(44100.),
    ///     latency_hint: AudioContextLatencyCategory::Interactive,
    ///     ..AudioContextOptions::default()
    /// };
    ///
    /// // Setup the audio context that will emit to your speakers
    /// let context = AudioContext::new(opts).unwrap();
    ///
    /// // Alternatively, ask for the best sample rate for your hardware
    /// let context = AudioContext::new(AudioContextOptions::default()).unwrap();
    /// ```
    ///
    /// # Errors
    ///
    /// - `InvalidState` when [`MAX_HARDWARE_CONTEXTS`] contexts are open already
    /// - `InvalidArgument` for an unsupported sample rate or latency
    /// - `NotSupported` when the output device cannot be opened
    pub fn new(options: AudioContextOptions) -> Result<Self, Error> {
        if let Some(sample_rate) = options.sample_rate {
            crate::validate_sample_rate(sample_rate)?;
        }
        if let AudioContextLatencyCategory::Custom(latency) = options.latency_hint {
            if !(latency.is_finite() && latency > 0.) {
                return Err(Error::InvalidArgument(format!(
                    "latency hint ({}) should be a positive number of seconds",
                    latency
                )));
            }
        }

        let slot = HardwareSlot::acquire()?;

        let scheduler = Arc::new(GraphScheduler::new(Graph::new()));
        let (control_thread_init, render_thread_init) = io::thread_init(scheduler.clone());
        let backend = io::build_output(&options, render_thread_init)?;

        let ControlThreadInit {
            state,
            frames_played,
            lifecycle_send,
            event_recv,
            garbage_recv,
        } = control_thread_init;

        // freed node ids flow back from the event thread
        let (reclaim_send, reclaim_recv) = crossbeam_channel::unbounded();
        let event_loop = EventLoop::new();
        event_loop.run(event_recv, garbage_recv, reclaim_send);

        let base = ConcreteBaseAudioContext::new(
            backend.sample_rate(),
            backend.number_of_channels(),
            backend.number_of_channels(),
            scheduler,
            state,
            frames_played,
            event_loop,
            false,
            reclaim_recv,
        );
        let base = match base {
            Ok(base) => base,
            Err(e) => {
                backend.close();
                return Err(e);
            }
        };

        log::info!(
            "Audio context opened on {}: {} channels at {} Hz",
            backend.name(),
            backend.number_of_channels(),
            backend.sample_rate()
        );

        Ok(Self {
            base,
            backend,
            lifecycle_send,
            _slot: slot,
        })
    }

    /// Identifier of the current audio output device
    ///
    /// `"none"` when rendering without a device.
    #[must_use]
    pub fn sink_id(&self) -> &str {
        self.backend.sink_id()
    }

    fn request(
        &self,
        request: fn(CompletionNotifier) -> LifecycleRequest,
    ) -> StateChangeCompletion {
        let (completion, notifier) = StateChangeCompletion::new();
        // a closed render thread drops the notifier, completing the request
        let _ = self.lifecycle_send.send(request(notifier));
        completion
    }

    /// Suspends the progression of time in the audio context.
    ///
    /// The render thread keeps pulling but outputs silence, `current_time` stands still.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the context is closed
    pub fn suspend(&self) -> Result<StateChangeCompletion, Error> {
        self.base.ensure_open()?;
        log::debug!("Suspend requested");
        Ok(self.request(LifecycleRequest::Suspend))
    }

    /// Resumes the progression of time in an audio context that has previously been
    /// suspended/paused.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the context is closed
    pub fn resume(&self) -> Result<StateChangeCompletion, Error> {
        self.base.ensure_open()?;
        log::debug!("Resume requested");
        Ok(self.request(LifecycleRequest::Resume))
    }

    /// Closes the `AudioContext`, releasing the system resources being used.
    ///
    /// This will not automatically release all `AudioContext`-created objects, but will suspend
    /// the progression of the currentTime, and stop processing audio data. Closing a closed
    /// context completes right away.
    ///
    /// # Errors
    ///
    /// Never fails currently, the `Result` mirrors the other lifecycle calls
    pub fn close(&self) -> Result<StateChangeCompletion, Error> {
        if self.base.state() == AudioContextState::Closed {
            return Ok(StateChangeCompletion::completed());
        }
        log::debug!("Close requested");
        Ok(self.request(LifecycleRequest::Close))
    }

    /// Closes the `AudioContext` and waits for the output device to be released
    ///
    /// This function operates synchronously and might block the current thread.
    ///
    /// # Errors
    ///
    /// See [`Self::close`]
    pub fn close_sync(&self) -> Result<(), Error> {
        let completion = self.close()?;
        if !completion.wait_timeout(Duration::from_secs(1)) {
            // the device stopped pulling, the stream is torn down regardless
            log::warn!("Render thread did not acknowledge the close request");
        }

        self.backend.close();
        self.base.set_state(AudioContextState::Closed);
        Ok(())
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        if let Err(e) = self.close_sync() {
            log::warn!("Failed to close the audio context: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::AudioNode;

    use float_eq::assert_float_eq;
    use parking_lot::Mutex;

    // the hardware slots are process wide
    static SERIAL: Mutex<()> = parking_lot::const_mutex(());

    fn none_sink() -> AudioContextOptions {
        AudioContextOptions {
            sink_id: "none".into(),
            ..AudioContextOptions::default()
        }
    }

    #[test]
    fn test_invalid_options() {
        let _guard = SERIAL.lock();

        let options = AudioContextOptions {
            sample_rate: Some(1.),
            ..none_sink()
        };
        assert!(matches!(
            AudioContext::new(options),
            Err(Error::InvalidArgument(_))
        ));

        let options = AudioContextOptions {
            latency_hint: AudioContextLatencyCategory::Custom(-1.),
            ..none_sink()
        };
        assert!(matches!(
            AudioContext::new(options),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_max_hardware_contexts() {
        let _guard = SERIAL.lock();

        let contexts: Vec<_> = (0..MAX_HARDWARE_CONTEXTS)
            .map(|_| AudioContext::new(none_sink()).unwrap())
            .collect();
        assert!(matches!(
            AudioContext::new(none_sink()),
            Err(Error::InvalidState(_))
        ));

        // closing alone does not release the slot, dropping does
        contexts[0].close_sync().unwrap();
        assert!(AudioContext::new(none_sink()).is_err());
        drop(contexts);
        assert!(AudioContext::new(none_sink()).is_ok());
    }

    #[test]
    fn test_lifecycle() {
        let _guard = SERIAL.lock();

        let context = AudioContext::new(none_sink()).unwrap();
        assert_eq!(context.sink_id(), "none");
        assert_eq!(context.destination().channel_count(), 2);

        let completion = context.suspend().unwrap();
        assert!(completion.wait_timeout(Duration::from_secs(1)));
        assert_eq!(context.state(), AudioContextState::Suspended);

        // time stands still while suspended
        let time = context.current_time();
        std::thread::sleep(Duration::from_millis(20));
        assert_float_eq!(context.current_time(), time, abs <= 0.);

        let completion = context.resume().unwrap();
        assert!(completion.wait_timeout(Duration::from_secs(1)));
        assert_eq!(context.state(), AudioContextState::Running);

        context.close_sync().unwrap();
        assert_eq!(context.state(), AudioContextState::Closed);
        assert_eq!(context.state().as_str(), "closed");

        assert!(matches!(context.suspend(), Err(Error::InvalidState(_))));
        assert!(matches!(context.resume(), Err(Error::InvalidState(_))));
        assert!(context.close().unwrap().is_complete());
        assert!(matches!(context.create_gain(), Err(Error::InvalidState(_))));
    }
}
