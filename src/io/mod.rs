//! Audio output interfaces

use std::sync::atomic::{AtomicU64, AtomicU8};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::context::{AudioContextLatencyCategory, AudioContextOptions, AudioContextState};
use crate::events::{EventDispatch, Garbage};
use crate::render::scheduler::GraphScheduler;
use crate::render::LifecycleRequest;
use crate::{Error, RENDER_QUANTUM_SIZE};

mod none;
pub(crate) use none::NoneBackend;

#[cfg(feature = "cpal")]
mod cpal;

#[derive(Debug)]
pub(crate) struct ControlThreadInit {
    pub state: Arc<AtomicU8>,
    pub frames_played: Arc<AtomicU64>,
    pub lifecycle_send: Sender<LifecycleRequest>,
    pub event_recv: Receiver<EventDispatch>,
    pub garbage_recv: Receiver<Garbage>,
}

#[derive(Clone, Debug)]
pub(crate) struct RenderThreadInit {
    pub scheduler: Arc<GraphScheduler>,
    pub state: Arc<AtomicU8>,
    pub frames_played: Arc<AtomicU64>,
    pub lifecycle_recv: Receiver<LifecycleRequest>,
    pub event_send: Sender<EventDispatch>,
    pub garbage_send: Sender<Garbage>,
}

pub(crate) fn thread_init(scheduler: Arc<GraphScheduler>) -> (ControlThreadInit, RenderThreadInit) {
    // Track audio context state - synced from render thread to control thread
    let state = Arc::new(AtomicU8::new(AudioContextState::Suspended as u8));

    // Track number of frames - synced from render thread to control thread
    let frames_played = Arc::new(AtomicU64::new(0));

    // Suspend, resume and close requests, picked up at the next render call
    let (lifecycle_send, lifecycle_recv) = crossbeam_channel::unbounded();

    // Communication channel for events from the render thread to the control thread.
    // Use a bounded channel for real-time safety. A maximum of 256 events (node ended, error, ..)
    // will be sent per render quantum. Excess events are dropped when the capacity is reached.
    let (event_send, event_recv) = crossbeam_channel::bounded(256);

    // Removed nodes are freed on the control side, never on the render thread
    let (garbage_send, garbage_recv) = crossbeam_channel::unbounded();

    let control_thread_init = ControlThreadInit {
        state: Arc::clone(&state),
        frames_played: Arc::clone(&frames_played),
        lifecycle_send,
        event_recv,
        garbage_recv,
    };

    let render_thread_init = RenderThreadInit {
        scheduler,
        state,
        frames_played,
        lifecycle_recv,
        event_send,
        garbage_send,
    };

    (control_thread_init, render_thread_init)
}

/// Set up an output stream based on the requested sink and the enabled features
pub(crate) fn build_output(
    options: &AudioContextOptions,
    render_thread_init: RenderThreadInit,
) -> Result<Box<dyn AudioBackendManager>, Error> {
    if options.sink_id == "none" {
        let backend = NoneBackend::build_output(options, render_thread_init)?;
        return Ok(Box::new(backend));
    }

    #[cfg(feature = "cpal")]
    {
        let backend = cpal::CpalBackend::build_output(options, render_thread_init)?;
        Ok(Box::new(backend))
    }
    #[cfg(not(feature = "cpal"))]
    {
        log::warn!(
            "No audio device support compiled in (enable the 'cpal' feature), sink {:?} renders to the none backend",
            options.sink_id
        );
        let backend = NoneBackend::build_output(options, render_thread_init)?;
        Ok(Box::new(backend))
    }
}

/// Interface for audio backends
pub(crate) trait AudioBackendManager: Send + Sync + 'static {
    /// Name of the concrete implementation - for debug purposes
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Setup a new output stream, driving the given render thread
    fn build_output(
        options: &AudioContextOptions,
        render_thread_init: RenderThreadInit,
    ) -> Result<Self, Error>
    where
        Self: Sized;

    /// Stop the stream and wait until the render thread is released
    ///
    /// It cannot be started again after closing.
    fn close(&self);

    /// Sample rate of the stream
    fn sample_rate(&self) -> f32;

    /// Number of channels of the stream
    fn number_of_channels(&self) -> usize;

    /// The audio output device - `""` means the default device
    fn sink_id(&self) -> &str;
}

/// Calculate buffer size in frames for a given latency category
fn buffer_size_for_latency_category(
    latency_cat: AudioContextLatencyCategory,
    sample_rate: f32,
) -> usize {
    // at 44100Hz sample rate (this could be even more relaxed):
    // Interactive: 128 samples is 2,9ms
    // Balanced:    512 samples is 11,6ms
    // Playback:    1024 samples is 23,2ms
    match latency_cat {
        AudioContextLatencyCategory::Interactive => RENDER_QUANTUM_SIZE,
        AudioContextLatencyCategory::Balanced => RENDER_QUANTUM_SIZE * 4,
        AudioContextLatencyCategory::Playback => RENDER_QUANTUM_SIZE * 8,
        // validated to be strictly positive when the context is created
        #[allow(clippy::cast_sign_loss)]
        #[allow(clippy::cast_possible_truncation)]
        AudioContextLatencyCategory::Custom(latency) => {
            let buffer_size = (latency * f64::from(sample_rate)) as usize;
            buffer_size.next_power_of_two().max(RENDER_QUANTUM_SIZE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_for_latency_category() {
        use AudioContextLatencyCategory::*;

        assert_eq!(buffer_size_for_latency_category(Interactive, 48000.), 128);
        assert_eq!(buffer_size_for_latency_category(Balanced, 48000.), 512);
        assert_eq!(buffer_size_for_latency_category(Playback, 48000.), 1024);
        // 0.01 * 48000 = 480 -> 512
        assert_eq!(buffer_size_for_latency_category(Custom(0.01), 48000.), 512);
        assert_eq!(buffer_size_for_latency_category(Custom(1e-6), 48000.), 128);
    }
}
