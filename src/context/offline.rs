//! The `OfflineAudioContext` type

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::AudioBuffer;
use crate::context::{BaseAudioContext, ConcreteBaseAudioContext};
use crate::events::EventLoop;
use crate::render::graph::Graph;
use crate::render::scheduler::GraphScheduler;
use crate::render::RenderThread;
use crate::Error;

/// The `OfflineAudioContext` doesn't render the audio to the device hardware; instead, it generates
/// it, as fast as it can, and outputs the result to an `AudioBuffer`.
// the naming comes from the web audio specification
#[allow(clippy::module_name_repetitions)]
pub struct OfflineAudioContext {
    /// represents the underlying `BaseAudioContext`
    base: ConcreteBaseAudioContext,
    /// the size of the buffer in sample-frames
    length: usize,
    /// the rendering 'thread', taken by the single rendering run
    renderer: Mutex<Option<RenderThread>>,
}

impl std::fmt::Debug for OfflineAudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineAudioContext")
            .field("length", &self.length)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl BaseAudioContext for OfflineAudioContext {
    fn base(&self) -> &ConcreteBaseAudioContext {
        &self.base
    }
}

impl OfflineAudioContext {
    /// Creates an `OfflineAudioContext` instance
    ///
    /// # Arguments
    ///
    /// * `number_of_channels` - number of output channels to render
    /// * `length` - length of the rendering audio buffer
    /// * `sample_rate` - output sample rate
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a channel count outside `[1, 32]` or an unsupported sample rate
    /// - `NotSupported` for a zero length
    pub fn new(number_of_channels: usize, length: usize, sample_rate: f32) -> Result<Self, Error> {
        crate::validate_number_of_channels(number_of_channels)?;
        crate::validate_sample_rate(sample_rate)?;
        if length == 0 {
            return Err(Error::NotSupported(
                "offline rendering length should be at least one frame".into(),
            ));
        }

        let scheduler = Arc::new(GraphScheduler::new(Graph::new()));
        let (control_thread_init, render_thread_init) = crate::io::thread_init(scheduler.clone());

        // setup the render 'thread', which will run inside the control thread
        let renderer = RenderThread::new(sample_rate, number_of_channels, render_thread_init);

        // freed node ids flow back from the event thread
        let (reclaim_send, reclaim_recv) = crossbeam_channel::unbounded();
        let event_loop = EventLoop::new();
        event_loop.run(
            control_thread_init.event_recv,
            control_thread_init.garbage_recv,
            reclaim_send,
        );

        let base = ConcreteBaseAudioContext::new(
            sample_rate,
            number_of_channels,
            number_of_channels,
            scheduler,
            control_thread_init.state,
            control_thread_init.frames_played,
            event_loop,
            true,
            reclaim_recv,
        )?;

        log::debug!(
            "Created offline context: {} channels, {} frames at {} Hz",
            number_of_channels,
            length,
            sample_rate
        );

        Ok(Self {
            base,
            length,
            renderer: Mutex::new(Some(renderer)),
        })
    }

    fn take_renderer(&self) -> Result<RenderThread, Error> {
        self.renderer.lock().take().ok_or_else(|| {
            Error::InvalidState("an OfflineAudioContext can only be rendered once".into())
        })
    }

    /// Given the current connections and scheduled changes, starts rendering audio.
    ///
    /// This function will block the current thread and returns the rendered `AudioBuffer`
    /// synchronously. The context is closed afterwards.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the context was rendered before
    pub fn start_rendering_sync(&self) -> Result<AudioBuffer, Error> {
        let renderer = self.take_renderer()?;
        Ok(renderer.render_audiobuffer(self.length))
    }

    /// Renders the graph on a dedicated worker thread and waits for the result
    ///
    /// # Errors
    ///
    /// `InvalidState` when the context was rendered before, or when the rendering thread could
    /// not be started or panicked
    pub fn start_rendering(&self) -> Result<AudioBuffer, Error> {
        let renderer = self.take_renderer()?;
        let length = self.length;

        let handle = std::thread::Builder::new()
            .name("offline-render".into())
            .spawn(move || renderer.render_audiobuffer(length))?;

        handle
            .join()
            .map_err(|_| Error::InvalidState("offline rendering thread panicked".into()))
    }

    /// get the length of rendering audio buffer
    // false positive: OfflineAudioContext is not const
    #[allow(clippy::missing_const_for_fn, clippy::unused_self)]
    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AudioContextState;
    use crate::node::{AudioNode, AudioScheduledSourceNode};

    use float_eq::assert_float_eq;

    #[test]
    fn test_invalid_arguments() {
        assert!(matches!(
            OfflineAudioContext::new(0, 128, 48000.),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            OfflineAudioContext::new(1, 0, 48000.),
            Err(Error::NotSupported(_))
        ));
        assert!(OfflineAudioContext::new(1, 128, 0.).is_err());
    }

    #[test]
    fn test_render_silence() {
        let context = OfflineAudioContext::new(2, 300, 44100.).unwrap();
        assert_eq!(context.state(), AudioContextState::Suspended);

        let buffer = context.start_rendering_sync().unwrap();
        assert_eq!(buffer.number_of_channels(), 2);
        assert_eq!(buffer.length(), 300);
        assert_float_eq!(buffer.get_channel_data(0)[..], [0.; 300][..], abs_all <= 0.);
        assert_float_eq!(buffer.get_channel_data(1)[..], [0.; 300][..], abs_all <= 0.);

        assert_eq!(context.state(), AudioContextState::Closed);
    }

    #[test]
    fn test_render_once() {
        let context = OfflineAudioContext::new(1, 128, 44100.).unwrap();
        context.start_rendering_sync().unwrap();
        assert!(matches!(
            context.start_rendering_sync(),
            Err(Error::InvalidState(_))
        ));
        // closed contexts refuse new nodes
        assert!(matches!(context.create_gain(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_render_on_worker_thread() {
        let context = OfflineAudioContext::new(1, 256, 48000.).unwrap();
        let src = context.create_constant_source().unwrap();
        src.connect(&context.destination()).unwrap();
        src.start().unwrap();

        let buffer = context.start_rendering().unwrap();
        assert_float_eq!(buffer.get_channel_data(0)[..], [1.; 256][..], abs_all <= 0.);
        assert_float_eq!(context.current_time(), 256. / 48000., abs <= 0.);
    }

    #[test]
    fn test_mono_source_fills_all_channels() {
        let context = OfflineAudioContext::new(2, 128, 48000.).unwrap();
        let src = context.create_constant_source().unwrap();
        src.connect(&context.destination()).unwrap();
        src.start().unwrap();

        // the explicit stereo destination up-mixes its mono input
        let buffer = context.start_rendering_sync().unwrap();
        assert_float_eq!(buffer.get_channel_data(0)[..], [1.; 128][..], abs_all <= 0.);
        assert_float_eq!(buffer.get_channel_data(1)[..], [1.; 128][..], abs_all <= 0.);
    }
}
