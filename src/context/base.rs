//! The `BaseAudioContext` interface

use crate::buffer::{AudioBuffer, AudioBufferOptions};
use crate::context::{
    AudioContextRegistration, AudioContextState, ConcreteBaseAudioContext, DESTINATION_NODE_ID,
};
use crate::events::{Event, EventHandler, EventType};
use crate::node::{self, AudioNode};
use crate::render::AudioProcessor;
use crate::spatial::AudioListener;
use crate::Error;

/// The interface representing an audio-processing graph built from audio modules linked together,
/// each represented by an `AudioNode`.
///
/// An audio context controls both the creation of the nodes it contains and the execution of the
/// audio processing, or decoding.
#[allow(clippy::module_name_repetitions)]
pub trait BaseAudioContext {
    /// Returns the [`BaseAudioContext`] concrete type associated with this `AudioContext`
    #[doc(hidden)] // we'd rather not expose the ConcreteBaseAudioContext
    fn base(&self) -> &ConcreteBaseAudioContext;

    /// Construct a new pair of [`AudioNode`] and [`AudioProcessor`]
    ///
    /// The `AudioNode` lives in the user-facing control thread. The Processor is sent to the render
    /// thread. Use this to plug custom processing into the graph.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the context is closed, or any error returned by `f`
    fn register<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: AudioNode,
        F: FnOnce(AudioContextRegistration) -> Result<(T, Box<dyn AudioProcessor>), Error>,
        Self: Sized,
    {
        self.base().register(f)
    }

    /// Decode an [`AudioBuffer`] from a given input stream.
    ///
    /// The current implementation can decode Ogg/Vorbis and WAV.
    ///
    /// This function operates synchronously, which may be undesirable on the control thread.
    ///
    /// # Errors
    ///
    /// This method returns an Error in various cases (IO, unknown format, decoding).
    ///
    /// # Usage
    ///
    /// ```no_run
    /// use std::io::Cursor;
    /// use web_audio_graph::context::{BaseAudioContext, OfflineAudioContext};
    ///
    /// let input = Cursor::new(vec![0; 32]); // or a File, TcpStream, ...
    ///
    /// let context = OfflineAudioContext::new(2, 44_100, 44_100.).unwrap();
    /// let handle = std::thread::spawn(move || context.decode_audio_data_sync(input));
    ///
    /// // do other things
    ///
    /// // await result from the decoder thread
    /// let decode_buffer_result = handle.join();
    /// ```
    fn decode_audio_data_sync<R: std::io::Read>(&self, input: R) -> Result<AudioBuffer, Error>
    where
        Self: Sized,
    {
        crate::media::decode_audio_data(input)
    }

    /// Create an new "in-memory" `AudioBuffer` with the given number of channels,
    /// length (i.e. number of samples per channel) and sample rate.
    ///
    /// Note: In most cases you will want the sample rate to match the current
    /// audio context sample rate.
    ///
    /// # Errors
    ///
    /// See [`AudioBuffer::new`]
    fn create_buffer(
        &self,
        number_of_channels: usize,
        length: usize,
        sample_rate: f32,
    ) -> Result<AudioBuffer, Error> {
        let options = AudioBufferOptions {
            number_of_channels,
            length,
            sample_rate,
        };

        AudioBuffer::new(options)
    }

    /// Creates an `AudioBufferSourceNode`
    fn create_buffer_source(&self) -> Result<node::AudioBufferSourceNode, Error> {
        node::AudioBufferSourceNode::new(self.base(), node::AudioBufferSourceOptions::default())
    }

    /// Creates an `ConstantSourceNode`, a source representing a constant value
    fn create_constant_source(&self) -> Result<node::ConstantSourceNode, Error> {
        node::ConstantSourceNode::new(self.base(), node::ConstantSourceOptions::default())
    }

    /// Creates a `DelayNode`, delaying the audio signal
    fn create_delay(&self, max_delay_time: f64) -> Result<node::DelayNode, Error> {
        let opts = node::DelayOptions {
            max_delay_time,
            ..node::DelayOptions::default()
        };
        node::DelayNode::new(self.base(), opts)
    }

    /// Creates an `GainNode`, to control audio volume
    fn create_gain(&self) -> Result<node::GainNode, Error> {
        node::GainNode::new(self.base(), node::GainOptions::default())
    }

    /// Returns an `AudioDestinationNode` representing the final destination of all audio in the
    /// context. It can be thought of as the audio-rendering device.
    #[must_use]
    fn destination(&self) -> node::AudioDestinationNode {
        let registration = AudioContextRegistration::new(self.base().clone(), DESTINATION_NODE_ID);
        let channel_config = self.base().destination_channel_config();
        node::AudioDestinationNode::from_raw_parts(registration, channel_config)
    }

    /// Returns the `AudioListener` which is used for 3D spatialization
    #[must_use]
    fn listener(&self) -> AudioListener {
        self.base().listener()
    }

    /// The sample rate (in sample-frames per second) at which the `AudioContext` handles audio.
    #[must_use]
    fn sample_rate(&self) -> f32 {
        self.base().sample_rate()
    }

    /// Returns state of current context
    #[must_use]
    fn state(&self) -> AudioContextState {
        self.base().state()
    }

    /// This is the time in seconds of the sample frame immediately following the last sample-frame
    /// in the block of audio most recently processed by the context's rendering graph.
    #[must_use]
    fn current_time(&self) -> f64 {
        self.base().current_time()
    }

    /// Number of scheduled sources that are started and not finished yet
    #[doc(hidden)]
    fn active_source_count(&self) -> usize {
        self.base().active_source_count()
    }

    /// Number of nodes alive in the render graph, the destination included
    #[doc(hidden)]
    fn node_count(&self) -> usize {
        self.base().node_count()
    }

    /// Register callback to run when the state of the AudioContext has changed
    ///
    /// Only a single event handler is active at any time. Calling this method multiple times will
    /// override the previous event handler.
    fn set_onstatechange<F: FnMut(Event) + Send + 'static>(&self, mut callback: F)
    where
        Self: Sized,
    {
        let callback = move |_| {
            callback(Event {
                type_: "statechange",
            })
        };

        self.base().set_event_handler(
            EventType::StateChange,
            EventHandler::Multiple(Box::new(callback)),
        );
    }

    /// Unset the callback to run when the state of the AudioContext has changed
    fn clear_onstatechange(&self) {
        self.base().clear_event_handler(EventType::StateChange);
    }
}
