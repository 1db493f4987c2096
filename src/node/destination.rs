use crate::context::{AudioContextRegistration, ConcreteBaseAudioContext};
use crate::render::{AudioParamValues, AudioProcessor, AudioRenderQuantum, RenderScope};
use crate::Error;

use super::{AudioNode, AudioNodeOptions, ChannelConfig, ChannelCountMode, ChannelInterpretation};

/// The AudioDestinationNode interface represents the terminal node of an audio
/// graph in a given context. usually the speakers of your device, or the node that
/// will "record" the audio data with an OfflineAudioContext.
///
/// The destination lives as long as its context, dropping a handle obtained from
/// [`BaseAudioContext::destination`](crate::context::BaseAudioContext::destination) has no effect.
///
/// # Usage
///
/// ```no_run
/// use web_audio_graph::context::{BaseAudioContext, AudioContext};
/// use web_audio_graph::node::{AudioNode, AudioScheduledSourceNode};
///
/// let context = AudioContext::new(Default::default()).unwrap();
///
/// let src = context.create_constant_source().unwrap();
/// src.connect(&context.destination()).unwrap();
/// src.start().unwrap();
/// ```
#[derive(Debug)]
pub struct AudioDestinationNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
}

impl AudioNode for AudioDestinationNode {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config(&self) -> &ChannelConfig {
        &self.channel_config
    }

    fn number_of_inputs(&self) -> usize {
        1
    }

    fn number_of_outputs(&self) -> usize {
        1
    }

    /// Change the number of output channels
    ///
    /// # Errors
    ///
    /// `NotSupported` when the count exceeds [`Self::max_channel_count`], or for any change of
    /// an offline destination
    fn set_channel_count(&self, v: usize) -> Result<(), Error> {
        if self.registration.context().offline() && v != self.max_channel_count() {
            return Err(Error::NotSupported(
                "not allowed to change the OfflineAudioContext destination channel count".into(),
            ));
        }
        if v > self.max_channel_count() {
            return Err(Error::NotSupported(format!(
                "channel count ({}) cannot be greater than max channel count ({})",
                v,
                self.max_channel_count()
            )));
        }
        self.channel_config.set_count(v, &self.registration)
    }

    /// # Errors
    ///
    /// `InvalidState` for the destination of an offline context
    fn set_channel_count_mode(&self, v: ChannelCountMode) -> Result<(), Error> {
        if self.registration.context().offline() {
            return Err(Error::InvalidState(
                "the OfflineAudioContext destination has channel count mode constraints".into(),
            ));
        }
        self.channel_config.set_count_mode(v, &self.registration)
    }
}

impl AudioDestinationNode {
    pub(crate) fn channel_config_for(channel_count: usize) -> Result<ChannelConfig, Error> {
        ChannelConfig::try_from(AudioNodeOptions {
            channel_count,
            channel_count_mode: ChannelCountMode::Explicit,
            channel_interpretation: ChannelInterpretation::Speakers,
        })
    }

    /// Register the destination, the first node of every context
    pub(crate) fn new(context: &ConcreteBaseAudioContext) -> Result<Self, Error> {
        let channel_config = context.destination_channel_config();
        context.register(move |registration| {
            let node = Self {
                registration,
                channel_config,
            };
            let proc = DestinationRenderer {};

            Ok((node, Box::new(proc) as Box<dyn AudioProcessor>))
        })
    }

    pub(crate) fn from_raw_parts(
        registration: AudioContextRegistration,
        channel_config: ChannelConfig,
    ) -> Self {
        Self {
            registration,
            channel_config,
        }
    }

    /// The maximum number of channels that the channel count can be set to (the max
    /// number of channels that the hardware is capable of supporting).
    pub fn max_channel_count(&self) -> usize {
        self.registration.context().max_channel_count()
    }
}

struct DestinationRenderer {}

impl AudioProcessor for DestinationRenderer {
    fn process(
        &mut self,
        inputs: &[AudioRenderQuantum],
        outputs: &mut [AudioRenderQuantum],
        _params: AudioParamValues<'_>,
        _scope: &RenderScope,
    ) -> bool {
        // single input/output node
        let input = &inputs[0];
        let output = &mut outputs[0];

        // just move input to output
        *output = input.clone();

        false
    }

    fn follows_input_channel_count(&self) -> bool {
        true
    }
}
