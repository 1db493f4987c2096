use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{AudioContextRegistration, ConcreteBaseAudioContext, DisconnectTarget};
use crate::events::{ErrorEvent, EventHandler, EventPayload, EventType};
use crate::param::AudioParam;
use crate::render::graph::GraphMutation;
use crate::render::ports::{InputAddr, OutputAddr};
use crate::{validate_number_of_channels, Error};

/// How channels must be matched between the node's inputs and outputs.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChannelCountMode {
    /// `computedNumberOfChannels` is the maximum of the number of channels of all connections to an
    /// input. In this mode channelCount is ignored.
    Max,
    /// `computedNumberOfChannels` is determined as for "max" and then clamped to a maximum value of
    /// the given channelCount.
    ClampedMax,
    /// `computedNumberOfChannels` is the exact value as specified by the channelCount.
    Explicit,
}

/// The meaning of the channels, defining how audio up-mixing and down-mixing will happen.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChannelInterpretation {
    Speakers,
    Discrete,
}

/// Options that can be used in constructing all AudioNodes.
#[derive(Clone, Debug)]
pub struct AudioNodeOptions {
    /// Desired number of channels for the [`AudioNode::channel_count`] attribute.
    pub channel_count: usize,
    /// Desired mode for the [`AudioNode::channel_count_mode`] attribute.
    pub channel_count_mode: ChannelCountMode,
    /// Desired mode for the [`AudioNode::channel_interpretation`] attribute.
    pub channel_interpretation: ChannelInterpretation,
}

impl Default for AudioNodeOptions {
    fn default() -> Self {
        Self {
            channel_count: 2,
            channel_count_mode: ChannelCountMode::Max,
            channel_interpretation: ChannelInterpretation::Speakers,
        }
    }
}

/// Config for up/down-mixing of input channels for audio nodes
///
/// Only when implementing the [`AudioNode`] trait manually, this struct is of any concern. The
/// methods `set_channel_count`, `set_channel_count_mode` and `set_channel_interpretation` from the
/// audio node interface will use this struct to sync the required info to the render thread.
///
/// ```
/// use web_audio_graph::node::{AudioNodeOptions, ChannelConfig, ChannelCountMode, ChannelInterpretation};
///
/// let opts = AudioNodeOptions {
///     channel_count: 1,
///     channel_count_mode: ChannelCountMode::Explicit,
///     channel_interpretation: ChannelInterpretation::Discrete,
/// };
/// let config = ChannelConfig::try_from(opts).unwrap();
/// ```
#[derive(Clone)]
pub struct ChannelConfig {
    inner: Arc<Mutex<ChannelConfigInner>>,
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelConfigInner {
    pub(crate) count: usize,
    pub(crate) count_mode: ChannelCountMode,
    pub(crate) interpretation: ChannelInterpretation,
}

impl ChannelConfigInner {
    /// Effective channel count of an input whose widest connection carries `widest` channels
    ///
    /// An input without connections has a widest count of zero.
    pub(crate) fn computed_number_of_channels(&self, widest: usize) -> usize {
        match self.count_mode {
            ChannelCountMode::Max => widest.max(1),
            ChannelCountMode::ClampedMax => widest.clamp(1, self.count),
            ChannelCountMode::Explicit => self.count,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let AudioNodeOptions {
            channel_count,
            channel_count_mode,
            channel_interpretation,
        } = AudioNodeOptions::default();

        Self::from_inner(ChannelConfigInner {
            count: channel_count,
            count_mode: channel_count_mode,
            interpretation: channel_interpretation,
        })
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("count", &self.count())
            .field("count_mode", &self.count_mode())
            .field("interpretation", &self.interpretation())
            .finish()
    }
}

// The setters are only reachable through the AudioNode interface, so nodes with channel
// constraints can check them before the change is shipped to the graph.
impl ChannelConfig {
    fn from_inner(inner: ChannelConfigInner) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub(crate) fn count_mode(&self) -> ChannelCountMode {
        self.inner.lock().count_mode
    }

    pub(crate) fn set_count_mode(
        &self,
        v: ChannelCountMode,
        registration: &AudioContextRegistration,
    ) -> Result<(), Error> {
        registration.context().ensure_open()?;

        // hold the guard while submitting, concurrent setters must reach the graph in order
        let mut guard = self.inner.lock();
        guard.count_mode = v;
        registration
            .context()
            .submit(GraphMutation::SetChannelCountMode {
                id: registration.id(),
                mode: v,
            });
        Ok(())
    }

    pub(crate) fn interpretation(&self) -> ChannelInterpretation {
        self.inner.lock().interpretation
    }

    pub(crate) fn set_interpretation(
        &self,
        v: ChannelInterpretation,
        registration: &AudioContextRegistration,
    ) -> Result<(), Error> {
        registration.context().ensure_open()?;

        let mut guard = self.inner.lock();
        guard.interpretation = v;
        registration
            .context()
            .submit(GraphMutation::SetChannelInterpretation {
                id: registration.id(),
                interpretation: v,
            });
        Ok(())
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.lock().count
    }

    pub(crate) fn set_count(
        &self,
        v: usize,
        registration: &AudioContextRegistration,
    ) -> Result<(), Error> {
        validate_number_of_channels(v)?;
        registration.context().ensure_open()?;

        let mut guard = self.inner.lock();
        guard.count = v;
        registration
            .context()
            .submit(GraphMutation::SetChannelCount {
                id: registration.id(),
                count: v,
            });
        Ok(())
    }

    pub(crate) fn inner(&self) -> ChannelConfigInner {
        self.inner.lock().clone()
    }
}

impl TryFrom<AudioNodeOptions> for ChannelConfig {
    type Error = Error;

    fn try_from(opts: AudioNodeOptions) -> Result<Self, Error> {
        validate_number_of_channels(opts.channel_count)?;

        Ok(Self::from_inner(ChannelConfigInner {
            count: opts.channel_count,
            count_mode: opts.channel_count_mode,
            interpretation: opts.channel_interpretation,
        }))
    }
}

/// This interface represents audio sources, the audio destination, and intermediate processing
/// modules.
///
/// These modules can be connected together to form processing graphs for rendering audio
/// to the audio hardware. Each node can have inputs and/or outputs.
///
/// The AudioNode is constructed together with an
/// [`AudioProcessor`](crate::render::AudioProcessor), the object that lives on the render thread.
/// Every method that edits the graph validates its arguments first, and returns an error without
/// touching the graph when they are not acceptable.
pub trait AudioNode {
    /// Handle of the associated [`BaseAudioContext`](crate::context::BaseAudioContext).
    ///
    /// Only when implementing the AudioNode trait manually, this struct is of any concern.
    fn registration(&self) -> &AudioContextRegistration;

    /// Config for up/down-mixing of input channels for this node.
    ///
    /// Only when implementing the [`AudioNode`] trait manually, this struct is of any concern.
    fn channel_config(&self) -> &ChannelConfig;

    /// The [`BaseAudioContext`](crate::context::BaseAudioContext) concrete type which owns this
    /// AudioNode.
    fn context(&self) -> &ConcreteBaseAudioContext {
        self.registration().context()
    }

    /// Connect the output of this AudioNode to the input of another node.
    ///
    /// Connecting the same output and input twice has no effect.
    fn connect<'a>(&self, dest: &'a dyn AudioNode) -> Result<&'a dyn AudioNode, Error> {
        self.connect_from_output_to_input(dest, 0, 0)
    }

    /// Connect a specific output of this AudioNode to a specific input of another node.
    ///
    /// # Errors
    ///
    /// - `InvalidAccess` when the nodes live in different contexts
    /// - `IndexSize` when the output or input port is out of bounds
    /// - `InvalidState` when the context is closed
    fn connect_from_output_to_input<'a>(
        &self,
        dest: &'a dyn AudioNode,
        output: usize,
        input: usize,
    ) -> Result<&'a dyn AudioNode, Error> {
        if self.context() != dest.context() {
            return Err(Error::InvalidAccess(
                "attempting to connect nodes from different contexts".into(),
            ));
        }
        if output >= self.number_of_outputs() {
            return Err(Error::index_size("output", output, self.number_of_outputs()));
        }
        if input >= dest.number_of_inputs() {
            return Err(Error::index_size("input", input, dest.number_of_inputs()));
        }

        self.context().connect(
            OutputAddr {
                node: self.registration().id(),
                output,
            },
            InputAddr::Node {
                node: dest.registration().id(),
                input,
            },
        )?;
        Ok(dest)
    }

    /// Connect the first output of this AudioNode to an [`AudioParam`]
    ///
    /// The signal is down-mixed to mono and added to the param's value.
    fn connect_param(&self, dest: &AudioParam) -> Result<(), Error> {
        self.connect_param_from_output(dest, 0)
    }

    /// Connect a specific output of this AudioNode to an [`AudioParam`]
    fn connect_param_from_output(&self, dest: &AudioParam, output: usize) -> Result<(), Error> {
        if self.context() != dest.context() {
            return Err(Error::InvalidAccess(
                "attempting to connect a param from a different context".into(),
            ));
        }
        if output >= self.number_of_outputs() {
            return Err(Error::index_size("output", output, self.number_of_outputs()));
        }

        self.context().connect(
            OutputAddr {
                node: self.registration().id(),
                output,
            },
            InputAddr::Param {
                node: dest.node_id(),
                param: dest.index(),
            },
        )
    }

    /// Disconnects all outgoing connections from the AudioNode.
    fn disconnect(&self) -> Result<(), Error> {
        self.context()
            .disconnect(self.registration().id(), None, DisconnectTarget::Any)
    }

    /// Disconnects all outgoing connections at the given output port from the AudioNode.
    fn disconnect_output(&self, output: usize) -> Result<(), Error> {
        if output >= self.number_of_outputs() {
            return Err(Error::index_size("output", output, self.number_of_outputs()));
        }

        self.context()
            .disconnect(self.registration().id(), Some(output), DisconnectTarget::Any)
    }

    /// Disconnects all outputs of the AudioNode that go to a specific destination AudioNode.
    ///
    /// # Errors
    ///
    /// `InvalidAccess` when this node was not connected to `dest`.
    fn disconnect_dest(&self, dest: &dyn AudioNode) -> Result<(), Error> {
        if self.context() != dest.context() {
            return Err(Error::InvalidAccess(
                "attempting to disconnect nodes from different contexts".into(),
            ));
        }

        self.context().disconnect(
            self.registration().id(),
            None,
            DisconnectTarget::Node(dest.registration().id()),
        )
    }

    /// Disconnects a specific output of the AudioNode to a specific destination AudioNode
    fn disconnect_dest_from_output(&self, dest: &dyn AudioNode, output: usize) -> Result<(), Error> {
        if self.context() != dest.context() {
            return Err(Error::InvalidAccess(
                "attempting to disconnect nodes from different contexts".into(),
            ));
        }
        if output >= self.number_of_outputs() {
            return Err(Error::index_size("output", output, self.number_of_outputs()));
        }

        self.context().disconnect(
            self.registration().id(),
            Some(output),
            DisconnectTarget::Node(dest.registration().id()),
        )
    }

    /// Disconnects a specific output of the AudioNode to a specific input of some destination
    /// AudioNode
    fn disconnect_dest_from_output_to_input(
        &self,
        dest: &dyn AudioNode,
        output: usize,
        input: usize,
    ) -> Result<(), Error> {
        if self.context() != dest.context() {
            return Err(Error::InvalidAccess(
                "attempting to disconnect nodes from different contexts".into(),
            ));
        }
        if output >= self.number_of_outputs() {
            return Err(Error::index_size("output", output, self.number_of_outputs()));
        }
        if input >= dest.number_of_inputs() {
            return Err(Error::index_size("input", input, dest.number_of_inputs()));
        }

        self.context().disconnect(
            self.registration().id(),
            Some(output),
            DisconnectTarget::NodeInput(dest.registration().id(), input),
        )
    }

    /// Disconnects all outputs of the AudioNode that go to the given [`AudioParam`]
    fn disconnect_param(&self, dest: &AudioParam) -> Result<(), Error> {
        self.context().disconnect(
            self.registration().id(),
            None,
            DisconnectTarget::Param(dest.node_id(), dest.index()),
        )
    }

    /// Disconnects a specific output of the AudioNode from the given [`AudioParam`]
    fn disconnect_param_from_output(&self, dest: &AudioParam, output: usize) -> Result<(), Error> {
        if output >= self.number_of_outputs() {
            return Err(Error::index_size("output", output, self.number_of_outputs()));
        }

        self.context().disconnect(
            self.registration().id(),
            Some(output),
            DisconnectTarget::Param(dest.node_id(), dest.index()),
        )
    }

    /// The number of inputs feeding into the AudioNode. For source nodes, this will be 0.
    fn number_of_inputs(&self) -> usize;

    /// The number of outputs coming out of the AudioNode.
    fn number_of_outputs(&self) -> usize;

    /// Represents an enumerated value describing the way channels must be matched between the
    /// node's inputs and outputs.
    fn channel_count_mode(&self) -> ChannelCountMode {
        self.channel_config().count_mode()
    }

    /// Update the `channel_count_mode` attribute
    ///
    /// The new mode takes effect at the start of the next render quantum.
    fn set_channel_count_mode(&self, v: ChannelCountMode) -> Result<(), Error> {
        self.channel_config().set_count_mode(v, self.registration())
    }

    /// Represents an enumerated value describing the meaning of the channels. This interpretation
    /// will define how audio up-mixing and down-mixing will happen.
    fn channel_interpretation(&self) -> ChannelInterpretation {
        self.channel_config().interpretation()
    }

    /// Update the `channel_interpretation` attribute
    fn set_channel_interpretation(&self, v: ChannelInterpretation) -> Result<(), Error> {
        self.channel_config()
            .set_interpretation(v, self.registration())
    }

    /// Represents an integer used to determine how many channels are used when up-mixing and
    /// down-mixing connections to any inputs to the node.
    fn channel_count(&self) -> usize {
        self.channel_config().count()
    }

    /// Update the `channel_count` attribute
    fn set_channel_count(&self, v: usize) -> Result<(), Error> {
        self.channel_config().set_count(v, self.registration())
    }

    /// Register callback to run when the processor of this node panicked
    ///
    /// The node outputs silence from then on. Without a handler the panic is logged.
    fn set_onprocessorerror(&self, callback: Box<dyn FnOnce(ErrorEvent) + Send + 'static>) {
        let callback = move |v| match v {
            EventPayload::ProcessorError(v) => callback(v),
            _ => unreachable!(),
        };

        self.context().set_event_handler(
            EventType::ProcessorError(self.registration().id()),
            EventHandler::Once(Box::new(callback)),
        );
    }

    /// Unset the callback to run when the processor of this node panicked
    fn clear_onprocessorerror(&self) {
        self.context()
            .clear_event_handler(EventType::ProcessorError(self.registration().id()));
    }

    /// Number of times the buffer of the given output was reallocated for a channel count change
    #[doc(hidden)]
    fn output_reallocations(&self, output: usize) -> u64 {
        self.context()
            .output_reallocations(self.registration().id(), output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(count: usize, count_mode: ChannelCountMode) -> ChannelConfigInner {
        ChannelConfigInner {
            count,
            count_mode,
            interpretation: ChannelInterpretation::Speakers,
        }
    }

    #[test]
    fn test_computed_number_of_channels() {
        let max = inner(2, ChannelCountMode::Max);
        assert_eq!(max.computed_number_of_channels(0), 1);
        assert_eq!(max.computed_number_of_channels(1), 1);
        assert_eq!(max.computed_number_of_channels(6), 6);

        let clamped = inner(2, ChannelCountMode::ClampedMax);
        assert_eq!(clamped.computed_number_of_channels(0), 1);
        assert_eq!(clamped.computed_number_of_channels(1), 1);
        assert_eq!(clamped.computed_number_of_channels(6), 2);

        let explicit = inner(4, ChannelCountMode::Explicit);
        assert_eq!(explicit.computed_number_of_channels(0), 4);
        assert_eq!(explicit.computed_number_of_channels(6), 4);
    }

    #[test]
    fn test_invalid_options() {
        let opts = AudioNodeOptions {
            channel_count: 0,
            ..AudioNodeOptions::default()
        };
        assert!(matches!(
            ChannelConfig::try_from(opts),
            Err(Error::InvalidArgument(_))
        ));
    }
}
