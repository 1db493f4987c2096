//! The `ConcreteBaseAudioContext` type

use crate::context::{
    AudioContextRegistration, AudioContextState, AudioNodeId, BaseAudioContext, DisconnectTarget,
    DESTINATION_NODE_ID,
};
use crate::events::{EventHandler, EventLoop, EventType};
use crate::node::{AudioDestinationNode, AudioNode, ChannelConfig};
use crate::render::graph::{GraphMutation, Node};
use crate::render::ports::{InputAddr, OutputAddr};
use crate::render::scheduler::GraphScheduler;
use crate::render::AudioProcessor;
use crate::spatial::AudioListener;
use crate::Error;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// This struct assigns new [`AudioNodeId`]s for [`AudioNode`]s
///
/// It reuses the ids of freed nodes to prevent unbounded growth of the audio graphs node
/// list (which is stored in a Vec indexed by the AudioNodeId).
struct AudioNodeIdProvider {
    /// incrementing id
    id_inc: AtomicU64,
    /// receiver for freed AudioNodeIds, which can be reused
    id_consumer: Receiver<AudioNodeId>,
}

impl AudioNodeIdProvider {
    fn new(id_consumer: Receiver<AudioNodeId>) -> Self {
        Self {
            id_inc: AtomicU64::new(0),
            id_consumer,
        }
    }

    /// Returns a fresh id, and whether it was used before
    fn get(&self) -> (AudioNodeId, bool) {
        match self.id_consumer.try_recv() {
            Ok(id) => (id, true),
            Err(_) => (AudioNodeId(self.id_inc.fetch_add(1, Ordering::Relaxed)), false),
        }
    }
}

/// The struct that corresponds to the Javascript `BaseAudioContext` object.
///
/// This object is returned from the `base()` method on
/// [`AudioContext`](crate::context::AudioContext) and
/// [`OfflineAudioContext`](crate::context::OfflineAudioContext), and the `context()` method on
/// `AudioNode`s.
///
/// The `ConcreteBaseAudioContext` allows for shallow cloning (using an `Arc` internally).
#[allow(clippy::module_name_repetitions)]
#[derive(Clone)]
#[doc(hidden)]
pub struct ConcreteBaseAudioContext {
    inner: Arc<ConcreteBaseAudioContextInner>,
}

impl PartialEq for ConcreteBaseAudioContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ConcreteBaseAudioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseAudioContext")
            .field("state", &self.state())
            .field("sample_rate", &self.sample_rate())
            .field("current_time", &self.current_time())
            .field("max_channel_count", &self.max_channel_count())
            .field("offline", &self.offline())
            .finish_non_exhaustive()
    }
}

/// Inner representation of the `ConcreteBaseAudioContext`
///
/// These fields are wrapped inside an `Arc` in the actual `ConcreteBaseAudioContext`.
struct ConcreteBaseAudioContextInner {
    /// sample rate in Hertz
    sample_rate: f32,
    /// max number of speaker output channels
    max_channel_count: usize,
    /// provider for new AudioNodeIds
    audio_node_id_provider: AudioNodeIdProvider,
    /// destination node's current channel count
    destination_channel_config: ChannelConfig,
    /// owner of the audio graph, shared with the render thread
    scheduler: Arc<GraphScheduler>,
    /// number of frames played
    frames_played: Arc<AtomicU64>,
    /// spatial reference frame
    listener: AudioListener,
    /// Denotes if this AudioContext is offline or not
    offline: bool,
    /// Current state of the `ConcreteBaseAudioContext`, shared with the RenderThread
    state: Arc<AtomicU8>,
    /// Stores the event handlers
    event_loop: EventLoop,
    /// Current audio graph connections, to validate disconnect calls
    connections: Mutex<HashSet<(OutputAddr, InputAddr)>>,
}

impl BaseAudioContext for ConcreteBaseAudioContext {
    fn base(&self) -> &ConcreteBaseAudioContext {
        self
    }
}

impl ConcreteBaseAudioContext {
    /// Creates a `BaseAudioContext` instance, with its destination node registered
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        sample_rate: f32,
        max_channel_count: usize,
        destination_channel_count: usize,
        scheduler: Arc<GraphScheduler>,
        state: Arc<AtomicU8>,
        frames_played: Arc<AtomicU64>,
        event_loop: EventLoop,
        offline: bool,
        node_id_consumer: Receiver<AudioNodeId>,
    ) -> Result<Self, Error> {
        let base_inner = ConcreteBaseAudioContextInner {
            sample_rate,
            max_channel_count,
            audio_node_id_provider: AudioNodeIdProvider::new(node_id_consumer),
            destination_channel_config: AudioDestinationNode::channel_config_for(
                destination_channel_count,
            )?,
            scheduler,
            frames_played,
            listener: AudioListener::default(),
            offline,
            state,
            event_loop,
            connections: Mutex::new(HashSet::new()),
        };
        let base = Self {
            inner: Arc::new(base_inner),
        };

        // The destination handle is reconstructed on the fly when requested, storing it here
        // would create a cyclic reference
        let destination = AudioDestinationNode::new(&base)?;
        debug_assert_eq!(destination.registration().id(), DESTINATION_NODE_ID);
        drop(destination);

        Ok(base)
    }

    /// Construct a new pair of [`AudioNode`] and [`AudioProcessor`]
    ///
    /// The render-side node is added to the graph after `f` returns, mutations concerning the new
    /// node must be submitted after this call.
    pub fn register<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: AudioNode,
        F: FnOnce(AudioContextRegistration) -> Result<(T, Box<dyn AudioProcessor>), Error>,
    {
        self.ensure_open()?;

        // create a unique id for this node
        let (id, reused) = self.inner.audio_node_id_provider.get();
        if reused {
            // stale edges of the freed node that used this id before
            self.inner
                .connections
                .lock()
                .retain(|(from, to)| from.node != id && to.node() != id);
        }
        let registration = AudioContextRegistration::new(self.clone(), id);

        // create the node and its renderer
        let (node, render) = (f)(registration)?;

        // pass the renderer to the audio graph
        let render_node = Node::new(
            render,
            node.number_of_inputs(),
            node.number_of_outputs(),
            node.channel_config().inner(),
            node.registration().take_params(),
        );
        self.submit(GraphMutation::AddNode {
            id,
            node: Box::new(render_node),
        });
        log::debug!("Registered node {:?}", id);

        Ok(node)
    }

    /// Apply a graph mutation, right away or at the start of the next render quantum
    pub(crate) fn submit(&self, mutation: GraphMutation) {
        self.inner.scheduler.submit(mutation);
    }

    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.state() == AudioContextState::Closed {
            Err(Error::closed())
        } else {
            Ok(())
        }
    }

    pub(crate) fn connect(&self, from: OutputAddr, to: InputAddr) -> Result<(), Error> {
        self.ensure_open()?;

        self.inner.connections.lock().insert((from, to));
        self.submit(GraphMutation::Connect { from, to });
        Ok(())
    }

    /// Remove the outgoing connections of node `from` matching the selection
    ///
    /// Fails with `InvalidAccess` when a specific target was given but nothing matched.
    pub(crate) fn disconnect(
        &self,
        from: AudioNodeId,
        output: Option<usize>,
        target: DisconnectTarget,
    ) -> Result<(), Error> {
        self.ensure_open()?;

        let selected = |o: &OutputAddr, i: &InputAddr| {
            o.node == from
                && output.map_or(true, |output| o.output == output)
                && match (target, *i) {
                    (DisconnectTarget::Any, _) => true,
                    (DisconnectTarget::Node(id), InputAddr::Node { node, .. }) => node == id,
                    (DisconnectTarget::NodeInput(id, input), InputAddr::Node { node, input: i }) => {
                        node == id && input == i
                    }
                    (DisconnectTarget::Param(id, param), InputAddr::Param { node, param: p }) => {
                        node == id && param == p
                    }
                    _ => false,
                }
        };

        let removed: Vec<_> = {
            let mut connections = self.inner.connections.lock();
            let removed: Vec<_> = connections
                .iter()
                .filter(|(o, i)| selected(o, i))
                .copied()
                .collect();
            removed.iter().for_each(|edge| {
                connections.remove(edge);
            });
            removed
        };

        if removed.is_empty() && target != DisconnectTarget::Any {
            return Err(Error::InvalidAccess(format!(
                "node {:?} is not connected to {:?}",
                from, target
            )));
        }

        for (from, to) in removed {
            self.submit(GraphMutation::Disconnect { from, to });
        }
        Ok(())
    }

    /// The sample rate (in sample-frames per second) at which the context handles audio.
    #[must_use]
    pub fn sample_rate(&self) -> f32 {
        self.inner.sample_rate
    }

    /// Time in seconds of the render quantum being rendered (or about to be rendered)
    #[must_use]
    pub fn current_time(&self) -> f64 {
        self.inner.frames_played.load(Ordering::SeqCst) as f64 / f64::from(self.inner.sample_rate)
    }

    /// Whether the render thread started rendering quanta
    pub(crate) fn has_rendered(&self) -> bool {
        self.inner.frames_played.load(Ordering::SeqCst) > 0
    }

    /// Returns state of current context
    #[must_use]
    pub fn state(&self) -> AudioContextState {
        self.inner.state.load(Ordering::SeqCst).into()
    }

    /// Force the state from the control side, once the render thread is gone
    pub(crate) fn set_state(&self, state: AudioContextState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    /// Maximum available channels for the audio destination
    #[must_use]
    pub(crate) fn max_channel_count(&self) -> usize {
        self.inner.max_channel_count
    }

    pub(crate) fn offline(&self) -> bool {
        self.inner.offline
    }

    /// `ChannelConfig` of the `AudioDestinationNode`
    pub(crate) fn destination_channel_config(&self) -> ChannelConfig {
        self.inner.destination_channel_config.clone()
    }

    /// Returns the `AudioListener` which is used for 3D spatialization
    pub(crate) fn listener(&self) -> AudioListener {
        self.inner.listener.clone()
    }

    /// Number of nodes in the render graph, including the destination
    #[doc(hidden)]
    pub fn node_count(&self) -> usize {
        self.inner.scheduler.lock().node_count()
    }

    /// Number of started scheduled sources that did not finish yet
    #[doc(hidden)]
    pub fn active_source_count(&self) -> usize {
        self.inner.scheduler.lock().active_source_count()
    }

    pub(crate) fn output_reallocations(&self, id: AudioNodeId, output: usize) -> u64 {
        self.inner.scheduler.lock().output_reallocations(id, output)
    }

    pub(crate) fn set_event_handler(&self, event: EventType, callback: EventHandler) {
        self.inner.event_loop.set_handler(event, callback);
    }

    pub(crate) fn clear_event_handler(&self, event: EventType) {
        self.inner.event_loop.clear_handler(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OfflineAudioContext;

    #[test]
    fn test_disconnect_unknown_edge() {
        let context = OfflineAudioContext::new(1, 128, 48000.).unwrap();
        let gain = context.create_gain().unwrap();
        let other = context.create_gain().unwrap();

        assert!(matches!(
            gain.disconnect_dest(&other),
            Err(Error::InvalidAccess(_))
        ));
        // disconnecting everything never fails
        assert!(gain.disconnect().is_ok());

        gain.connect(&other).unwrap();
        assert!(gain.disconnect_dest(&other).is_ok());
        assert!(gain.disconnect_dest(&other).is_err());
    }

    #[test]
    fn test_disconnect_selection() {
        let context = OfflineAudioContext::new(1, 128, 48000.).unwrap();
        let src = context.create_constant_source().unwrap();
        let gain = context.create_gain().unwrap();

        src.connect(&gain).unwrap();
        src.connect_param(gain.gain()).unwrap();

        // the node target does not cover its params
        src.disconnect_dest(&gain).unwrap();
        assert!(src.disconnect_dest(&gain).is_err());
        src.disconnect_param(gain.gain()).unwrap();
        assert!(src.disconnect_param(gain.gain()).is_err());
    }

    #[test]
    fn test_node_ids_are_unique() {
        let context = OfflineAudioContext::new(1, 128, 48000.).unwrap();
        let a = context.create_gain().unwrap();
        let b = context.create_gain().unwrap();
        assert_ne!(a.registration().id(), b.registration().id());
        assert_ne!(a.registration().id(), DESTINATION_NODE_ID);
        assert_eq!(context.base().node_count(), 3);
    }
}
