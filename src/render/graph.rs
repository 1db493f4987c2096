//! The audio graph topology and render algorithm

use std::panic::{self, AssertUnwindSafe};

use smallvec::SmallVec;

use crate::context::{AudioNodeId, DESTINATION_NODE_ID};
use crate::node::{ChannelConfigInner, ChannelCountMode, ChannelInterpretation};
use crate::param::AudioParamProcessor;
use crate::RENDER_QUANTUM_SIZE;

use super::node_collection::NodeCollection;
use super::ports::{InputAddr, InputPort, Junction, OutputAddr, OutputPort, ParamInput};
use super::{AudioParamValues, AudioProcessor, AudioRenderQuantum, RenderScope};

/// Edit of the graph topology or channel configuration
///
/// Built on the control thread and applied under the graph lock, either right away or at the
/// start of the next render quantum when the render thread holds the lock.
pub(crate) enum GraphMutation {
    AddNode {
        id: AudioNodeId,
        node: Box<Node>,
    },
    Connect {
        from: OutputAddr,
        to: InputAddr,
    },
    Disconnect {
        from: OutputAddr,
        to: InputAddr,
    },
    SetChannelCount {
        id: AudioNodeId,
        count: usize,
    },
    SetChannelCountMode {
        id: AudioNodeId,
        mode: ChannelCountMode,
    },
    SetChannelInterpretation {
        id: AudioNodeId,
        interpretation: ChannelInterpretation,
    },
    SetOutputChannels {
        id: AudioNodeId,
        output: usize,
        channels: usize,
    },
    /// A scheduled source was started, keep it alive and pulled until it finishes
    ActivateSource {
        id: AudioNodeId,
    },
    /// The control handle of the node was dropped
    ReleaseScriptRef {
        id: AudioNodeId,
    },
}

impl std::fmt::Debug for GraphMutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddNode { id, .. } => f.debug_struct("AddNode").field("id", id).finish(),
            Self::Connect { from, to } => f
                .debug_struct("Connect")
                .field("from", from)
                .field("to", to)
                .finish(),
            Self::Disconnect { from, to } => f
                .debug_struct("Disconnect")
                .field("from", from)
                .field("to", to)
                .finish(),
            Self::SetChannelCount { id, count } => f
                .debug_struct("SetChannelCount")
                .field("id", id)
                .field("count", count)
                .finish(),
            Self::SetChannelCountMode { id, mode } => f
                .debug_struct("SetChannelCountMode")
                .field("id", id)
                .field("mode", mode)
                .finish(),
            Self::SetChannelInterpretation { id, interpretation } => f
                .debug_struct("SetChannelInterpretation")
                .field("id", id)
                .field("interpretation", interpretation)
                .finish(),
            Self::SetOutputChannels {
                id,
                output,
                channels,
            } => f
                .debug_struct("SetOutputChannels")
                .field("id", id)
                .field("output", output)
                .field("channels", channels)
                .finish(),
            Self::ActivateSource { id } => {
                f.debug_struct("ActivateSource").field("id", id).finish()
            }
            Self::ReleaseScriptRef { id } => {
                f.debug_struct("ReleaseScriptRef").field("id", id).finish()
            }
        }
    }
}

/// Renderer Node in the Audio Graph
pub(crate) struct Node {
    /// Renderer: converts inputs to outputs
    processor: Box<dyn AudioProcessor>,
    inputs: Vec<InputPort>,
    /// Summed signal of each input, handed to the processor
    input_buffers: Vec<AudioRenderQuantum>,
    outputs: Vec<OutputPort>,
    /// Signal of each output, read by downstream junctions
    output_buffers: Vec<AudioRenderQuantum>,
    params: Vec<ParamInput>,
    channel_config: ChannelConfigInner,
    /// Count mode change waiting for the next quantum boundary
    pending_count_mode: Option<ChannelCountMode>,
    /// First frame of the quantum this node was last processed in
    last_processed_frame: Option<u64>,
    /// End time of the last quantum with non-silent input
    last_non_silent_time: f64,
    /// 1 while the control handle is alive
    script_refs: usize,
    /// Number of incoming connections, to inputs and params, enabled or not
    connection_refs: usize,
    outputs_disabled: bool,
    is_active_source: bool,
    marked_for_deletion: bool,
    /// Return value of the last `process` call
    tail_active: bool,
    /// The processor panicked, it outputs silence from now on
    processor_failed: bool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("channel_config", &self.channel_config)
            .field("script_refs", &self.script_refs)
            .field("connection_refs", &self.connection_refs)
            .field("outputs_disabled", &self.outputs_disabled)
            .field("is_active_source", &self.is_active_source)
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn new(
        processor: Box<dyn AudioProcessor>,
        number_of_inputs: usize,
        number_of_outputs: usize,
        channel_config: ChannelConfigInner,
        params: Vec<AudioParamProcessor>,
    ) -> Self {
        // everything starts as a single channel of silence, the first quantum boundary negotiates
        // the actual channel counts
        Self {
            processor,
            inputs: (0..number_of_inputs).map(|_| InputPort::new()).collect(),
            input_buffers: vec![AudioRenderQuantum::silence(1); number_of_inputs],
            outputs: (0..number_of_outputs).map(|_| OutputPort::new(1)).collect(),
            output_buffers: vec![AudioRenderQuantum::silence(1); number_of_outputs],
            params: params.into_iter().map(ParamInput::new).collect(),
            channel_config,
            pending_count_mode: None,
            last_processed_frame: None,
            last_non_silent_time: -1.,
            script_refs: 1,
            connection_refs: 0,
            outputs_disabled: false,
            is_active_source: false,
            marked_for_deletion: false,
            tail_active: true,
            processor_failed: false,
        }
    }

    fn junction_mut(&mut self, addr: InputAddr) -> Option<&mut Junction> {
        match addr {
            InputAddr::Node { input, .. } => self.inputs.get_mut(input).map(|p| &mut p.junction),
            InputAddr::Param { param, .. } => self.params.get_mut(param).map(|p| &mut p.junction),
        }
    }

    fn has_enabled_inputs(&self) -> bool {
        self.inputs
            .iter()
            .any(|p| !p.junction.enabled_outputs().is_empty())
    }

    /// Connections leaving this node, as (from, to) pairs
    fn outgoing(&self, id: AudioNodeId) -> SmallVec<[(OutputAddr, InputAddr); 8]> {
        self.outputs
            .iter()
            .enumerate()
            .flat_map(|(output, port)| {
                port.targets
                    .iter()
                    .map(move |to| (OutputAddr { node: id, output }, *to))
            })
            .collect()
    }

    /// Still producing output after its inputs went silent
    fn is_ringing(&self, current_time: f64) -> bool {
        self.tail_active
            && !self
                .processor
                .propagates_silence(self.last_non_silent_time, current_time)
    }

    fn silence_outputs(&mut self) {
        self.outputs
            .iter()
            .zip(self.output_buffers.iter_mut())
            .for_each(|(port, buffer)| {
                buffer.set_number_of_channels(port.actual_channels);
                buffer.make_silent();
            });
    }
}

/// The audio graph
pub(crate) struct Graph {
    /// Processing Nodes
    nodes: NodeCollection,
    /// Start time of the quantum being rendered, or last rendered
    current_time: f64,
    /// Nodes whose input junctions or channel configuration changed
    dirty_inputs: Vec<AudioNodeId>,
    /// Nodes whose outputs changed channel count, fan-out or enabled state
    dirty_outputs: Vec<AudioNodeId>,
    /// Nodes with a count mode change waiting for the quantum boundary
    pending_count_mode: Vec<AudioNodeId>,
    /// Started scheduled sources that did not finish yet
    active_sources: Vec<AudioNodeId>,
    active_sources_dirty: bool,
    /// Snapshot of `active_sources`, pulled every quantum
    automatic_pull: Vec<AudioNodeId>,
    /// Long-tail nodes waiting for their tail to elapse
    tail_nodes: Vec<AudioNodeId>,
    /// Sources that reported the end of their playback during the last quantum
    finished_sources: Vec<AudioNodeId>,
    marked_for_deletion: Vec<AudioNodeId>,
    /// Removed nodes, to be freed on the control thread
    pending_deletion: Vec<(AudioNodeId, Node)>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("node_count", &self.nodes.len())
            .field("active_sources", &self.active_sources)
            .field("tail_nodes", &self.tail_nodes)
            .finish_non_exhaustive()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: NodeCollection::with_capacity(64),
            current_time: 0.,
            dirty_inputs: Vec::with_capacity(64),
            dirty_outputs: Vec::with_capacity(64),
            pending_count_mode: Vec::new(),
            active_sources: Vec::with_capacity(16),
            active_sources_dirty: false,
            automatic_pull: Vec::with_capacity(16),
            tail_nodes: Vec::new(),
            finished_sources: Vec::with_capacity(16),
            marked_for_deletion: Vec::new(),
            pending_deletion: Vec::new(),
        }
    }

    pub fn apply(&mut self, mutation: GraphMutation) {
        match mutation {
            GraphMutation::AddNode { id, node } => {
                self.nodes.insert(id, *node);
                self.dirty_inputs.push(id);
                self.dirty_outputs.push(id);
            }
            GraphMutation::Connect { from, to } => self.connect(from, to),
            GraphMutation::Disconnect { from, to } => self.disconnect(from, to),
            GraphMutation::SetChannelCount { id, count } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.channel_config.count = count;
                    self.dirty_inputs.push(id);
                }
            }
            GraphMutation::SetChannelCountMode { id, mode } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.pending_count_mode = Some(mode);
                    self.pending_count_mode.push(id);
                }
            }
            GraphMutation::SetChannelInterpretation { id, interpretation } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.channel_config.interpretation = interpretation;
                }
            }
            GraphMutation::SetOutputChannels {
                id,
                output,
                channels,
            } => {
                if let Some(port) = self
                    .nodes
                    .get_mut(id)
                    .and_then(|node| node.outputs.get_mut(output))
                {
                    if port.set_desired_channels(channels) {
                        self.dirty_outputs.push(id);
                    }
                }
            }
            GraphMutation::ActivateSource { id } => self.activate_source(id),
            GraphMutation::ReleaseScriptRef { id } => {
                let release = match self.nodes.get_mut(id) {
                    Some(node) => {
                        node.script_refs = 0;
                        node.connection_refs == 0
                    }
                    None => false,
                };
                if release {
                    self.maybe_release(id);
                }
            }
        }
    }

    fn connect(&mut self, from: OutputAddr, to: InputAddr) {
        let enabled = match self.nodes.get_mut(from.node) {
            Some(source) if !source.marked_for_deletion && from.output < source.outputs.len() => {
                !source.outputs_disabled
            }
            _ => return,
        };

        let added = match self.nodes.get_mut(to.node()) {
            Some(target) if !target.marked_for_deletion => {
                let added = target
                    .junction_mut(to)
                    .map_or(false, |j| j.connect(from, enabled));
                if added {
                    target.connection_refs += 1;
                }
                added
            }
            _ => false,
        };
        if !added {
            return;
        }

        if let Some(source) = self.nodes.get_mut(from.node) {
            source.outputs[from.output].targets.push(to);
        }
        self.dirty_inputs.push(to.node());
        self.dirty_outputs.push(from.node);

        if let InputAddr::Node { node, .. } = to {
            if enabled {
                self.enable_outputs(node);
            }
        }
    }

    fn disconnect(&mut self, from: OutputAddr, to: InputAddr) {
        let removed = self
            .nodes
            .get_mut(to.node())
            .and_then(|target| target.junction_mut(to))
            .map_or(false, |j| j.disconnect(from));
        if !removed {
            return;
        }

        if let Some(port) = self
            .nodes
            .get_mut(from.node)
            .and_then(|source| source.outputs.get_mut(from.output))
        {
            port.targets.retain(|t| *t != to);
        }
        self.dirty_inputs.push(to.node());
        self.dirty_outputs.push(from.node);

        self.break_connection(to.node());
    }

    /// An incoming connection of `id` was removed
    fn break_connection(&mut self, id: AudioNodeId) {
        let release = match self.nodes.get_mut(id) {
            Some(node) => {
                node.connection_refs = node.connection_refs.saturating_sub(1);
                node.connection_refs == 0 && node.script_refs == 0
            }
            None => return,
        };

        if release {
            self.maybe_release(id);
        } else {
            self.disable_outputs_if_necessary(id);
        }
    }

    /// Stop driving downstream inputs when no enabled input connection is left
    fn disable_outputs_if_necessary(&mut self, id: AudioNodeId) {
        let long_tail = match self.nodes.get(id) {
            Some(node) => {
                let node = node.borrow();
                if node.outputs_disabled
                    || node.marked_for_deletion
                    || node.inputs.is_empty()
                    || node.has_enabled_inputs()
                {
                    return;
                }
                node.processor.tail_time() > 0.
            }
            None => return,
        };

        if long_tail {
            // keeps ringing, revisited after every quantum
            if !self.tail_nodes.contains(&id) {
                self.tail_nodes.push(id);
            }
        } else {
            self.disable_outputs(id);
        }
    }

    fn disable_outputs(&mut self, id: AudioNodeId) {
        let outgoing = match self.nodes.get_mut(id) {
            Some(node) if !node.outputs_disabled => {
                node.outputs_disabled = true;
                node.outgoing(id)
            }
            _ => return,
        };
        self.dirty_outputs.push(id);

        for (from, to) in outgoing {
            if let Some(j) = self
                .nodes
                .get_mut(to.node())
                .and_then(|target| target.junction_mut(to))
            {
                j.disable(from);
            }
            self.dirty_inputs.push(to.node());
            if let InputAddr::Node { node, .. } = to {
                self.disable_outputs_if_necessary(node);
            }
        }
    }

    fn enable_outputs(&mut self, id: AudioNodeId) {
        self.tail_nodes.retain(|n| *n != id);

        let outgoing = match self.nodes.get_mut(id) {
            Some(node) if node.outputs_disabled => {
                node.outputs_disabled = false;
                node.outgoing(id)
            }
            _ => return,
        };
        self.dirty_outputs.push(id);

        for (from, to) in outgoing {
            if let Some(j) = self
                .nodes
                .get_mut(to.node())
                .and_then(|target| target.junction_mut(to))
            {
                j.enable(from);
            }
            self.dirty_inputs.push(to.node());
            if let InputAddr::Node { node, .. } = to {
                self.enable_outputs(node);
            }
        }
    }

    fn activate_source(&mut self, id: AudioNodeId) {
        if let Some(node) = self.nodes.get_mut(id) {
            if !node.is_active_source {
                node.is_active_source = true;
                self.active_sources.push(id);
                self.active_sources_dirty = true;
            }
        }
    }

    fn finish_source(&mut self, id: AudioNodeId) {
        let release = match self.nodes.get_mut(id) {
            Some(node) if node.is_active_source => {
                node.is_active_source = false;
                node.script_refs == 0 && node.connection_refs == 0
            }
            _ => return,
        };
        self.active_sources.retain(|n| *n != id);
        self.active_sources_dirty = true;

        if release {
            self.maybe_release(id);
        }
    }

    /// Mark the node for teardown when nothing keeps it alive anymore
    fn maybe_release(&mut self, id: AudioNodeId) {
        let current_time = self.current_time;
        let ringing = match self.nodes.get_mut(id) {
            Some(node) => {
                if node.script_refs > 0
                    || node.connection_refs > 0
                    || node.is_active_source
                    || node.marked_for_deletion
                {
                    return;
                }
                node.processor.tail_time() > 0. && node.is_ringing(current_time)
            }
            None => return,
        };

        if ringing {
            if !self.tail_nodes.contains(&id) {
                self.tail_nodes.push(id);
            }
            return;
        }

        if let Some(node) = self.nodes.get_mut(id) {
            node.marked_for_deletion = true;
        }
        self.marked_for_deletion.push(id);
    }

    /// Revisit long-tail nodes whose tail may have elapsed
    fn check_tail_nodes(&mut self) {
        let current_time = self.current_time;
        let mut i = 0;
        while i < self.tail_nodes.len() {
            let id = self.tail_nodes[i];
            let state = self.nodes.get_mut(id).map(|node| {
                (
                    node.is_ringing(current_time),
                    node.script_refs == 0 && node.connection_refs == 0,
                    node.has_enabled_inputs(),
                )
            });

            match state {
                Some((true, _, _)) => i += 1,
                Some((false, release, has_enabled_inputs)) => {
                    self.tail_nodes.swap_remove(i);
                    if release {
                        self.maybe_release(id);
                    } else if !has_enabled_inputs {
                        self.disable_outputs(id);
                    }
                }
                None => {
                    self.tail_nodes.swap_remove(i);
                }
            }
        }
    }

    /// Remove the nodes marked for deletion from the graph
    ///
    /// Their outgoing connections are broken, which may release further nodes downstream.
    fn teardown_marked_nodes(&mut self) {
        while let Some(id) = self.marked_for_deletion.pop() {
            let mut node = match self.nodes.remove(id) {
                Some(node) => node,
                None => continue,
            };
            self.tail_nodes.retain(|n| *n != id);
            if node.is_active_source {
                self.active_sources.retain(|n| *n != id);
                self.active_sources_dirty = true;
            }

            for (from, to) in node.outgoing(id) {
                let removed = self
                    .nodes
                    .get_mut(to.node())
                    .and_then(|target| target.junction_mut(to))
                    .map_or(false, |j| j.disconnect(from));
                if removed {
                    self.dirty_inputs.push(to.node());
                    self.break_connection(to.node());
                }
            }
            node.outputs.iter_mut().for_each(|port| port.targets.clear());

            self.pending_deletion.push((id, node));
        }
    }

    /// Bring the rendering state up to date, in a fixed order: count mode changes, junction
    /// snapshots and input channel counts, output channel counts, the automatic pull list
    pub fn update_rendering_state(&mut self) {
        for id in std::mem::take(&mut self.pending_count_mode) {
            if let Some(node) = self.nodes.get_mut(id) {
                if let Some(mode) = node.pending_count_mode.take() {
                    node.channel_config.count_mode = mode;
                    self.dirty_inputs.push(id);
                }
            }
        }

        // channel counts ripple downstream one hop per pass, cycles may never settle
        let max_passes = self.nodes.len() + 1;
        for _ in 0..max_passes {
            if self.dirty_inputs.is_empty() && self.dirty_outputs.is_empty() {
                break;
            }

            let mut dirty = std::mem::take(&mut self.dirty_inputs);
            dirty.sort_unstable_by_key(|id| id.0);
            dirty.dedup();
            dirty.iter().for_each(|id| self.update_inputs(*id));

            let mut dirty = std::mem::take(&mut self.dirty_outputs);
            dirty.sort_unstable_by_key(|id| id.0);
            dirty.dedup();
            dirty.iter().for_each(|id| self.update_outputs(*id));
        }

        if self.active_sources_dirty {
            self.automatic_pull.clone_from(&self.active_sources);
            self.active_sources_dirty = false;
        }
    }

    fn update_inputs(&mut self, id: AudioNodeId) {
        let mut rendering: SmallVec<[SmallVec<[OutputAddr; 4]>; 2]> = SmallVec::new();
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.params
                    .iter_mut()
                    .for_each(|p| p.junction.update_rendering_state());
                for port in node.inputs.iter_mut() {
                    port.junction.update_rendering_state();
                    rendering.push(port.junction.rendering_outputs().into());
                }
            }
            None => return,
        }

        // widest connected output per input, zero when unconnected
        let widest: SmallVec<[usize; 2]> = rendering
            .iter()
            .map(|outputs| {
                outputs
                    .iter()
                    .filter_map(|o| {
                        let upstream = self.nodes.get(o.node)?.try_borrow().ok()?;
                        upstream.outputs.get(o.output).map(|p| p.actual_channels)
                    })
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let node = match self.nodes.get_mut(id) {
            Some(node) => node,
            None => return,
        };
        for (port, widest) in node.inputs.iter_mut().zip(widest) {
            port.computed_channels = node.channel_config.computed_number_of_channels(widest);
        }

        if node.processor.follows_input_channel_count() {
            if let (Some(input), Some(output)) = (node.inputs.first(), node.outputs.first_mut()) {
                if output.set_desired_channels(input.computed_channels) {
                    self.dirty_outputs.push(id);
                }
            }
        }
    }

    fn update_outputs(&mut self, id: AudioNodeId) {
        let mut notify: SmallVec<[AudioNodeId; 8]> = SmallVec::new();
        match self.nodes.get_mut(id) {
            Some(node) => {
                let enabled = !node.outputs_disabled;
                for (port, buffer) in node.outputs.iter_mut().zip(node.output_buffers.iter_mut()) {
                    port.update_rendering_state(enabled);
                    if port.update_number_of_channels(buffer) {
                        notify.extend(port.targets.iter().map(InputAddr::node));
                    }
                }
            }
            None => return,
        }
        self.dirty_inputs.extend(notify);
    }

    /// Render a single quantum, returns the signal of the destination node
    ///
    /// The destination is pulled first, followed by the playing sources so they progress even
    /// when they are not connected to the destination.
    pub fn render(&mut self, scope: &RenderScope) -> AudioRenderQuantum {
        self.current_time = scope.current_time;
        self.update_rendering_state();

        process_if_necessary(&self.nodes, DESTINATION_NODE_ID, scope);
        for id in &self.automatic_pull {
            process_if_necessary(&self.nodes, *id, scope);
        }

        let output = self
            .nodes
            .get(DESTINATION_NODE_ID)
            .and_then(|node| node.borrow().output_buffers.first().cloned())
            .unwrap_or_else(|| AudioRenderQuantum::silence(1));

        // move on to the end of the quantum for the bookkeeping
        self.current_time =
            scope.current_time + RENDER_QUANTUM_SIZE as f64 / f64::from(scope.sample_rate);
        self.finished_sources.extend(scope.take_finished());
        self.after_render();

        output
    }

    /// Quantum end: finished sources, expired tails, teardown and a final state update
    fn after_render(&mut self) {
        for id in std::mem::take(&mut self.finished_sources) {
            self.finish_source(id);
        }
        self.check_tail_nodes();
        self.teardown_marked_nodes();
        self.update_rendering_state();
    }

    /// Nodes removed from the graph since the last call
    pub fn take_pending_deletion(&mut self) -> Vec<(AudioNodeId, Node)> {
        std::mem::take(&mut self.pending_deletion)
    }

    pub fn has_pending_deletion(&self) -> bool {
        !self.pending_deletion.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn active_source_count(&self) -> usize {
        self.active_sources.len()
    }

    pub fn output_reallocations(&self, id: AudioNodeId, output: usize) -> u64 {
        self.nodes
            .get(id)
            .and_then(|node| node.borrow().outputs.get(output).map(OutputPort::reallocations))
            .unwrap_or(0)
    }
}

/// Process the node unless it already ran for this quantum
///
/// Upstream nodes are pulled recursively. A node that is reached again while it is being
/// processed (a cycle) is skipped, its readers get silence.
fn process_if_necessary(nodes: &NodeCollection, id: AudioNodeId, scope: &RenderScope) {
    let cell = match nodes.get(id) {
        Some(cell) => cell,
        None => return,
    };
    let mut guard = match cell.try_borrow_mut() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    if guard.last_processed_frame == Some(scope.current_frame) {
        return;
    }
    guard.last_processed_frame = Some(scope.current_frame);

    let node = &mut *guard;
    let interpretation = node.channel_config.interpretation;

    for (port, buffer) in node.inputs.iter().zip(node.input_buffers.iter_mut()) {
        pull_junction(
            nodes,
            &port.junction,
            buffer,
            port.computed_channels,
            interpretation,
            scope,
        );
    }

    for param in node.params.iter_mut() {
        let ParamInput {
            junction,
            bus,
            processor,
        } = param;
        if junction.rendering_outputs().is_empty() {
            processor.compute(scope, None);
        } else {
            pull_junction(nodes, junction, bus, 1, ChannelInterpretation::Speakers, scope);
            processor.compute(scope, Some(&*bus));
        }
    }

    if node.processor_failed {
        node.silence_outputs();
        return;
    }

    let inputs_silent = node.input_buffers.iter().all(AudioRenderQuantum::is_silent);
    if !node.inputs.is_empty()
        && inputs_silent
        && node
            .processor
            .propagates_silence(node.last_non_silent_time, scope.current_time)
    {
        node.silence_outputs();
        return;
    }
    if !inputs_silent {
        node.last_non_silent_time =
            scope.current_time + RENDER_QUANTUM_SIZE as f64 / f64::from(scope.sample_rate);
    }

    for (port, buffer) in node.outputs.iter().zip(node.output_buffers.iter_mut()) {
        buffer.set_number_of_channels(port.actual_channels);
    }

    scope.node_id.set(id);
    let Node {
        processor,
        input_buffers,
        output_buffers,
        params,
        ..
    } = &mut *node;
    let params = AudioParamValues::from(&params[..]);
    // The processor may be left in an inconsistent state after a panic, it is never called again.
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        processor.process(&input_buffers[..], &mut output_buffers[..], params, scope)
    }));

    match result {
        Ok(tail_active) => node.tail_active = tail_active,
        Err(payload) => {
            node.processor_failed = true;
            node.tail_active = false;
            node.silence_outputs();
            scope.report_error(payload);
            if node.is_active_source {
                // a failed source never reaches its stop time, it ends now
                scope.notify_finished();
                scope.send_ended_event();
            }
            return;
        }
    }

    // a processor may write a different channel count than negotiated
    for (port, buffer) in node.outputs.iter().zip(node.output_buffers.iter_mut()) {
        if buffer.number_of_channels() != port.actual_channels {
            buffer.mix(port.actual_channels, interpretation);
        }
    }
}

/// Sum the rendering set of `junction` into `buffer`, mixed to `channels`
fn pull_junction(
    nodes: &NodeCollection,
    junction: &Junction,
    buffer: &mut AudioRenderQuantum,
    channels: usize,
    interpretation: ChannelInterpretation,
    scope: &RenderScope,
) {
    let outputs = junction.rendering_outputs();
    outputs
        .iter()
        .for_each(|o| process_if_necessary(nodes, o.node, scope));

    if let [single] = outputs {
        if let Some(upstream) = nodes.get(single.node).and_then(|n| n.try_borrow().ok()) {
            let port = &upstream.outputs[single.output];
            let signal = &upstream.output_buffers[single.output];
            if port.renders_in_place() && signal.number_of_channels() == channels {
                // single consumer with matching layout: share the buffer
                *buffer = signal.clone();
                return;
            }
        }
    }

    buffer.set_number_of_channels(channels);
    buffer.make_silent();
    for o in outputs {
        // unavailable upstream nodes (cycles) contribute silence
        if let Some(upstream) = nodes.get(o.node).and_then(|n| n.try_borrow().ok()) {
            buffer.add(&upstream.output_buffers[o.output], interpretation);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use float_eq::assert_float_eq;

    use super::*;

    /// Counts `process` calls, outputs a constant on every channel of its first output
    struct TestProcessor {
        calls: Arc<AtomicUsize>,
        value: f32,
        tail_time: f64,
        follows_input: bool,
        finish_after: Option<usize>,
    }

    impl TestProcessor {
        fn new(value: f32) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                value,
                tail_time: 0.,
                follows_input: false,
                finish_after: None,
            }
        }
    }

    impl AudioProcessor for TestProcessor {
        fn process(
            &mut self,
            inputs: &[AudioRenderQuantum],
            outputs: &mut [AudioRenderQuantum],
            _params: AudioParamValues<'_>,
            scope: &RenderScope,
        ) -> bool {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(output) = outputs.first_mut() {
                match inputs.first() {
                    Some(input) if self.value == 0. => *output = input.clone(),
                    _ => output
                        .channels_mut()
                        .iter_mut()
                        .for_each(|c| c.iter_mut().for_each(|s| *s = self.value)),
                }
            }
            if self.finish_after == Some(calls) {
                scope.notify_finished();
            }
            true
        }

        fn tail_time(&self) -> f64 {
            self.tail_time
        }

        fn follows_input_channel_count(&self) -> bool {
            self.follows_input
        }
    }

    struct PanicProcessor;

    impl AudioProcessor for PanicProcessor {
        fn process(
            &mut self,
            _inputs: &[AudioRenderQuantum],
            _outputs: &mut [AudioRenderQuantum],
            _params: AudioParamValues<'_>,
            _scope: &RenderScope,
        ) -> bool {
            panic!("test panic")
        }
    }

    fn config(count: usize, count_mode: ChannelCountMode) -> ChannelConfigInner {
        ChannelConfigInner {
            count,
            count_mode,
            interpretation: ChannelInterpretation::Speakers,
        }
    }

    fn add_node(graph: &mut Graph, id: u64, processor: impl AudioProcessor + 'static, inputs: usize) {
        let node = Node::new(
            Box::new(processor),
            inputs,
            1,
            config(2, ChannelCountMode::Max),
            vec![],
        );
        graph.apply(GraphMutation::AddNode {
            id: AudioNodeId(id),
            node: Box::new(node),
        });
    }

    fn add_destination(graph: &mut Graph) {
        let mut processor = TestProcessor::new(0.);
        processor.follows_input = true;
        let node = Node::new(
            Box::new(processor),
            1,
            1,
            config(2, ChannelCountMode::Explicit),
            vec![],
        );
        graph.apply(GraphMutation::AddNode {
            id: DESTINATION_NODE_ID,
            node: Box::new(node),
        });
    }

    fn connect(graph: &mut Graph, from: u64, to: u64) {
        graph.apply(GraphMutation::Connect {
            from: OutputAddr {
                node: AudioNodeId(from),
                output: 0,
            },
            to: InputAddr::Node {
                node: AudioNodeId(to),
                input: 0,
            },
        });
    }

    fn disconnect(graph: &mut Graph, from: u64, to: u64) {
        graph.apply(GraphMutation::Disconnect {
            from: OutputAddr {
                node: AudioNodeId(from),
                output: 0,
            },
            to: InputAddr::Node {
                node: AudioNodeId(to),
                input: 0,
            },
        });
    }

    fn scope(quantum: u64) -> RenderScope {
        RenderScope::new(quantum * RENDER_QUANTUM_SIZE as u64, 48000.)
    }

    fn node(graph: &Graph, id: u64) -> std::cell::Ref<'_, Node> {
        graph.nodes[AudioNodeId(id)].borrow()
    }

    #[test]
    fn test_fan_out_processes_once() {
        let mut graph = Graph::new();
        add_destination(&mut graph);

        let source = TestProcessor::new(1.);
        let calls = Arc::clone(&source.calls);
        add_node(&mut graph, 1, source, 0);
        add_node(&mut graph, 2, TestProcessor::new(0.), 1);
        add_node(&mut graph, 3, TestProcessor::new(0.), 1);

        connect(&mut graph, 1, 2);
        connect(&mut graph, 1, 3);
        connect(&mut graph, 2, 0);
        connect(&mut graph, 3, 0);

        for quantum in 0..4 {
            let output = graph.render(&scope(quantum));
            // both legs summed at the destination
            assert_float_eq!(output.channel_data(0)[0], 2., abs <= 0.);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_cycle_renders_silence() {
        let mut graph = Graph::new();
        add_destination(&mut graph);
        add_node(&mut graph, 1, TestProcessor::new(0.), 1);
        add_node(&mut graph, 2, TestProcessor::new(0.), 1);

        connect(&mut graph, 1, 2);
        connect(&mut graph, 2, 1);
        connect(&mut graph, 2, 0);

        let output = graph.render(&scope(0));
        assert!(output.is_silent());
    }

    #[test]
    fn test_channel_negotiation() {
        let mut graph = Graph::new();
        add_destination(&mut graph);
        add_node(&mut graph, 1, TestProcessor::new(1.), 0);
        let mut gain = TestProcessor::new(0.);
        gain.follows_input = true;
        add_node(&mut graph, 2, gain, 1);

        connect(&mut graph, 1, 2);
        connect(&mut graph, 2, 0);

        graph.apply(GraphMutation::SetOutputChannels {
            id: AudioNodeId(1),
            output: 0,
            channels: 2,
        });
        // desired count is not applied before the quantum boundary
        assert_eq!(node(&graph, 1).outputs[0].actual_channels, 1);

        let output = graph.render(&scope(0));
        assert_eq!(output.number_of_channels(), 2);
        assert_eq!(node(&graph, 2).inputs[0].computed_channels, 2);
        assert_eq!(node(&graph, 2).outputs[0].actual_channels, 2);
        let reallocations = graph.output_reallocations(AudioNodeId(2), 0);
        assert_eq!(reallocations, 1);

        // same value again: no reallocation, no dirty nodes
        for quantum in 1..5 {
            graph.apply(GraphMutation::SetOutputChannels {
                id: AudioNodeId(1),
                output: 0,
                channels: 2,
            });
            assert!(graph.dirty_outputs.is_empty());
            graph.render(&scope(quantum));
        }
        assert_eq!(graph.output_reallocations(AudioNodeId(2), 0), reallocations);
        assert_eq!(graph.output_reallocations(AudioNodeId(1), 0), 1);
    }

    #[test]
    fn test_count_mode_applies_at_boundary() {
        let mut graph = Graph::new();
        add_destination(&mut graph);
        add_node(&mut graph, 1, TestProcessor::new(1.), 0);
        add_node(&mut graph, 2, TestProcessor::new(0.), 1);
        connect(&mut graph, 1, 2);
        connect(&mut graph, 2, 0);
        graph.render(&scope(0));
        assert_eq!(node(&graph, 2).inputs[0].computed_channels, 1);

        graph.apply(GraphMutation::SetChannelCountMode {
            id: AudioNodeId(2),
            mode: ChannelCountMode::Explicit,
        });
        assert_eq!(node(&graph, 2).channel_config.count_mode, ChannelCountMode::Max);

        graph.render(&scope(1));
        assert_eq!(node(&graph, 2).channel_config.count_mode, ChannelCountMode::Explicit);
        assert_eq!(node(&graph, 2).inputs[0].computed_channels, 2);
    }

    #[test]
    fn test_disable_and_reenable_outputs() {
        let mut graph = Graph::new();
        add_destination(&mut graph);
        add_node(&mut graph, 1, TestProcessor::new(1.), 0);
        add_node(&mut graph, 2, TestProcessor::new(0.), 1);
        add_node(&mut graph, 3, TestProcessor::new(0.), 1);

        connect(&mut graph, 1, 2);
        connect(&mut graph, 2, 3);
        connect(&mut graph, 3, 0);
        graph.render(&scope(0));

        disconnect(&mut graph, 1, 2);
        // disabled, and the disabling cascades downstream
        assert!(node(&graph, 2).outputs_disabled);
        assert!(node(&graph, 3).outputs_disabled);
        assert_eq!(node(&graph, 3).connection_refs, 1);

        graph.render(&scope(1));
        assert!(node(&graph, 3).inputs[0]
            .junction
            .rendering_outputs()
            .is_empty());

        connect(&mut graph, 1, 2);
        assert!(!node(&graph, 2).outputs_disabled);
        assert!(!node(&graph, 3).outputs_disabled);
        let output = graph.render(&scope(2));
        assert_float_eq!(output.channel_data(0)[0], 1., abs <= 0.);
    }

    #[test]
    fn test_long_tail_node_stays_enabled() {
        let mut graph = Graph::new();
        add_destination(&mut graph);
        add_node(&mut graph, 1, TestProcessor::new(1.), 0);
        let mut delay = TestProcessor::new(0.);
        delay.tail_time = 128. / 48000.;
        add_node(&mut graph, 2, delay, 1);

        connect(&mut graph, 1, 2);
        connect(&mut graph, 2, 0);
        graph.render(&scope(0));

        disconnect(&mut graph, 1, 2);
        assert!(!node(&graph, 2).outputs_disabled);
        assert_eq!(graph.tail_nodes, vec![AudioNodeId(2)]);

        // ringing during the tail
        graph.render(&scope(1));
        assert!(!node(&graph, 2).outputs_disabled);

        // tail elapsed
        graph.render(&scope(2));
        graph.render(&scope(3));
        assert!(node(&graph, 2).outputs_disabled);
        assert!(graph.tail_nodes.is_empty());
    }

    #[test]
    fn test_release_and_teardown() {
        let mut graph = Graph::new();
        add_destination(&mut graph);
        add_node(&mut graph, 1, TestProcessor::new(1.), 0);
        add_node(&mut graph, 2, TestProcessor::new(0.), 1);
        connect(&mut graph, 1, 2);
        connect(&mut graph, 2, 0);

        // gain handle dropped, but kept alive by its incoming connection
        graph.apply(GraphMutation::ReleaseScriptRef { id: AudioNodeId(2) });
        graph.render(&scope(0));
        assert!(graph.take_pending_deletion().is_empty());

        // source handle dropped: nothing keeps it alive, teardown cascades to the gain
        graph.apply(GraphMutation::ReleaseScriptRef { id: AudioNodeId(1) });
        // marked nodes still render the current quantum
        let output = graph.render(&scope(1));
        assert_float_eq!(output.channel_data(0)[0], 1., abs <= 0.);

        let mut deleted: Vec<_> = graph
            .take_pending_deletion()
            .into_iter()
            .map(|(id, _)| id.0)
            .collect();
        deleted.sort_unstable();
        assert_eq!(deleted, vec![1, 2]);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(node(&graph, DESTINATION_NODE_ID.0).connection_refs, 0);
    }

    #[test]
    fn test_active_source_is_pulled_until_finished() {
        let mut graph = Graph::new();
        add_destination(&mut graph);

        let mut source = TestProcessor::new(1.);
        source.finish_after = Some(3);
        let calls = Arc::clone(&source.calls);
        // not connected to anything
        add_node(&mut graph, 1, source, 0);
        graph.apply(GraphMutation::ActivateSource { id: AudioNodeId(1) });
        graph.apply(GraphMutation::ReleaseScriptRef { id: AudioNodeId(1) });
        assert_eq!(graph.active_source_count(), 1);

        for quantum in 0..5 {
            graph.render(&scope(quantum));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(graph.active_source_count(), 0);
        assert_eq!(graph.take_pending_deletion().len(), 1);
    }

    #[test]
    fn test_silence_propagation_skips_process() {
        let mut graph = Graph::new();
        add_destination(&mut graph);
        let gain = TestProcessor::new(0.);
        let calls = Arc::clone(&gain.calls);
        add_node(&mut graph, 1, gain, 1);
        connect(&mut graph, 1, 0);

        for quantum in 0..4 {
            graph.render(&scope(quantum));
        }
        // never had non-silent input
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_processor_panic_outputs_silence() {
        let mut graph = Graph::new();
        add_destination(&mut graph);
        add_node(&mut graph, 1, PanicProcessor, 0);
        connect(&mut graph, 1, 0);

        let output = graph.render(&scope(0));
        assert!(output.is_silent());
        assert!(node(&graph, 1).processor_failed);

        // never called again
        let output = graph.render(&scope(1));
        assert!(output.is_silent());
    }

    #[test]
    fn test_panicking_source_is_finished() {
        let mut graph = Graph::new();
        add_destination(&mut graph);
        add_node(&mut graph, 1, PanicProcessor, 0);
        graph.apply(GraphMutation::ActivateSource { id: AudioNodeId(1) });
        graph.apply(GraphMutation::ReleaseScriptRef { id: AudioNodeId(1) });
        assert_eq!(graph.active_source_count(), 1);

        let output = graph.render(&scope(0));
        assert!(output.is_silent());
        assert!(node(&graph, 1).processor_failed);
        assert_eq!(graph.active_source_count(), 0);

        graph.render(&scope(1));
        assert_eq!(graph.take_pending_deletion().len(), 1);
    }
}
