//! Connection endpoints of render-side nodes
//!
//! Every port keeps the full set of connections, edited under the graph lock, next to a
//! rendering snapshot that only changes at quantum boundaries.
use smallvec::SmallVec;

use crate::context::AudioNodeId;
use crate::param::AudioParamProcessor;

use super::AudioRenderQuantum;

/// Address of an output port
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct OutputAddr {
    pub node: AudioNodeId,
    pub output: usize,
}

/// Address of a summing junction: a node input or a param
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum InputAddr {
    Node { node: AudioNodeId, input: usize },
    Param { node: AudioNodeId, param: usize },
}

impl InputAddr {
    pub fn node(&self) -> AudioNodeId {
        match *self {
            Self::Node { node, .. } | Self::Param { node, .. } => node,
        }
    }
}

/// Summing point of zero or more upstream outputs
#[derive(Debug, Default)]
pub(crate) struct Junction {
    /// enabled connections
    connected: SmallVec<[OutputAddr; 4]>,
    /// connections whose upstream node disabled its outputs
    disabled: SmallVec<[OutputAddr; 2]>,
    /// snapshot of `connected`, read while rendering
    rendering: SmallVec<[OutputAddr; 4]>,
    dirty: bool,
}

impl Junction {
    /// Returns false if the output was already connected
    pub fn connect(&mut self, output: OutputAddr, enabled: bool) -> bool {
        if self.connected.contains(&output) || self.disabled.contains(&output) {
            return false;
        }
        if enabled {
            self.connected.push(output);
            self.dirty = true;
        } else {
            self.disabled.push(output);
        }
        true
    }

    /// Returns false if the output was not connected
    pub fn disconnect(&mut self, output: OutputAddr) -> bool {
        if let Some(pos) = self.connected.iter().position(|o| *o == output) {
            self.connected.remove(pos);
            self.dirty = true;
            true
        } else if let Some(pos) = self.disabled.iter().position(|o| *o == output) {
            self.disabled.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn disable(&mut self, output: OutputAddr) {
        if let Some(pos) = self.connected.iter().position(|o| *o == output) {
            self.connected.remove(pos);
            self.disabled.push(output);
            self.dirty = true;
        }
    }

    pub fn enable(&mut self, output: OutputAddr) {
        if let Some(pos) = self.disabled.iter().position(|o| *o == output) {
            self.disabled.remove(pos);
            self.connected.push(output);
            self.dirty = true;
        }
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Copy the connection set into the rendering snapshot
    pub fn update_rendering_state(&mut self) {
        if self.dirty {
            self.rendering.clone_from(&self.connected);
            self.dirty = false;
        }
    }

    pub fn rendering_outputs(&self) -> &[OutputAddr] {
        &self.rendering
    }

    pub fn enabled_outputs(&self) -> &[OutputAddr] {
        &self.connected
    }

    #[cfg(test)]
    pub fn disabled_outputs(&self) -> &[OutputAddr] {
        &self.disabled
    }
}

/// Input port of a node
#[derive(Debug)]
pub(crate) struct InputPort {
    pub junction: Junction,
    /// effective channel count, following the node's channel count mode
    pub computed_channels: usize,
}

impl InputPort {
    pub fn new() -> Self {
        Self {
            junction: Junction::default(),
            computed_channels: 1,
        }
    }
}

/// Output port of a node
///
/// The signal buffer itself lives next to the port in the node so processors get a contiguous
/// slice of output buffers.
#[derive(Debug)]
pub(crate) struct OutputPort {
    /// requested channel count, may change at any time under the graph lock
    pub desired_channels: usize,
    /// channel count of the buffer, only changes at a quantum boundary
    pub actual_channels: usize,
    /// full set of connected node inputs and params
    pub targets: SmallVec<[InputAddr; 4]>,
    rendering_fan_out: usize,
    rendering_param_fan_out: usize,
    reallocations: u64,
}

impl OutputPort {
    pub fn new(channels: usize) -> Self {
        Self {
            desired_channels: channels,
            actual_channels: channels,
            targets: SmallVec::new(),
            rendering_fan_out: 0,
            rendering_param_fan_out: 0,
            reallocations: 0,
        }
    }

    /// Record a new desired channel count, returns true when a boundary update is needed
    pub fn set_desired_channels(&mut self, n: usize) -> bool {
        self.desired_channels = n;
        self.desired_channels != self.actual_channels
    }

    /// Apply the desired channel count, reallocating the buffer only when it changed
    pub fn update_number_of_channels(&mut self, buffer: &mut AudioRenderQuantum) -> bool {
        if self.desired_channels == self.actual_channels {
            return false;
        }
        self.actual_channels = self.desired_channels;
        *buffer = AudioRenderQuantum::silence(self.actual_channels);
        self.reallocations += 1;
        true
    }

    /// Refresh the fan-out counts used while rendering
    pub fn update_rendering_state(&mut self, enabled: bool) {
        if enabled {
            self.rendering_fan_out = self
                .targets
                .iter()
                .filter(|t| matches!(t, InputAddr::Node { .. }))
                .count();
            self.rendering_param_fan_out = self.targets.len() - self.rendering_fan_out;
        } else {
            self.rendering_fan_out = 0;
            self.rendering_param_fan_out = 0;
        }
    }

    /// A single consumer may take the buffer as is instead of summing a copy
    pub fn renders_in_place(&self) -> bool {
        self.rendering_fan_out + self.rendering_param_fan_out == 1
    }

    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }
}

/// Audio-rate input of a param, with the param's render-side state
pub(crate) struct ParamInput {
    pub junction: Junction,
    pub bus: AudioRenderQuantum,
    pub processor: AudioParamProcessor,
}

impl ParamInput {
    pub fn new(processor: AudioParamProcessor) -> Self {
        Self {
            junction: Junction::default(),
            bus: AudioRenderQuantum::silence(1),
            processor,
        }
    }
}
