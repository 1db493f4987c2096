//! Audio processing code that runs on the audio rendering thread
use crate::context::{AudioNodeId, AudioParamId};
use crate::events::EventDispatch;

use super::ports::ParamInput;
use super::AudioRenderQuantum;

use crossbeam_channel::Sender;
use std::any::Any;
use std::cell::{Cell, RefCell};

/// The execution context of all AudioProcessors in a given context, for one render quantum
#[non_exhaustive]
pub struct RenderScope {
    /// Index of the first sample frame of this quantum
    pub current_frame: u64,
    /// Context time of the first sample frame of this quantum
    pub current_time: f64,
    pub sample_rate: f32,

    pub(crate) node_id: Cell<AudioNodeId>,
    // requests raised while the graph is borrowed, handled after the quantum is rendered
    pub(crate) finished: RefCell<Vec<AudioNodeId>>,
    pub(crate) event_sender: Option<Sender<EventDispatch>>,
}

impl RenderScope {
    pub(crate) fn new(current_frame: u64, sample_rate: f32) -> Self {
        Self {
            current_frame,
            current_time: current_frame as f64 / f64::from(sample_rate),
            sample_rate,
            node_id: Cell::new(AudioNodeId(0)),
            finished: RefCell::new(Vec::with_capacity(16)),
            event_sender: None,
        }
    }

    pub(crate) fn with_event_sender(mut self, sender: Sender<EventDispatch>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    /// Dispatch the `ended` event of the node being processed
    pub(crate) fn send_ended_event(&self) {
        self.send_event(EventDispatch::ended(self.node_id.get()));
    }

    /// Report a panic of the processor being processed to the control thread
    pub(crate) fn report_error(&self, payload: Box<dyn Any + Send>) {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        self.send_event(EventDispatch::processor_error(self.node_id.get(), message));
    }

    fn send_event(&self, event: EventDispatch) {
        if let Some(sender) = &self.event_sender {
            // bounded channel, never block the render thread
            let _ = sender.try_send(event);
        }
    }

    /// Report that the node being processed has reached the end of its playback
    ///
    /// The node leaves the active-source set once the current quantum completes.
    pub(crate) fn notify_finished(&self) {
        self.finished.borrow_mut().push(self.node_id.get());
    }

    pub(crate) fn take_finished(&self) -> Vec<AudioNodeId> {
        std::mem::take(&mut *self.finished.borrow_mut())
    }
}

/// Interface for audio processing code that runs on the audio rendering thread.
///
/// The AudioProcessor is constructed together with an [`AudioNode`](crate::node::AudioNode) (the
/// user facing object that lives in the control thread). See
/// [`ConcreteBaseAudioContext::register`](crate::context::ConcreteBaseAudioContext::register).
pub trait AudioProcessor: Send {
    /// Audio processing function
    ///
    /// Output buffers are handed over with the channel count the graph negotiated for them at the
    /// start of the quantum. A processor that writes a different channel count is mixed back.
    ///
    /// # Return value
    ///
    /// `true` while the processor is still producing output from past input (a ringing delay
    /// line, a playing source). Long-tail nodes whose outputs would be disabled stay enabled until
    /// this returns `false` or their tail time has elapsed.
    fn process(
        &mut self,
        inputs: &[AudioRenderQuantum],
        outputs: &mut [AudioRenderQuantum],
        params: AudioParamValues<'_>,
        scope: &RenderScope,
    ) -> bool;

    /// Duration in seconds the node may still produce output after its inputs went silent
    fn tail_time(&self) -> f64 {
        0.
    }

    /// Processing delay in seconds between input and the corresponding output
    fn latency_time(&self) -> f64 {
        0.
    }

    /// Whether silent inputs may skip `process` and yield silent outputs
    fn propagates_silence(&self, last_non_silent_time: f64, current_time: f64) -> bool {
        last_non_silent_time + self.latency_time() + self.tail_time() < current_time
    }

    /// Whether the (first) output channel count tracks the computed input channel count
    fn follows_input_channel_count(&self) -> bool {
        false
    }
}

/// Accessor for current [`crate::param::AudioParam`] values
///
/// Provided to implementations of [`AudioProcessor`] in the render thread
pub struct AudioParamValues<'a> {
    params: &'a [ParamInput],
}

impl<'a> AudioParamValues<'a> {
    pub(crate) fn from(params: &'a [ParamInput]) -> Self {
        Self { params }
    }

    /// Get the computed values for the given [`crate::param::AudioParam`]
    ///
    /// For k-rate params or if the (a-rate) parameter is constant for this block, it will
    /// provide a slice of length 1. In other cases, i.e. a-rate param with scheduled
    /// automations or audio-rate input, it will provide a slice of length
    /// [`crate::RENDER_QUANTUM_SIZE`]
    ///
    /// # Panics
    ///
    /// Panics when the id does not belong to the node being processed
    pub fn get(&self, index: &AudioParamId) -> &'a [f32] {
        self.params[index.0].processor.values()
    }
}
