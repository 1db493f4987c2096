//! The `BaseAudioContext` interface and the `AudioContext` and `OfflineAudioContext` types

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

mod base;
pub use base::*;

mod concrete_base;
pub use concrete_base::*;

mod offline;
pub use offline::*;

mod online;
pub use online::*;

use crate::param::{audio_param_pair, AudioParam, AudioParamDescriptor, AudioParamProcessor};
use crate::render::graph::GraphMutation;

/// Destination node id is always at index 0
pub(crate) const DESTINATION_NODE_ID: AudioNodeId = AudioNodeId(0);

/// Unique identifier for audio nodes.
///
/// Used for internal bookkeeping. Ids of freed nodes are handed out again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct AudioNodeId(pub u64);

/// Unique identifier for audio params.
///
/// Store these in your `AudioProcessor` to get access to `AudioParam` values.
#[derive(Debug)]
pub struct AudioParamId(pub(crate) usize);

/// Describes the current state of the `AudioContext`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AudioContextState {
    /// This context is currently suspended (context time is not proceeding,
    /// audio hardware may be powered down/released).
    Suspended,
    /// Audio is being processed.
    Running,
    /// This context has been released, and can no longer be used to process audio.
    /// All system audio resources have been released.
    Closed,
}

impl AudioContextState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suspended => "suspended",
            Self::Running => "running",
            Self::Closed => "closed",
        }
    }
}

impl From<u8> for AudioContextState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Suspended,
            1 => Self::Running,
            _ => Self::Closed,
        }
    }
}

/// Identify the type of playback, which affects tradeoffs between audio output latency and power
/// consumption
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AudioContextLatencyCategory {
    /// Balance audio output latency and power consumption.
    Balanced,
    /// Provide the lowest audio output latency possible without glitching. This is the default.
    Interactive,
    /// Prioritize sustained playback without interruption over audio output latency.
    ///
    /// Lowest power consumption.
    Playback,
    /// Specify the number of seconds of latency
    Custom(f64),
}

impl Default for AudioContextLatencyCategory {
    fn default() -> Self {
        Self::Interactive
    }
}

/// Specify the playback configuration for the [`AudioContext`] constructor.
///
/// All fields are optional and will default to the value best suited for interactive playback on
/// your hardware configuration.
#[derive(Clone, Debug, Default)]
pub struct AudioContextOptions {
    /// Identify the type of playback, which affects tradeoffs between audio output latency and
    /// power consumption.
    pub latency_hint: AudioContextLatencyCategory,

    /// Sample rate of the audio context and audio output hardware. Use `None` for a default value.
    pub sample_rate: Option<f32>,

    /// The audio output device
    /// - use `""` for the default audio output device
    /// - use `"none"` to process the audio graph without playing through an audio output device.
    pub sink_id: String,
}

/// Pending transition of the context lifecycle
///
/// Returned by [`AudioContext::suspend`], [`AudioContext::resume`] and [`AudioContext::close`].
/// The transition is applied by the render thread at its next render call.
#[derive(Debug, Clone)]
pub struct StateChangeCompletion {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

/// Render-side half of a [`StateChangeCompletion`]
///
/// Completes when sent, or when dropped without sending (e.g. the render thread is gone).
#[derive(Debug)]
pub(crate) struct CompletionNotifier {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StateChangeCompletion {
    pub(crate) fn new() -> (Self, CompletionNotifier) {
        let inner = Arc::new((Mutex::new(false), Condvar::new()));
        let notifier = CompletionNotifier {
            inner: Arc::clone(&inner),
        };
        (Self { inner }, notifier)
    }

    /// A transition that needs no render thread round trip
    pub(crate) fn completed() -> Self {
        let (completion, notifier) = Self::new();
        notifier.send();
        completion
    }

    /// Block until the transition took place
    pub fn wait(&self) {
        let (done, cond) = &*self.inner;
        let mut done = done.lock();
        while !*done {
            cond.wait(&mut done);
        }
    }

    /// Block until the transition took place or the timeout elapsed, returns completion
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (done, cond) = &*self.inner;
        let mut done = done.lock();
        if !*done {
            cond.wait_for(&mut done, timeout);
        }
        *done
    }

    pub fn is_complete(&self) -> bool {
        *self.inner.0.lock()
    }
}

impl CompletionNotifier {
    pub fn send(self) {
        // completion happens in Drop
    }

    fn complete(&self) {
        let (done, cond) = &*self.inner;
        *done.lock() = true;
        cond.notify_all();
    }
}

impl Drop for CompletionNotifier {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Target selection of a disconnect call
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum DisconnectTarget {
    /// Every connection of the selected outputs
    Any,
    /// Every input of the given node
    Node(AudioNodeId),
    NodeInput(AudioNodeId, usize),
    Param(AudioNodeId, usize),
}

/// Handle of the [`AudioNode`](crate::node::AudioNode) to its associated [`BaseAudioContext`].
///
/// This allows for communication with the render thread and lifetime management. Dropping it
/// releases the script reference of the node: the node is freed once no connection or playback
/// keeps it alive anymore.
///
/// The only way to construct this object is by calling [`ConcreteBaseAudioContext::register`]
pub struct AudioContextRegistration {
    /// the audio context in which nodes and connections live
    context: ConcreteBaseAudioContext,
    /// identify a specific `AudioNode`
    id: AudioNodeId,
    /// render-side params created during construction, shipped with the node
    params: Mutex<Vec<AudioParamProcessor>>,
}

impl std::fmt::Debug for AudioContextRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioContextRegistration")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl AudioContextRegistration {
    pub(crate) fn new(context: ConcreteBaseAudioContext, id: AudioNodeId) -> Self {
        Self {
            context,
            id,
            params: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub(crate) fn id(&self) -> AudioNodeId {
        self.id
    }

    #[must_use]
    pub(crate) fn context(&self) -> &ConcreteBaseAudioContext {
        &self.context
    }

    /// Create an [`AudioParam`] owned by this node
    ///
    /// Only valid while the node is being constructed in [`ConcreteBaseAudioContext::register`].
    /// Returns the param and the id to look up its values in the `AudioProcessor`.
    pub fn create_audio_param(&self, descriptor: AudioParamDescriptor) -> (AudioParam, AudioParamId) {
        let mut params = self.params.lock();
        let index = params.len();
        let (param, processor) =
            audio_param_pair(descriptor, self.context.clone(), self.id, AudioParamId(index));
        params.push(processor);
        (param, AudioParamId(index))
    }

    pub(crate) fn take_params(&self) -> Vec<AudioParamProcessor> {
        std::mem::take(&mut *self.params.lock())
    }
}

impl Drop for AudioContextRegistration {
    fn drop(&mut self) {
        // the destination lives as long as the context
        if self.id != DESTINATION_NODE_ID {
            self.context
                .submit(GraphMutation::ReleaseScriptRef { id: self.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::AudioNode;

    use float_eq::assert_float_eq;

    fn require_send_sync_static<T: Send + Sync + 'static>(_: T) {}

    #[test]
    fn test_audio_context_registration_traits() {
        let context = OfflineAudioContext::new(1, 128, 44100.).unwrap();
        let gain = context.create_gain().unwrap();

        // we want to be able to ship AudioNodes to another thread, so the Registration should be
        // Send Sync and 'static
        require_send_sync_static(gain);
    }

    #[test]
    fn test_sample_rate_length() {
        let context = OfflineAudioContext::new(1, 48000, 96000.).unwrap();
        assert_float_eq!(context.sample_rate(), 96000., abs_all <= 0.);
        assert_eq!(context.length(), 48000);
    }

    #[test]
    fn test_state_as_str() {
        assert_eq!(AudioContextState::Suspended.as_str(), "suspended");
        assert_eq!(AudioContextState::Running.as_str(), "running");
        assert_eq!(AudioContextState::Closed.as_str(), "closed");
        assert_eq!(
            AudioContextState::from(AudioContextState::Running as u8),
            AudioContextState::Running
        );
    }

    #[test]
    fn test_completion() {
        let (completion, notifier) = StateChangeCompletion::new();
        assert!(!completion.wait_timeout(Duration::from_millis(1)));

        let handle = std::thread::spawn(move || notifier.send());
        completion.wait();
        assert!(completion.is_complete());
        handle.join().unwrap();

        // a dropped notifier completes too
        let (completion, notifier) = StateChangeCompletion::new();
        drop(notifier);
        assert!(completion.is_complete());
    }

    #[test]
    fn test_registration() {
        let context = OfflineAudioContext::new(1, 48000, 96000.).unwrap();
        let dest = context.destination();
        assert!(dest.context() == context.base());
    }
}
