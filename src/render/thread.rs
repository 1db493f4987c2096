//! Communicates with the control thread and ships audio samples to the hardware

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use super::scheduler::GraphScheduler;
use super::{AudioRenderQuantum, RenderScope};
use crate::buffer::AudioBuffer;
use crate::context::{AudioContextState, CompletionNotifier};
use crate::events::{EventDispatch, Garbage};
use crate::io::RenderThreadInit;
use crate::node::ChannelInterpretation;
use crate::RENDER_QUANTUM_SIZE;

/// Lifecycle transition requested by the control thread
#[derive(Debug)]
pub(crate) enum LifecycleRequest {
    Suspend(CompletionNotifier),
    Resume(CompletionNotifier),
    Close(CompletionNotifier),
}

/// Operations running off the system-level audio callback
pub(crate) struct RenderThread {
    scheduler: Arc<GraphScheduler>,
    sample_rate: f32,
    /// number of channels of the backend stream
    number_of_channels: usize,
    started: bool,
    suspended: bool,
    state: Arc<AtomicU8>,
    frames_played: Arc<AtomicU64>,
    lifecycle_recv: Receiver<LifecycleRequest>,
    buffer_offset: Option<(usize, AudioRenderQuantum)>,
    event_sender: Sender<EventDispatch>,
    garbage_sender: Sender<Garbage>,
}

impl std::fmt::Debug for RenderThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderThread")
            .field("sample_rate", &self.sample_rate)
            .field("frames_played", &self.frames_played.load(Ordering::Relaxed))
            .field("number_of_channels", &self.number_of_channels)
            .field("suspended", &self.suspended)
            .finish_non_exhaustive()
    }
}

impl RenderThread {
    pub fn new(sample_rate: f32, number_of_channels: usize, init: RenderThreadInit) -> Self {
        let RenderThreadInit {
            scheduler,
            state,
            frames_played,
            lifecycle_recv,
            event_send,
            garbage_send,
        } = init;

        Self {
            scheduler,
            sample_rate,
            number_of_channels,
            started: false,
            suspended: false,
            state,
            frames_played,
            lifecycle_recv,
            buffer_offset: None,
            event_sender: event_send,
            garbage_sender: garbage_send,
        }
    }

    fn handle_lifecycle_requests(&mut self) {
        while let Ok(request) = self.lifecycle_recv.try_recv() {
            // closed is terminal
            if self.state() == AudioContextState::Closed {
                continue;
            }
            match request {
                LifecycleRequest::Suspend(notify) => {
                    self.suspended = true;
                    self.set_state(AudioContextState::Suspended);
                    notify.send();
                }
                LifecycleRequest::Resume(notify) => {
                    self.suspended = false;
                    self.set_state(AudioContextState::Running);
                    notify.send();
                }
                LifecycleRequest::Close(notify) => {
                    self.suspended = true;
                    self.set_state(AudioContextState::Closed);
                    notify.send();
                }
            }
        }
    }

    /// Render a single quantum of the graph
    ///
    /// Never blocks: when the control thread holds the graph lock the quantum is silent, but the
    /// clock still advances.
    fn render_quantum(&mut self) -> AudioRenderQuantum {
        let current_frame = self
            .frames_played
            .fetch_add(RENDER_QUANTUM_SIZE as u64, Ordering::SeqCst);
        let scope = RenderScope::new(current_frame, self.sample_rate)
            .with_event_sender(self.event_sender.clone());

        let (rendered, garbage) = match self.scheduler.try_lock() {
            Some(mut graph) => {
                let rendered = graph.render(&scope);
                let garbage = graph
                    .has_pending_deletion()
                    .then(|| graph.take_pending_deletion());
                (rendered, garbage)
            }
            None => (AudioRenderQuantum::silence(self.number_of_channels), None),
        };

        // the graph lock is released before anything leaves this thread
        if let Some(garbage) = garbage {
            if let Err(e) = self.garbage_sender.send(garbage) {
                log::warn!("Control side is gone, freeing {} nodes on the render thread", e.0.len());
            }
        }

        rendered
    }

    // Render method of the `OfflineAudioContext`
    //
    // Not bound to a real-time deadline, so the graph lock is awaited instead of skipped.
    pub fn render_audiobuffer(self, length: usize) -> AudioBuffer {
        let sample_rate = self.sample_rate;
        self.set_state(AudioContextState::Running);

        // construct a properly sized output buffer
        let mut buffer = Vec::with_capacity(self.number_of_channels);
        buffer.resize_with(buffer.capacity(), || Vec::with_capacity(length));

        let num_frames = (length + RENDER_QUANTUM_SIZE - 1) / RENDER_QUANTUM_SIZE;

        for _ in 0..num_frames {
            let current_frame = self
                .frames_played
                .fetch_add(RENDER_QUANTUM_SIZE as u64, Ordering::SeqCst);
            let scope = RenderScope::new(current_frame, sample_rate)
                .with_event_sender(self.event_sender.clone());

            let (rendered, garbage) = {
                let mut graph = self.scheduler.lock();
                let rendered = graph.render(&scope);
                (rendered, graph.take_pending_deletion())
            };
            if !garbage.is_empty() {
                if let Err(e) = self.garbage_sender.send(garbage) {
                    log::warn!("Control side is gone, freeing {} nodes on the render thread", e.0.len());
                }
            }

            let remaining = (length - buffer[0].len()).min(RENDER_QUANTUM_SIZE);
            let channels = rendered.channels();
            buffer.iter_mut().enumerate().for_each(|(i, b)| {
                let c = channels
                    .get(i)
                    .map(AsRef::as_ref)
                    // When there are no input nodes for the destination, only a single silent channel
                    // is emitted. So manually pad the missing channels with silence
                    .unwrap_or(&[0.; RENDER_QUANTUM_SIZE]);
                b.extend_from_slice(&c[..remaining]);
            });
        }

        self.set_state(AudioContextState::Closed);
        log::debug!("Offline rendering of {} frames done", length);

        AudioBuffer::from(buffer, sample_rate)
    }

    /// Fill an interleaved output buffer of any length
    pub fn render(&mut self, mut output_buffer: &mut [f32]) {
        self.handle_lifecycle_requests();

        if !self.started {
            self.started = true;
            if !self.suspended {
                self.set_state(AudioContextState::Running);
            }
        }

        // suspended or closed: time stands still
        if self.suspended {
            self.buffer_offset = None;
            output_buffer.fill(0.);
            return;
        }

        // There may be audio frames left over from the previous render call,
        // if the backend buffer size did not align with our internal RENDER_QUANTUM_SIZE
        if let Some((offset, prev_rendered)) = self.buffer_offset.take() {
            let leftover_len = (RENDER_QUANTUM_SIZE - offset) * self.number_of_channels;
            // split the leftover frames slice, to fit in `buffer`
            let (first, next) = output_buffer.split_at_mut(leftover_len.min(output_buffer.len()));

            // copy rendered audio into output slice
            for i in 0..self.number_of_channels {
                let output = first.iter_mut().skip(i).step_by(self.number_of_channels);
                let channel = prev_rendered.channel_data(i)[offset..].iter();
                for (sample, input) in output.zip(channel) {
                    *sample = *input;
                }
            }

            // exit early if we are done filling the buffer with the previously rendered data
            if next.is_empty() {
                let consumed = offset + first.len() / self.number_of_channels;
                if consumed < RENDER_QUANTUM_SIZE {
                    self.buffer_offset = Some((consumed, prev_rendered));
                }
                return;
            }

            // if there's still space left in the buffer, continue rendering
            output_buffer = next;
        }

        // The audio graph is rendered in chunks of RENDER_QUANTUM_SIZE frames. But some audio
        // backends may not be able to emit chunks of this size.
        let chunk_size = RENDER_QUANTUM_SIZE * self.number_of_channels;

        for data in output_buffer.chunks_mut(chunk_size) {
            let mut destination_buffer = self.render_quantum();

            // the destination may carry fewer channels than the backend stream
            if destination_buffer.number_of_channels() != self.number_of_channels {
                destination_buffer.mix(self.number_of_channels, ChannelInterpretation::Discrete);
            }

            // copy rendered audio into output slice
            for i in 0..self.number_of_channels {
                let output = data.iter_mut().skip(i).step_by(self.number_of_channels);
                let channel = destination_buffer.channel_data(i).iter();
                for (sample, input) in output.zip(channel) {
                    *sample = *input;
                }
            }

            if data.len() != chunk_size {
                // this is the last chunk, and it contained less than RENDER_QUANTUM_SIZE samples
                let channel_offset = data.len() / self.number_of_channels;
                debug_assert!(channel_offset < RENDER_QUANTUM_SIZE);
                self.buffer_offset = Some((channel_offset, destination_buffer));
            }
        }
    }

    fn state(&self) -> AudioContextState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set_state(&self, state: AudioContextState) {
        self.state.store(state as u8, Ordering::SeqCst);
        if self
            .event_sender
            .try_send(EventDispatch::state_change())
            .is_err()
        {
            log::warn!("Event channel full, state change to {} dropped", state.as_str());
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        log::info!("Audio render thread has been dropped");
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;
    use crate::context::{AudioNodeId, StateChangeCompletion, DESTINATION_NODE_ID};
    use crate::io::{thread_init, ControlThreadInit};
    use crate::node::{ChannelConfigInner, ChannelCountMode};
    use crate::render::graph::{Graph, GraphMutation, Node};
    use crate::render::ports::{InputAddr, OutputAddr};
    use crate::render::{AudioParamValues, AudioProcessor};

    /// Outputs the frame index of each sample
    struct Ramp;

    impl AudioProcessor for Ramp {
        fn process(
            &mut self,
            _inputs: &[AudioRenderQuantum],
            outputs: &mut [AudioRenderQuantum],
            _params: AudioParamValues<'_>,
            scope: &RenderScope,
        ) -> bool {
            let output = outputs[0].channel_data_mut(0);
            output
                .iter_mut()
                .enumerate()
                .for_each(|(i, s)| *s = (scope.current_frame as usize + i) as f32);
            true
        }
    }

    struct PassThrough;

    impl AudioProcessor for PassThrough {
        fn process(
            &mut self,
            inputs: &[AudioRenderQuantum],
            outputs: &mut [AudioRenderQuantum],
            _params: AudioParamValues<'_>,
            _scope: &RenderScope,
        ) -> bool {
            outputs[0] = inputs[0].clone();
            false
        }

        fn follows_input_channel_count(&self) -> bool {
            true
        }
    }

    fn setup(channels: usize) -> (RenderThread, ControlThreadInit) {
        let scheduler = Arc::new(GraphScheduler::new(Graph::new()));
        let config = |count| ChannelConfigInner {
            count,
            count_mode: ChannelCountMode::Explicit,
            interpretation: ChannelInterpretation::Discrete,
        };
        scheduler.submit(GraphMutation::AddNode {
            id: DESTINATION_NODE_ID,
            node: Box::new(Node::new(Box::new(PassThrough), 1, 1, config(channels), vec![])),
        });
        scheduler.submit(GraphMutation::AddNode {
            id: AudioNodeId(1),
            node: Box::new(Node::new(Box::new(Ramp), 0, 1, config(1), vec![])),
        });
        scheduler.submit(GraphMutation::Connect {
            from: OutputAddr {
                node: AudioNodeId(1),
                output: 0,
            },
            to: InputAddr::Node {
                node: DESTINATION_NODE_ID,
                input: 0,
            },
        });

        let (control, render) = thread_init(scheduler);
        (RenderThread::new(48000., channels, render), control)
    }

    #[test]
    fn test_render_unaligned_buffers() {
        let (mut render_thread, control) = setup(1);

        let mut rendered = vec![];
        for size in [100, 200, 28, 300, 1] {
            let mut buffer = vec![-1.; size];
            render_thread.render(&mut buffer);
            rendered.extend(buffer);
        }

        // contiguous frames, no leftover lost or duplicated
        for (i, v) in rendered.iter().enumerate() {
            assert_float_eq!(*v, i as f32, abs <= 0.);
        }
        // 629 frames need five quanta
        assert_eq!(control.frames_played.load(Ordering::SeqCst), 640);
    }

    #[test]
    fn test_render_interleaved() {
        let (mut render_thread, _control) = setup(2);
        let mut buffer = vec![0.; 256];
        render_thread.render(&mut buffer);

        // mono source, discrete up-mix into the first channel
        assert_float_eq!(buffer[0], 0., abs <= 0.);
        assert_float_eq!(buffer[1], 0., abs <= 0.);
        assert_float_eq!(buffer[2], 1., abs <= 0.);
        assert_float_eq!(buffer[3], 0., abs <= 0.);
    }

    #[test]
    fn test_contended_lock_renders_silence() {
        let (mut render_thread, control) = setup(1);
        let scheduler = Arc::clone(&render_thread.scheduler);

        let guard = scheduler.lock();
        let mut buffer = vec![1.; 128];
        render_thread.render(&mut buffer);
        assert!(buffer.iter().all(|v| *v == 0.));
        drop(guard);

        // time advanced during the silent quantum
        render_thread.render(&mut buffer);
        assert_float_eq!(buffer[0], 128., abs <= 0.);
        assert_eq!(control.frames_played.load(Ordering::SeqCst), 256);
    }

    #[test]
    fn test_lifecycle_requests() {
        let (mut render_thread, control) = setup(1);
        let state = || AudioContextState::from(control.state.load(Ordering::SeqCst));
        let mut buffer = vec![0.; 128];

        render_thread.render(&mut buffer);
        assert_eq!(state(), AudioContextState::Running);

        let (completion, notify) = StateChangeCompletion::new();
        control
            .lifecycle_send
            .send(LifecycleRequest::Suspend(notify))
            .unwrap();
        assert!(!completion.is_complete());
        render_thread.render(&mut buffer);
        assert!(completion.is_complete());
        assert_eq!(state(), AudioContextState::Suspended);
        // no time passes while suspended
        assert_eq!(control.frames_played.load(Ordering::SeqCst), 128);

        let (completion, notify) = StateChangeCompletion::new();
        control
            .lifecycle_send
            .send(LifecycleRequest::Close(notify))
            .unwrap();
        render_thread.render(&mut buffer);
        completion.wait();
        assert_eq!(state(), AudioContextState::Closed);

        // terminal
        let (_completion, notify) = StateChangeCompletion::new();
        control
            .lifecycle_send
            .send(LifecycleRequest::Resume(notify))
            .unwrap();
        render_thread.render(&mut buffer);
        assert_eq!(state(), AudioContextState::Closed);
    }

    #[test]
    fn test_render_audiobuffer_length() {
        let (render_thread, _control) = setup(2);
        let buffer = render_thread.render_audiobuffer(300);

        assert_eq!(buffer.length(), 300);
        assert_eq!(buffer.number_of_channels(), 2);
        assert_float_eq!(buffer.get_channel_data(0)[299], 299., abs <= 0.);
        assert!(buffer.get_channel_data(1).iter().all(|v| *v == 0.));
    }

    #[test]
    fn test_render_audiobuffer_without_control_side() {
        let (render_thread, control) = setup(1);
        let scheduler = Arc::clone(&render_thread.scheduler);
        drop(control);

        // the released source becomes garbage nobody receives
        scheduler.submit(GraphMutation::ReleaseScriptRef { id: AudioNodeId(1) });
        let buffer = render_thread.render_audiobuffer(512);

        assert_eq!(buffer.length(), 512);
        assert_eq!(scheduler.lock().node_count(), 1);
        assert!(buffer.get_channel_data(0)[384..].iter().all(|v| *v == 0.));
    }
}
