use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::AudioBuffer;
use crate::context::{AudioContextRegistration, AudioParamId, BaseAudioContext};
use crate::param::{AudioParam, AudioParamDescriptor, AutomationRate};
use crate::render::graph::GraphMutation;
use crate::render::{AudioParamValues, AudioProcessor, AudioRenderQuantum, RenderScope};
use crate::{validate_time_value, AtomicF64, Error, RENDER_QUANTUM_SIZE};

use super::{
    AudioNode, AudioNodeOptions, AudioScheduledSourceNode, ChannelConfig, Playback, PlaybackState,
    Scheduler,
};

/// Options for constructing an [`AudioBufferSourceNode`]
#[derive(Clone, Debug)]
pub struct AudioBufferSourceOptions {
    pub buffer: Option<AudioBuffer>,
    pub detune: f32,
    pub loop_: bool,
    pub loop_start: f64,
    pub loop_end: f64,
    pub playback_rate: f32,
    pub audio_node_options: AudioNodeOptions,
}

impl Default for AudioBufferSourceOptions {
    fn default() -> Self {
        Self {
            buffer: None,
            detune: 0.,
            loop_: false,
            loop_start: 0.,
            loop_end: 0.,
            playback_rate: 1.,
            audio_node_options: AudioNodeOptions::default(),
        }
    }
}

/// Playback settings shared with the renderer
#[derive(Debug)]
struct BufferSourceControls {
    /// buffer waiting to be picked up by the render thread
    buffer: Mutex<Option<AudioBuffer>>,
    loop_: AtomicBool,
    loop_start: AtomicF64,
    loop_end: AtomicF64,
    offset: AtomicF64,
    duration: AtomicF64,
}

/// Within this distance of a whole frame, a position counts as that frame
const FRAME_TOLERANCE: f64 = 1e-6;

fn snap(position: f64) -> f64 {
    let nearest = position.round();
    if (position - nearest).abs() < FRAME_TOLERANCE {
        nearest
    } else {
        position
    }
}

impl BufferSourceControls {
    /// Loop boundaries in buffer frames, `None` when not looping
    fn loop_range(&self, length: f64, buffer_rate: f64) -> Option<(f64, f64)> {
        if !self.loop_.load(Ordering::SeqCst) {
            return None;
        }

        let start = snap(self.loop_start.load() * buffer_rate);
        let end = snap(self.loop_end.load() * buffer_rate).min(length);
        if length <= 0. {
            None
        } else if start >= 0. && end > 0. && start < end {
            Some((start, end))
        } else {
            Some((0., length))
        }
    }
}

/// `AudioBufferSourceNode` represents an audio source that consists of an
/// in-memory audio source (i.e. an audio file completely loaded in memory),
/// stored in an [`AudioBuffer`].
///
/// The buffer may be given at construction or later on, but only once. The node output
/// carries as many channels as the buffer.
///
/// # Usage
///
/// ```no_run
/// use std::fs::File;
/// use web_audio_graph::context::{BaseAudioContext, AudioContext};
/// use web_audio_graph::node::{AudioNode, AudioScheduledSourceNode};
///
/// // create an `AudioContext`
/// let context = AudioContext::new(Default::default()).unwrap();
/// // load and decode a soundfile
/// let file = File::open("sample.wav").unwrap();
/// let audio_buffer = context.decode_audio_data_sync(file).unwrap();
/// // play the sound file
/// let src = context.create_buffer_source().unwrap();
/// src.set_buffer(audio_buffer).unwrap();
/// src.connect(&context.destination()).unwrap();
/// src.start().unwrap();
/// ```
#[derive(Debug)]
pub struct AudioBufferSourceNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    detune: AudioParam,        // k-rate
    playback_rate: AudioParam, // k-rate
    scheduler: Scheduler,
    controls: Arc<BufferSourceControls>,
    buffer: Mutex<Option<AudioBuffer>>,
}

impl AudioNode for AudioBufferSourceNode {
    fn registration(&self) -> &AudioContextRegistration {
        &self.registration
    }

    fn channel_config(&self) -> &ChannelConfig {
        &self.channel_config
    }

    fn number_of_inputs(&self) -> usize {
        0
    }

    fn number_of_outputs(&self) -> usize {
        1
    }
}

impl AudioScheduledSourceNode for AudioBufferSourceNode {
    fn start_at(&self, when: f64) -> Result<(), Error> {
        self.schedule(when, 0., f64::INFINITY)
    }

    fn stop_at(&self, when: f64) -> Result<(), Error> {
        self.scheduler.stop_at(when)
    }

    fn playback_state(&self) -> PlaybackState {
        self.scheduler.state()
    }
}

impl AudioBufferSourceNode {
    /// Create a new [`AudioBufferSourceNode`] instance
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for invalid channel options or negative loop points
    /// - `InvalidState` when the context is closed
    pub fn new<C: BaseAudioContext>(
        context: &C,
        options: AudioBufferSourceOptions,
    ) -> Result<Self, Error> {
        let AudioBufferSourceOptions {
            buffer,
            detune,
            loop_,
            loop_start,
            loop_end,
            playback_rate,
            audio_node_options,
        } = options;

        let channel_config = ChannelConfig::try_from(audio_node_options)?;
        validate_time_value(loop_start, "loop start")?;
        validate_time_value(loop_end, "loop end")?;

        let node = context.base().register(move |registration| {
            let detune_param_options = AudioParamDescriptor {
                min_value: f32::MIN,
                max_value: f32::MAX,
                default_value: 0.,
                automation_rate: AutomationRate::K,
            };
            let (d_param, d_proc) = registration.create_audio_param(detune_param_options);
            d_param.set_value(detune);

            let playback_rate_param_options = AudioParamDescriptor {
                min_value: f32::MIN,
                max_value: f32::MAX,
                default_value: 1.,
                automation_rate: AutomationRate::K,
            };
            let (pr_param, pr_proc) = registration.create_audio_param(playback_rate_param_options);
            pr_param.set_value(playback_rate);

            let controls = Arc::new(BufferSourceControls {
                buffer: Mutex::new(None),
                loop_: AtomicBool::new(loop_),
                loop_start: AtomicF64::new(loop_start),
                loop_end: AtomicF64::new(loop_end),
                offset: AtomicF64::new(0.),
                duration: AtomicF64::new(f64::INFINITY),
            });
            let scheduler = Scheduler::new();

            let renderer = AudioBufferSourceRenderer {
                scheduler: scheduler.clone(),
                controls: Arc::clone(&controls),
                detune: d_proc,
                playback_rate: pr_proc,
                buffer: None,
                position: None,
                remaining: f64::INFINITY,
            };

            let node = Self {
                registration,
                channel_config,
                detune: d_param,
                playback_rate: pr_param,
                scheduler,
                controls,
                buffer: Mutex::new(None),
            };

            Ok((node, Box::new(renderer) as Box<dyn AudioProcessor>))
        })?;

        if let Some(buffer) = buffer {
            node.set_buffer(buffer)?;
        }

        Ok(node)
    }

    /// Current buffer value (nullable)
    pub fn buffer(&self) -> Option<AudioBuffer> {
        self.buffer.lock().clone()
    }

    /// Provide an [`AudioBuffer`] as the source of data to be played back
    ///
    /// # Errors
    ///
    /// `InvalidState` if a buffer has already been given to the source (through `new` or
    /// through `set_buffer`)
    pub fn set_buffer(&self, audio_buffer: AudioBuffer) -> Result<(), Error> {
        let mut buffer = self.buffer.lock();
        if buffer.is_some() {
            return Err(Error::InvalidState("cannot assign buffer twice".into()));
        }

        let channels = audio_buffer.number_of_channels();
        *self.controls.buffer.lock() = Some(audio_buffer.clone());
        *buffer = Some(audio_buffer);

        self.registration.context().submit(GraphMutation::SetOutputChannels {
            id: self.registration.id(),
            output: 0,
            channels,
        });

        Ok(())
    }

    /// Start the playback at the given time and with a given offset
    ///
    /// # Errors
    ///
    /// See [`Self::start_at_with_offset_and_duration`]
    pub fn start_at_with_offset(&self, start: f64, offset: f64) -> Result<(), Error> {
        self.schedule(start, offset, f64::INFINITY)
    }

    /// Start the playback at the given time, with a given offset, for a given duration
    ///
    /// `offset` and `duration` are expressed in the time reference of the buffer.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for negative or non-finite values
    /// - `InvalidState` if the source was already started
    pub fn start_at_with_offset_and_duration(
        &self,
        start: f64,
        offset: f64,
        duration: f64,
    ) -> Result<(), Error> {
        validate_time_value(duration, "duration")?;
        self.schedule(start, offset, duration)
    }

    fn schedule(&self, start: f64, offset: f64, duration: f64) -> Result<(), Error> {
        validate_time_value(offset, "offset")?;
        if self.scheduler.state() != PlaybackState::Unscheduled {
            return Err(Error::InvalidState("cannot call `start` twice".into()));
        }

        self.controls.offset.store(offset);
        self.controls.duration.store(duration);
        self.scheduler.start_at(start, &self.registration)
    }

    /// [`AudioParam`] that defines the speed at which the [`AudioBuffer`] will
    /// be played, e.g.:
    /// - `0.5` will play the file at half speed
    /// - `-1` will play the file in reverse
    ///
    /// Note that playback rate will also alter the pitch of the [`AudioBuffer`]
    pub fn playback_rate(&self) -> &AudioParam {
        &self.playback_rate
    }

    /// [`AudioParam`] that defines a pitch transposition of the file, expressed in cents
    pub fn detune(&self) -> &AudioParam {
        &self.detune
    }

    /// Defines if the playback the [`AudioBuffer`] should be looped
    pub fn loop_(&self) -> bool {
        self.controls.loop_.load(Ordering::SeqCst)
    }

    pub fn set_loop(&self, value: bool) {
        self.controls.loop_.store(value, Ordering::SeqCst);
    }

    /// Defines the loop start point, in the time reference of the [`AudioBuffer`]
    pub fn loop_start(&self) -> f64 {
        self.controls.loop_start.load()
    }

    pub fn set_loop_start(&self, value: f64) {
        self.controls.loop_start.store(value);
    }

    /// Defines the loop end point, in the time reference of the [`AudioBuffer`]
    ///
    /// When the loop points do not delimit a non-empty range, the whole buffer is looped.
    pub fn loop_end(&self) -> f64 {
        self.controls.loop_end.load()
    }

    pub fn set_loop_end(&self, value: f64) {
        self.controls.loop_end.store(value);
    }
}

struct AudioBufferSourceRenderer {
    scheduler: Scheduler,
    controls: Arc<BufferSourceControls>,
    detune: AudioParamId,
    playback_rate: AudioParamId,
    buffer: Option<AudioBuffer>,
    /// virtual read index in buffer frames, set once playback started
    position: Option<f64>,
    /// buffer frames left before the requested duration is reached
    remaining: f64,
}

/// Linear interpolation of `channel` at `position`, wrapping into the loop when looping
fn sample_at(channel: &[f32], position: f64, loop_range: Option<(f64, f64)>) -> f32 {
    let floor = position.floor();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = floor as usize;
    let frac = (position - floor) as f32;

    let a = channel[index];
    if frac == 0. {
        return a;
    }

    let mut next = floor + 1.;
    if let Some((start, end)) = loop_range {
        if next >= end {
            next -= end - start;
        }
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let b = channel.get(next as usize).copied().unwrap_or(0.);

    a + (b - a) * frac
}

impl AudioProcessor for AudioBufferSourceRenderer {
    fn process(
        &mut self,
        _inputs: &[AudioRenderQuantum],
        outputs: &mut [AudioRenderQuantum],
        params: AudioParamValues<'_>,
        scope: &RenderScope,
    ) -> bool {
        // single output node
        let output = &mut outputs[0];

        let (begin, end, last) = match self.scheduler.playback(scope) {
            Playback::Pending => {
                output.make_silent();
                return true;
            }
            Playback::Ended => {
                output.make_silent();
                return false;
            }
            Playback::Active { begin, end, last } => (begin, end, last),
        };

        // pick up the buffer, retry next quantum under contention
        if self.buffer.is_none() {
            if let Some(mut slot) = self.controls.buffer.try_lock() {
                self.buffer = slot.take();
            }
        }
        let buffer = match &self.buffer {
            // an empty buffer has nothing to play, not even in a loop
            Some(buffer) if buffer.length() == 0 => {
                output.make_silent();
                self.scheduler.finish(scope);
                return false;
            }
            Some(buffer) => buffer,
            None => {
                output.make_silent();
                if last {
                    self.scheduler.finish(scope);
                    return false;
                }
                return true;
            }
        };

        let sample_rate = f64::from(scope.sample_rate);
        let buffer_rate = f64::from(buffer.sample_rate());
        let length = buffer.length() as f64;

        // k-rate params
        let playback_rate = f64::from(params.get(&self.playback_rate)[0]);
        let detune = f64::from(params.get(&self.detune)[0]);
        let step = playback_rate * (detune / 1200.).exp2() * buffer_rate / sample_rate;

        let loop_range = self.controls.loop_range(length, buffer_rate);

        let mut position = match self.position {
            Some(position) => position,
            None => {
                // the playhead runs from the start time, also while the buffer was missing
                let start = self.scheduler.start_time() * sample_rate;
                let elapsed = ((scope.current_frame + begin as u64) as f64 - start).max(0.);
                let elapsed = snap(elapsed);
                self.remaining =
                    snap(self.controls.duration.load() * buffer_rate - elapsed * step.abs());
                snap(self.controls.offset.load() * buffer_rate + elapsed * step)
            }
        };

        let integral = step == 1. && position.fract() == 0. && loop_range.is_none();
        let first = position;

        let mut positions = [0.; RENDER_QUANTUM_SIZE];
        let mut stop = end;
        let mut exhausted = false;
        for (i, p) in positions.iter_mut().enumerate().take(end).skip(begin) {
            if let Some((loop_start, loop_end)) = loop_range {
                let outside = if step >= 0. {
                    position >= loop_end
                } else {
                    position < loop_start
                };
                if outside {
                    position = loop_start + (position - loop_start).rem_euclid(loop_end - loop_start);
                }
            }
            let inside = position >= 0. && position < length;
            if !inside || self.remaining < FRAME_TOLERANCE {
                stop = i;
                exhausted = true;
                break;
            }

            *p = position;
            position += step;
            self.remaining -= step.abs();
        }
        self.position = Some(position);

        if begin == stop {
            output.make_silent();
        } else {
            output.set_number_of_channels(buffer.number_of_channels());

            for (c, data) in buffer.channels().iter().enumerate() {
                let out = output.channel_data_mut(c);
                out[..begin].fill(0.);
                if integral {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let first = first as usize;
                    out[begin..stop].copy_from_slice(&data[first..first + stop - begin]);
                } else {
                    out[begin..stop]
                        .iter_mut()
                        .zip(&positions[begin..stop])
                        .for_each(|(o, p)| *o = sample_at(data, *p, loop_range));
                }
                out[stop..].fill(0.);
            }
        }

        if exhausted || last {
            self.scheduler.finish(scope);
            return false;
        }

        true
    }
}
