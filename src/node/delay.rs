use crate::context::{AudioContextRegistration, AudioParamId, BaseAudioContext};
use crate::param::{AudioParam, AudioParamDescriptor, AutomationRate};
use crate::render::{AudioParamValues, AudioProcessor, AudioRenderQuantum, RenderScope};
use crate::{Error, RENDER_QUANTUM_SIZE};

use super::{AudioNode, AudioNodeOptions, ChannelConfig};

/// Upper bound of `max_delay_time`, in seconds
const MAX_DELAY_TIME: f64 = 180.;

/// Options for constructing a [`DelayNode`]
#[derive(Clone, Debug)]
pub struct DelayOptions {
    pub max_delay_time: f64,
    pub delay_time: f64,
    pub audio_node_options: AudioNodeOptions,
}

impl Default for DelayOptions {
    fn default() -> Self {
        Self {
            max_delay_time: 1.,
            delay_time: 0.,
            audio_node_options: AudioNodeOptions::default(),
        }
    }
}

/// Node that delays the incoming audio signal by a certain amount
///
/// The delay line keeps ringing for `max_delay_time` after its input went silent or was
/// disconnected, the node is not released before that.
#[derive(Debug)]
pub struct DelayNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    delay_time: AudioParam,
}

impl AudioNode for DelayNode {
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
}

impl DelayNode {
    /// # Errors
    ///
    /// - `NotSupported` when `max_delay_time` is not in the `(0, 180)` range
    /// - `InvalidArgument` when `delay_time` is negative
    /// - `ResourceExhausted` when the delay line cannot be allocated
    pub fn new<C: BaseAudioContext>(context: &C, options: DelayOptions) -> Result<Self, Error> {
        let DelayOptions {
            max_delay_time,
            delay_time,
            audio_node_options,
        } = options;

        if !(max_delay_time > 0. && max_delay_time < MAX_DELAY_TIME) {
            return Err(Error::NotSupported(format!(
                "max delay time ({}) should be in the range (0, {})",
                max_delay_time, MAX_DELAY_TIME
            )));
        }
        crate::validate_time_value(delay_time, "delay time")?;
        let channel_config = ChannelConfig::try_from(audio_node_options)?;

        let sample_rate = f64::from(context.sample_rate());
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let max_frames = (max_delay_time * sample_rate).ceil() as usize;
        // one extra quantum for the interpolation of the oldest sample
        let ring_size = max_frames / RENDER_QUANTUM_SIZE + 2;

        let mut ring = Vec::new();
        ring.try_reserve_exact(ring_size).map_err(|e| {
            Error::ResourceExhausted(format!("cannot allocate delay line: {}", e))
        })?;
        ring.resize(ring_size, AudioRenderQuantum::silence(1));

        context.base().register(move |registration| {
            let param_opts = AudioParamDescriptor {
                min_value: 0.,
                max_value: max_delay_time as f32,
                default_value: 0.,
                automation_rate: AutomationRate::A,
            };
            let (param, proc) = registration.create_audio_param(param_opts);
            param.set_value(delay_time as f32);

            let render = DelayRenderer {
                delay_time: proc,
                max_delay_time,
                ring,
                write_index: 0,
                next_frame: 0,
            };

            let node = DelayNode {
                registration,
                channel_config,
                delay_time: param,
            };

            Ok((node, Box::new(render) as Box<dyn AudioProcessor>))
        })
    }

    pub fn delay_time(&self) -> &AudioParam {
        &self.delay_time
    }
}

struct DelayRenderer {
    delay_time: AudioParamId,
    max_delay_time: f64,
    /// past input quanta, `write_index` holds the current one
    ring: Vec<AudioRenderQuantum>,
    write_index: usize,
    /// first frame of the quantum expected next, a gap means skipped silent quanta
    next_frame: u64,
}

impl DelayRenderer {
    /// Sample of `channel` at `frame` frames relative to the current quantum start
    fn read(&self, channel: usize, frame: i64) -> f32 {
        let len = self.ring.len() as i64;
        let quantum = frame.div_euclid(RENDER_QUANTUM_SIZE as i64);
        if quantum > 0 || quantum <= -len {
            return 0.;
        }
        let index = (self.write_index as i64 + quantum).rem_euclid(len) as usize;
        let block = &self.ring[index];
        if channel >= block.number_of_channels() {
            return 0.;
        }
        block.channel_data(channel)[frame.rem_euclid(RENDER_QUANTUM_SIZE as i64) as usize]
    }
}

impl AudioProcessor for DelayRenderer {
    fn process(
        &mut self,
        inputs: &[AudioRenderQuantum],
        outputs: &mut [AudioRenderQuantum],
        params: AudioParamValues<'_>,
        scope: &RenderScope,
    ) -> bool {
        // single input/output node
        let input = &inputs[0];
        let output = &mut outputs[0];

        if scope.current_frame != self.next_frame {
            // silent quanta were skipped, the delay line has run empty meanwhile
            self.ring
                .iter_mut()
                .for_each(|q| *q = AudioRenderQuantum::silence(1));
        }
        self.next_frame = scope.current_frame + RENDER_QUANTUM_SIZE as u64;

        self.write_index = (self.write_index + 1) % self.ring.len();
        self.ring[self.write_index] = input.clone();

        if self.ring.iter().all(AudioRenderQuantum::is_silent) {
            output.make_silent();
            return false;
        }

        let delay = params.get(&self.delay_time);
        let sample_rate = f64::from(scope.sample_rate);

        let channels = output.number_of_channels();
        for c in 0..channels {
            let mut samples = [0.; RENDER_QUANTUM_SIZE];
            for (i, s) in samples.iter_mut().enumerate() {
                let d = f64::from(if delay.len() == 1 { delay[0] } else { delay[i] });
                let frames = snap_frames(d.clamp(0., self.max_delay_time) * sample_rate);
                let position = i as f64 - frames;
                let floor = position.floor();
                let frac = (position - floor) as f32;

                let a = self.read(c, floor as i64);
                *s = if frac == 0. {
                    a
                } else {
                    let b = self.read(c, floor as i64 + 1);
                    a + (b - a) * frac
                };
            }
            output.channel_data_mut(c).copy_from_slice(&samples);
        }

        true
    }

    fn tail_time(&self) -> f64 {
        self.max_delay_time
    }

    fn follows_input_channel_count(&self) -> bool {
        true
    }
}

/// Round a delay to a whole frame when it is one up to the precision of an `f32` delay time
fn snap_frames(frames: f64) -> f64 {
    let nearest = frames.round();
    let tolerance = (frames * f64::from(f32::EPSILON)).max(1e-6);
    if (frames - nearest).abs() <= tolerance {
        nearest
    } else {
        frames
    }
}
