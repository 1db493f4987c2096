use crate::context::{AudioContextRegistration, AudioParamId, BaseAudioContext};
use crate::param::{AudioParam, AudioParamDescriptor, AutomationRate};
use crate::render::{AudioParamValues, AudioProcessor, AudioRenderQuantum, RenderScope};
use crate::Error;

use super::{
    AudioNode, AudioScheduledSourceNode, ChannelConfig, Playback, PlaybackState, Scheduler,
};

/// Options for constructing an [`ConstantSourceNode`]
#[derive(Clone, Debug)]
pub struct ConstantSourceOptions {
    pub offset: f32,
}

impl Default for ConstantSourceOptions {
    fn default() -> Self {
        Self { offset: 1. }
    }
}

/// Audio source whose output is nominally a constant value. A `ConstantSourceNode`
/// can be used as a constructible `AudioParam` by automating the value of its offset.
///
/// # Usage
///
/// ```
/// use web_audio_graph::context::{BaseAudioContext, OfflineAudioContext};
/// use web_audio_graph::node::{AudioNode, AudioScheduledSourceNode};
///
/// let context = OfflineAudioContext::new(1, 128, 48000.).unwrap();
///
/// let gain1 = context.create_gain().unwrap();
/// gain1.gain().set_value(0.);
/// let gain2 = context.create_gain().unwrap();
/// gain2.gain().set_value(0.);
///
/// // control both `GainNode`s with 1 automation
/// let automation = context.create_constant_source().unwrap();
/// automation.offset().set_value(0.);
/// automation.connect_param(gain1.gain()).unwrap();
/// automation.connect_param(gain2.gain()).unwrap();
/// automation.offset().set_target_at_time(1., 0., 0.1).unwrap();
/// automation.start().unwrap();
/// ```
#[derive(Debug)]
pub struct ConstantSourceNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    offset: AudioParam,
    scheduler: Scheduler,
}

impl AudioNode for ConstantSourceNode {
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

impl AudioScheduledSourceNode for ConstantSourceNode {
    fn start_at(&self, when: f64) -> Result<(), Error> {
        self.scheduler.start_at(when, &self.registration)
    }

    fn stop_at(&self, when: f64) -> Result<(), Error> {
        self.scheduler.stop_at(when)
    }

    fn playback_state(&self) -> PlaybackState {
        self.scheduler.state()
    }
}

impl ConstantSourceNode {
    pub fn new<C: BaseAudioContext>(
        context: &C,
        options: ConstantSourceOptions,
    ) -> Result<Self, Error> {
        context.base().register(move |registration| {
            let param_opts = AudioParamDescriptor {
                min_value: f32::MIN,
                max_value: f32::MAX,
                default_value: 1.,
                automation_rate: AutomationRate::A,
            };
            let (param, proc) = registration.create_audio_param(param_opts);
            param.set_value(options.offset);

            let scheduler = Scheduler::new();

            let render = ConstantSourceRenderer {
                offset: proc,
                scheduler: scheduler.clone(),
            };

            let node = ConstantSourceNode {
                registration,
                channel_config: ChannelConfig::default(),
                offset: param,
                scheduler,
            };

            Ok((node, Box::new(render) as Box<dyn AudioProcessor>))
        })
    }

    pub fn offset(&self) -> &AudioParam {
        &self.offset
    }
}

struct ConstantSourceRenderer {
    offset: AudioParamId,
    scheduler: Scheduler,
}

impl AudioProcessor for ConstantSourceRenderer {
    fn process(
        &mut self,
        _inputs: &[AudioRenderQuantum],
        outputs: &mut [AudioRenderQuantum],
        params: AudioParamValues<'_>,
        scope: &RenderScope,
    ) -> bool {
        // single output node, always mono
        let output = &mut outputs[0];
        output.set_number_of_channels(1);

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

        if begin == end {
            output.make_silent();
        } else {
            let offset_values = params.get(&self.offset);
            let output_channel = output.channel_data_mut(0);

            output_channel[..begin].fill(0.);
            if let [value] = offset_values {
                output_channel[begin..end].fill(*value);
            } else {
                // a-rate values are already computed at sub-sample accuracy
                output_channel[begin..end].copy_from_slice(&offset_values[begin..end]);
            }
            output_channel[end..].fill(0.);
        }

        if last {
            self.scheduler.finish(scope);
            return false;
        }
        true
    }
}
