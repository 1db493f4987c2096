use crate::context::{AudioContextRegistration, AudioParamId, BaseAudioContext};
use crate::param::{AudioParam, AudioParamDescriptor, AutomationRate};
use crate::render::{AudioParamValues, AudioProcessor, AudioRenderQuantum, RenderScope};
use crate::Error;

use super::{AudioNode, AudioNodeOptions, ChannelConfig};

/// Options for constructing a [`GainNode`]
#[derive(Clone, Debug)]
pub struct GainOptions {
    pub gain: f32,
    pub audio_node_options: AudioNodeOptions,
}

impl Default for GainOptions {
    fn default() -> Self {
        Self {
            gain: 1.,
            audio_node_options: AudioNodeOptions::default(),
        }
    }
}

/// AudioNode for volume control
///
/// The output carries as many channels as the computed input channel count.
#[derive(Debug)]
pub struct GainNode {
    registration: AudioContextRegistration,
    channel_config: ChannelConfig,
    gain: AudioParam,
}

impl AudioNode for GainNode {
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

impl GainNode {
    pub fn new<C: BaseAudioContext>(context: &C, options: GainOptions) -> Result<Self, Error> {
        let channel_config = ChannelConfig::try_from(options.audio_node_options)?;

        context.base().register(move |registration| {
            let param_opts = AudioParamDescriptor {
                min_value: f32::MIN,
                max_value: f32::MAX,
                default_value: 1.,
                automation_rate: AutomationRate::A,
            };
            let (param, proc) = registration.create_audio_param(param_opts);
            param.set_value(options.gain);

            let render = GainRenderer { gain: proc };

            let node = GainNode {
                registration,
                channel_config,
                gain: param,
            };

            Ok((node, Box::new(render) as Box<dyn AudioProcessor>))
        })
    }

    pub fn gain(&self) -> &AudioParam {
        &self.gain
    }
}

struct GainRenderer {
    gain: AudioParamId,
}

impl AudioProcessor for GainRenderer {
    fn process(
        &mut self,
        inputs: &[AudioRenderQuantum],
        outputs: &mut [AudioRenderQuantum],
        params: AudioParamValues<'_>,
        _scope: &RenderScope,
    ) -> bool {
        // single input/output node
        let input = &inputs[0];
        let output = &mut outputs[0];

        if input.is_silent() {
            output.make_silent();
            return false;
        }

        let gain = params.get(&self.gain);

        // fast track for mute or pass-through
        if let [g] = gain {
            // 1e-6 is -120 dB when close to 0
            let threshold = 1e-6;

            if g.abs() <= threshold {
                output.make_silent();
                return false;
            }
            if (1. - g).abs() <= threshold {
                *output = input.clone();
                return false;
            }
        }

        *output = input.clone();

        if let [g] = gain {
            output.channels_mut().iter_mut().for_each(|channel| {
                channel.iter_mut().for_each(|o| *o *= g);
            });
        } else {
            output.channels_mut().iter_mut().for_each(|channel| {
                channel
                    .iter_mut()
                    .zip(gain.iter())
                    .for_each(|(o, g)| *o *= g);
            });
        }

        false
    }

    fn follows_input_channel_count(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OfflineAudioContext;
    use crate::node::AudioScheduledSourceNode;
    use float_eq::assert_float_eq;

    #[test]
    fn test_audioparam_value_applies_immediately() {
        let context = OfflineAudioContext::new(1, 128, 48000.).unwrap();
        let options = GainOptions {
            gain: 0.12,
            ..Default::default()
        };
        let gain = GainNode::new(&context, options).unwrap();
        assert_float_eq!(gain.gain().value(), 0.12, abs <= 0.);
    }

    #[test]
    fn test_invalid_options() {
        let context = OfflineAudioContext::new(1, 128, 48000.).unwrap();
        let options = GainOptions {
            audio_node_options: AudioNodeOptions {
                channel_count: 0,
                ..AudioNodeOptions::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            GainNode::new(&context, options),
            Err(Error::InvalidArgument(_))
        ));
        // nothing was registered
        assert_eq!(context.base().node_count(), 1);
    }

    #[test]
    fn test_gain_ramp_is_sample_accurate() {
        let context = OfflineAudioContext::new(1, 128, 48000.).unwrap();
        let src = context.create_constant_source().unwrap();
        let gain = context.create_gain().unwrap();
        gain.gain().set_value_at_time(0., 0.).unwrap();
        gain.gain()
            .linear_ramp_to_value_at_time(1., 128. / 48000.)
            .unwrap();

        src.connect(&gain).unwrap();
        gain.connect(&context.destination()).unwrap();
        src.start().unwrap();

        let buffer = context.start_rendering_sync().unwrap();
        let channel = buffer.get_channel_data(0);
        let expected: Vec<f32> = (0..128).map(|i| i as f32 / 128.).collect();
        assert_float_eq!(channel[..], expected[..], abs_all <= 1e-6);
    }
}
