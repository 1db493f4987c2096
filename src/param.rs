//! AudioParam interface
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{AudioNodeId, AudioParamId, ConcreteBaseAudioContext};
use crate::render::{AudioRenderQuantum, RenderScope};
use crate::{validate_time_value, AtomicF32, Error, RENDER_QUANTUM_SIZE};

mod timeline;
pub(crate) use timeline::{AudioParamTimeline, AutomationEvent};

/// Per-sample coefficient of the one-pole smoother applied to direct value changes
const DEZIPPER_COEFFICIENT: f32 = 0.005;

/// Distance to the target below which the smoothed value snaps to it
const DEZIPPER_SNAP_THRESHOLD: f32 = 1e-3;

/// Precision of value calculation per render quantum
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AutomationRate {
    /// Audio Rate - sampled for each sample-frame of the block
    A,
    /// Control Rate - sampled at the time of the very first sample-frame,
    /// then used for the entire block
    K,
}

/// Options for constructing an [`AudioParam`]
#[derive(Clone, Debug)]
pub struct AudioParamDescriptor {
    pub automation_rate: AutomationRate,
    pub default_value: f32,
    pub min_value: f32,
    pub max_value: f32,
}

/// State shared between the control handle and the render-side processor
#[derive(Debug)]
pub(crate) struct AudioParamShared {
    descriptor: AudioParamDescriptor,
    /// value set directly, applies when no automation event governs the param
    intrinsic_value: AtomicF32,
    /// first computed value of the last rendered quantum
    current_value: AtomicF32,
    /// node-local lock, the render thread only ever tries it
    timeline: Mutex<AudioParamTimeline>,
}

/// AudioParam controls an individual aspect of an AudioNode's functionality, such as volume.
///
/// The effective value of a param for a render quantum is its intrinsic value, shaped by the
/// scheduled automation events, plus the sum of all audio signals connected to it.
pub struct AudioParam {
    context: ConcreteBaseAudioContext,
    node: AudioNodeId,
    index: AudioParamId,
    shared: Arc<AudioParamShared>,
}

impl Clone for AudioParam {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            node: self.node,
            index: AudioParamId(self.index.0),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for AudioParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioParam")
            .field("node", &self.node)
            .field("index", &self.index.0)
            .field("automation_rate", &self.automation_rate())
            .field("value", &self.value())
            .finish()
    }
}

/// Create a control-side param and its render-side counterpart
pub(crate) fn audio_param_pair(
    descriptor: AudioParamDescriptor,
    context: ConcreteBaseAudioContext,
    node: AudioNodeId,
    index: AudioParamId,
) -> (AudioParam, AudioParamProcessor) {
    let default_value = descriptor
        .default_value
        .clamp(descriptor.min_value, descriptor.max_value);

    let shared = Arc::new(AudioParamShared {
        descriptor,
        intrinsic_value: AtomicF32::new(default_value),
        current_value: AtomicF32::new(default_value),
        timeline: Mutex::new(AudioParamTimeline::default()),
    });

    let param = AudioParam {
        context,
        node,
        index,
        shared: Arc::clone(&shared),
    };

    (param, AudioParamProcessor::new(shared))
}

impl AudioParam {
    pub fn automation_rate(&self) -> AutomationRate {
        self.shared.descriptor.automation_rate
    }

    pub fn default_value(&self) -> f32 {
        self.shared.descriptor.default_value
    }

    pub fn min_value(&self) -> f32 {
        self.shared.descriptor.min_value
    }

    pub fn max_value(&self) -> f32 {
        self.shared.descriptor.max_value
    }

    /// Value of the first sample frame of the last rendered quantum
    ///
    /// Before any rendering took place this is the intrinsic value.
    pub fn value(&self) -> f32 {
        self.shared.current_value.load()
    }

    /// Set the value directly
    ///
    /// Without pending automation events the change is de-zippered on the render thread. With
    /// pending events this schedules a set-value event at the current time. Non-finite values
    /// are ignored.
    pub fn set_value(&self, value: f32) -> &Self {
        if !value.is_finite() {
            log::warn!("AudioParam::set_value - ignoring non-finite value {}", value);
            return self;
        }

        let mut timeline = self.shared.timeline.lock();
        if timeline.is_empty() {
            self.shared.intrinsic_value.store(value);
            if !self.context.has_rendered() {
                self.shared.current_value.store(value);
            }
        } else {
            let now = self.context.current_time();
            let event = AutomationEvent::set_value(value, now);
            // `now` is finite and non-negative and a set-value never conflicts with itself
            if let Err(e) = timeline.insert(event, self.shared.intrinsic_value.load(), now) {
                log::warn!("AudioParam::set_value - {}", e);
            }
        }
        self
    }

    /// Schedule an immediate jump to `value` at `start_time`
    pub fn set_value_at_time(&self, value: f32, start_time: f64) -> Result<&Self, Error> {
        validate_time_value(start_time, "start time")?;
        self.insert(AutomationEvent::set_value(value, start_time))
    }

    /// Linear ramp from the previous event to `value`, reaching it at `end_time`
    pub fn linear_ramp_to_value_at_time(&self, value: f32, end_time: f64) -> Result<&Self, Error> {
        validate_time_value(end_time, "end time")?;
        self.insert(AutomationEvent::linear_ramp(value, end_time))
    }

    /// Exponential ramp from the previous event to `value`, reaching it at `end_time`
    ///
    /// # Errors
    ///
    /// The ramp is rejected when it would start from, end at, or cross zero.
    pub fn exponential_ramp_to_value_at_time(
        &self,
        value: f32,
        end_time: f64,
    ) -> Result<&Self, Error> {
        validate_time_value(end_time, "end time")?;
        self.insert(AutomationEvent::exponential_ramp(value, end_time))
    }

    /// Exponential approach to `value` starting at `start_time`
    pub fn set_target_at_time(
        &self,
        value: f32,
        start_time: f64,
        time_constant: f64,
    ) -> Result<&Self, Error> {
        validate_time_value(start_time, "start time")?;
        validate_time_value(time_constant, "time constant")?;
        self.insert(AutomationEvent::set_target(value, start_time, time_constant))
    }

    /// Play the `values` curve, linearly interpolated, over `duration` seconds
    pub fn set_value_curve_at_time(
        &self,
        values: &[f32],
        start_time: f64,
        duration: f64,
    ) -> Result<&Self, Error> {
        validate_time_value(start_time, "start time")?;
        self.insert(AutomationEvent::set_value_curve(values, start_time, duration))
    }

    /// Remove all scheduled events at or after `cancel_time`
    pub fn cancel_scheduled_values(&self, cancel_time: f64) -> Result<&Self, Error> {
        validate_time_value(cancel_time, "cancel time")?;
        self.shared.timeline.lock().cancel_scheduled_values(cancel_time);
        Ok(self)
    }

    fn insert(&self, event: AutomationEvent) -> Result<&Self, Error> {
        let now = self.context.current_time();
        let current = self.shared.intrinsic_value.load();
        self.shared.timeline.lock().insert(event, current, now)?;
        Ok(self)
    }

    pub(crate) fn context(&self) -> &ConcreteBaseAudioContext {
        &self.context
    }

    pub(crate) fn node_id(&self) -> AudioNodeId {
        self.node
    }

    pub(crate) fn index(&self) -> usize {
        self.index.0
    }
}

/// Render-side state of a param: computes the values of each quantum
pub(crate) struct AudioParamProcessor {
    shared: Arc<AudioParamShared>,
    smoothed_value: f32,
    values: [f32; RENDER_QUANTUM_SIZE],
    single_valued: bool,
    first_block: bool,
}

impl AudioParamProcessor {
    fn new(shared: Arc<AudioParamShared>) -> Self {
        let value = shared.intrinsic_value.load();
        Self {
            shared,
            smoothed_value: value,
            values: [value; RENDER_QUANTUM_SIZE],
            single_valued: true,
            first_block: true,
        }
    }

    /// Computed values of the current quantum, of length 1 when constant
    pub fn values(&self) -> &[f32] {
        if self.single_valued {
            &self.values[..1]
        } else {
            &self.values[..]
        }
    }

    /// Compute the values for the quantum of `scope`
    ///
    /// `audio_input` is the mono sum of the audio-rate connections, if any.
    pub fn compute(&mut self, scope: &RenderScope, audio_input: Option<&AudioRenderQuantum>) {
        let k_rate = self.shared.descriptor.automation_rate == AutomationRate::K;
        let intrinsic = self.shared.intrinsic_value.load();
        if self.first_block {
            // nothing was audible yet, start at the target
            self.smoothed_value = intrinsic;
            self.first_block = false;
        }

        let block_start = scope.current_time;
        let dt = 1. / f64::from(scope.sample_rate);
        let block_end = block_start + RENDER_QUANTUM_SIZE as f64 * dt;

        let shared = Arc::clone(&self.shared);
        match shared.timeline.try_lock() {
            None => {
                // contended: hold the last value for this quantum
                let last = *self.values().last().unwrap_or(&intrinsic);
                self.set_single(last);
            }
            Some(mut timeline) => {
                if timeline.is_empty() || timeline.starts_after(block_end) {
                    drop(timeline);
                    self.dezipper(intrinsic, k_rate);
                } else if let Some(value) = timeline.settled_value(block_start) {
                    // the automation has ended, the final value becomes the intrinsic value
                    timeline.clear();
                    shared.intrinsic_value.store(value);
                    self.smoothed_value = value;
                    self.set_single(value);
                } else {
                    if k_rate {
                        self.set_single(timeline.value_at(intrinsic, block_start));
                    } else {
                        timeline.fill(intrinsic, block_start, dt, &mut self.values);
                        self.single_valued = false;
                    }
                    timeline.retire(intrinsic, block_start);
                    self.smoothed_value = *self.values().last().unwrap_or(&intrinsic);
                }
            }
        }

        if let Some(input) = audio_input {
            let signal = input.channel_data(0);
            if k_rate {
                self.values[0] += signal[0];
            } else {
                if self.single_valued {
                    let value = self.values[0];
                    self.values.iter_mut().for_each(|v| *v = value);
                    self.single_valued = false;
                }
                self.values
                    .iter_mut()
                    .zip(signal.iter())
                    .for_each(|(v, s)| *v += s);
            }
        }

        let AudioParamDescriptor {
            min_value,
            max_value,
            ..
        } = self.shared.descriptor;
        let len = self.values().len();
        self.values[..len]
            .iter_mut()
            .for_each(|v| *v = v.clamp(min_value, max_value));

        self.shared.current_value.store(self.values[0]);
    }

    fn set_single(&mut self, value: f32) {
        self.values[0] = value;
        self.single_valued = true;
    }

    fn dezipper(&mut self, target: f32, k_rate: bool) {
        if self.smoothed_value == target {
            self.set_single(target);
            return;
        }

        let step = |s: f32| {
            let next = s + (target - s) * DEZIPPER_COEFFICIENT;
            if (next - target).abs() < DEZIPPER_SNAP_THRESHOLD {
                target
            } else {
                next
            }
        };

        if k_rate {
            let mut s = self.smoothed_value;
            for _ in 0..RENDER_QUANTUM_SIZE {
                s = step(s);
            }
            self.smoothed_value = s;
            self.set_single(s);
        } else {
            let mut s = self.smoothed_value;
            self.values.iter_mut().for_each(|v| {
                s = step(s);
                *v = s;
            });
            self.smoothed_value = s;
            self.single_valued = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use float_eq::assert_float_eq;

    use super::*;
    use crate::context::{BaseAudioContext, OfflineAudioContext};

    fn descriptor(rate: AutomationRate) -> AudioParamDescriptor {
        AudioParamDescriptor {
            automation_rate: rate,
            default_value: 0.,
            min_value: -10.,
            max_value: 10.,
        }
    }

    fn pair(rate: AutomationRate) -> (OfflineAudioContext, AudioParam, AudioParamProcessor) {
        let context = OfflineAudioContext::new(1, 128, 48000.).unwrap();
        let (param, processor) = audio_param_pair(
            descriptor(rate),
            context.base().clone(),
            AudioNodeId(0),
            AudioParamId(0),
        );
        (context, param, processor)
    }

    fn scope(quantum: u64) -> RenderScope {
        RenderScope::new(quantum * RENDER_QUANTUM_SIZE as u64, 48000.)
    }

    #[test]
    fn test_default_and_accessors() {
        let (_context, param, _) = pair(AutomationRate::A);

        assert_eq!(param.automation_rate(), AutomationRate::A);
        assert_float_eq!(param.default_value(), 0., abs_all <= 0.);
        assert_float_eq!(param.min_value(), -10., abs_all <= 0.);
        assert_float_eq!(param.max_value(), 10., abs_all <= 0.);
        assert_float_eq!(param.value(), 0., abs_all <= 0.);
    }

    #[test]
    fn test_set_value_before_rendering_is_immediate() {
        let (_context, param, mut processor) = pair(AutomationRate::A);
        param.set_value(2.);
        assert_float_eq!(param.value(), 2., abs_all <= 0.);

        processor.compute(&scope(0), None);
        assert_float_eq!(processor.values(), &[2.][..], abs_all <= 0.);
    }

    #[test]
    fn test_clone_shares_timeline() {
        let (_context, param, mut processor) = pair(AutomationRate::K);
        let other = param.clone();
        other.set_value(3.);
        assert_float_eq!(param.value(), 3., abs_all <= 0.);

        processor.compute(&scope(0), None);
        assert_float_eq!(processor.values(), &[3.][..], abs_all <= 0.);
        assert_float_eq!(other.value(), 3., abs_all <= 0.);
    }

    #[test]
    fn test_set_value_is_dezippered() {
        let (_context, param, mut processor) = pair(AutomationRate::A);
        processor.compute(&scope(0), None);
        assert_float_eq!(processor.values(), &[0.][..], abs_all <= 0.);

        param.set_value(1.);
        processor.compute(&scope(1), None);
        let values = processor.values();
        assert_eq!(values.len(), RENDER_QUANTUM_SIZE);
        assert!(values[0] > 0. && values[0] < 0.01);
        // monotonically approaching the target
        assert!(values.windows(2).all(|w| w[1] > w[0]));
        assert!(values[127] < 1.);

        // eventually snaps exactly onto the target
        let mut quantum = 2;
        while processor.values().len() != 1 {
            processor.compute(&scope(quantum), None);
            quantum += 1;
            assert!(quantum < 100, "smoothing did not terminate");
        }
        assert_float_eq!(processor.values(), &[1.][..], abs_all <= 0.);
        assert_float_eq!(param.value(), 1., abs <= 0.);
    }

    #[test]
    fn test_k_rate_is_single_valued() {
        let (_context, param, mut processor) = pair(AutomationRate::K);
        param.linear_ramp_to_value_at_time(10., 128. / 48000. * 2.).unwrap();

        processor.compute(&scope(0), None);
        assert_float_eq!(processor.values(), &[0.][..], abs_all <= 0.);
        processor.compute(&scope(1), None);
        assert_float_eq!(processor.values(), &[5.][..], abs_all <= 1e-5);
        processor.compute(&scope(2), None);
        assert_float_eq!(processor.values(), &[10.][..], abs_all <= 0.);
    }

    #[test]
    fn test_events_make_block_sample_accurate() {
        let (_context, param, mut processor) = pair(AutomationRate::A);
        // jump at frame 64 of the second quantum
        param.set_value_at_time(5., 192. / 48000.).unwrap();

        processor.compute(&scope(0), None);
        assert_eq!(processor.values().len(), 1);

        processor.compute(&scope(1), None);
        let values = processor.values();
        assert_eq!(values.len(), RENDER_QUANTUM_SIZE);
        assert_float_eq!(values[62], 0., abs <= 0.);
        assert_float_eq!(values[65], 5., abs <= 0.);

        // settled: back to a single value, and the intrinsic value follows
        processor.compute(&scope(2), None);
        assert_float_eq!(processor.values(), &[5.][..], abs_all <= 0.);
        assert!(param.shared.timeline.lock().is_empty());
    }

    #[test]
    fn test_audio_input_is_summed_and_clamped() {
        let (_context, param, mut processor) = pair(AutomationRate::A);
        param.set_value(1.);

        let mut input = AudioRenderQuantum::silence(1);
        input
            .channel_data_mut(0)
            .iter_mut()
            .enumerate()
            .for_each(|(i, v)| *v = i as f32 / 10.);

        processor.compute(&scope(0), Some(&input));
        let values = processor.values();
        assert_eq!(values.len(), RENDER_QUANTUM_SIZE);
        assert_float_eq!(values[0], 1., abs <= 0.);
        assert_float_eq!(values[10], 2., abs <= 1e-6);
        // clamped to the max value
        assert_float_eq!(values[127], 10., abs <= 0.);
    }

    #[test]
    fn test_contended_timeline_holds_value() {
        let (_context, param, mut processor) = pair(AutomationRate::A);
        param.set_value(3.);
        processor.compute(&scope(0), None);

        let guard = param.shared.timeline.lock();
        processor.compute(&scope(1), None);
        assert_float_eq!(processor.values(), &[3.][..], abs_all <= 0.);
        drop(guard);
    }

    #[test]
    fn test_invalid_automation_is_rejected() {
        let (_context, param, _) = pair(AutomationRate::A);
        assert!(param.set_value_at_time(1., -1.).is_err());
        assert!(param.exponential_ramp_to_value_at_time(0., 1.).is_err());
        assert!(param.set_target_at_time(1., 0., -1.).is_err());
        assert!(param.set_value_curve_at_time(&[1.], 0., 1.).is_err());
    }

    #[test]
    fn test_sample_rate_used_for_time() {
        let (context, _, _) = pair(AutomationRate::A);
        assert_float_eq!(context.sample_rate(), 48000., abs <= 0.);
    }
}
