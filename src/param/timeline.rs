//! Automation event timeline of a single param
use std::sync::Arc;

use crate::Error;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum AutomationEventKind {
    SetValue,
    LinearRamp,
    ExponentialRamp,
    SetTarget { time_constant: f64 },
    SetValueCurve { values: Arc<[f32]>, duration: f64 },
}

/// Scheduled change of a param value
///
/// For ramps, `time` is the end of the ramp. For all other kinds it is the start of the event.
#[derive(Clone, Debug)]
pub(crate) struct AutomationEvent {
    pub kind: AutomationEventKind,
    pub value: f32,
    pub time: f64,
    /// value right before a set-target event, kept once its predecessor has been retired
    start_value: Option<f32>,
}

impl AutomationEvent {
    pub fn set_value(value: f32, time: f64) -> Self {
        Self::new(AutomationEventKind::SetValue, value, time)
    }

    pub fn linear_ramp(value: f32, time: f64) -> Self {
        Self::new(AutomationEventKind::LinearRamp, value, time)
    }

    pub fn exponential_ramp(value: f32, time: f64) -> Self {
        Self::new(AutomationEventKind::ExponentialRamp, value, time)
    }

    pub fn set_target(value: f32, time: f64, time_constant: f64) -> Self {
        Self::new(AutomationEventKind::SetTarget { time_constant }, value, time)
    }

    pub fn set_value_curve(values: &[f32], time: f64, duration: f64) -> Self {
        let last = values.last().copied().unwrap_or_default();
        let kind = AutomationEventKind::SetValueCurve {
            values: values.into(),
            duration,
        };
        Self::new(kind, last, time)
    }

    fn new(kind: AutomationEventKind, value: f32, time: f64) -> Self {
        Self {
            kind,
            value,
            time,
            start_value: None,
        }
    }

    fn is_ramp(&self) -> bool {
        matches!(
            self.kind,
            AutomationEventKind::LinearRamp | AutomationEventKind::ExponentialRamp
        )
    }

    fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(&self.kind) == std::mem::discriminant(&other.kind)
    }

    /// Time span covered by a value curve
    fn curve_span(&self) -> Option<(f64, f64)> {
        match self.kind {
            AutomationEventKind::SetValueCurve { duration, .. } => {
                Some((self.time, self.time + duration))
            }
            _ => None,
        }
    }
}

fn curve_value(values: &[f32], start: f64, duration: f64, t: f64) -> f32 {
    let last = values.len() - 1;
    if t >= start + duration {
        return values[last];
    }
    let position = ((t - start) / duration).max(0.) * last as f64;
    let index = position.floor() as usize;
    if index >= last {
        return values[last];
    }
    let frac = (position - index as f64) as f32;
    values[index] + (values[index + 1] - values[index]) * frac
}

/// Ordered automation events of a param
///
/// Values are evaluated relative to a default (the intrinsic param value) that applies before
/// the first event.
#[derive(Debug, Default)]
pub(crate) struct AudioParamTimeline {
    events: Vec<AutomationEvent>,
}

impl AudioParamTimeline {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Validate and insert an event
    ///
    /// Nothing is changed when an error is returned. A ramp without any preceding event ramps
    /// from `current_value` starting at `now`.
    pub fn insert(
        &mut self,
        mut event: AutomationEvent,
        current_value: f32,
        now: f64,
    ) -> Result<(), Error> {
        if !event.time.is_finite() || event.time < 0. {
            return Err(Error::InvalidArgument(format!(
                "automation time ({}) should be a finite non-negative number",
                event.time
            )));
        }

        let mut jump = false;
        match &event.kind {
            AutomationEventKind::SetTarget { time_constant } => {
                if !time_constant.is_finite() || *time_constant < 0. {
                    return Err(Error::InvalidArgument(format!(
                        "time constant ({}) should be a finite non-negative number",
                        time_constant
                    )));
                }
                jump = *time_constant == 0.;
            }
            AutomationEventKind::SetValueCurve { values, duration } => {
                if values.len() < 2 {
                    return Err(Error::InvalidArgument(format!(
                        "value curve needs at least 2 values, got {}",
                        values.len()
                    )));
                }
                if !duration.is_finite() || *duration <= 0. {
                    return Err(Error::InvalidArgument(format!(
                        "curve duration ({}) should be a finite positive number",
                        duration
                    )));
                }
            }
            AutomationEventKind::ExponentialRamp => {
                if event.value == 0. {
                    return Err(Error::InvalidArgument(
                        "exponential ramp target cannot be zero".into(),
                    ));
                }
            }
            _ => (),
        }
        if jump {
            // zero time constant jumps to the target
            event = AutomationEvent::set_value(event.value, event.time);
        }

        self.check_curve_overlap(&event)?;

        // events at the same time are kept in insertion order, unless the kind matches
        let index = self.events.partition_point(|e| e.time <= event.time);
        if let Some(existing) = index.checked_sub(1).map(|i| &self.events[i]) {
            if existing.time == event.time && existing.same_kind(&event) {
                let replaced = std::mem::replace(&mut self.events[index - 1], event);
                if let Err(e) = self.check_exponential_ramps(index - 1, current_value) {
                    self.events[index - 1] = replaced;
                    return Err(e);
                }
                return Ok(());
            }
        }

        if event.is_ramp() && index == 0 {
            let start = AutomationEvent::set_value(current_value, now.min(event.time));
            self.events.insert(0, start);
            self.events.insert(1, event);
            if let Err(e) = self.check_exponential_ramps(1, current_value) {
                self.events.drain(0..2);
                return Err(e);
            }
            return Ok(());
        }

        self.events.insert(index, event);
        if let Err(e) = self.check_exponential_ramps(index, current_value) {
            self.events.remove(index);
            return Err(e);
        }
        Ok(())
    }

    fn check_curve_overlap(&self, event: &AutomationEvent) -> Result<(), Error> {
        let overlaps = |a: (f64, f64), t: f64| t > a.0 && t < a.1;

        for existing in &self.events {
            let conflict = match (existing.curve_span(), event.curve_span()) {
                (Some(span), None) => overlaps(span, event.time),
                (None, Some(span)) => overlaps(span, existing.time),
                (Some(a), Some(b)) => a.0 < b.1 && b.0 < a.1,
                (None, None) => false,
            };
            if conflict {
                return Err(Error::NotSupported(format!(
                    "automation event at {} overlaps a value curve",
                    event.time
                )));
            }
        }
        Ok(())
    }

    /// Check the event at `index` and the one after it, which now ramps from a new value
    fn check_exponential_ramps(&self, index: usize, current_value: f32) -> Result<(), Error> {
        self.check_exponential_ramp(index, current_value)?;
        if index + 1 < self.events.len() {
            self.check_exponential_ramp(index + 1, current_value)?;
        }
        Ok(())
    }

    fn check_exponential_ramp(&self, index: usize, current_value: f32) -> Result<(), Error> {
        let event = &self.events[index];
        if event.kind != AutomationEventKind::ExponentialRamp {
            return Ok(());
        }
        let (_, start) = self.segment_end(index, current_value);
        if start == 0. || start.signum() != event.value.signum() {
            return Err(Error::InvalidArgument(format!(
                "exponential ramp from {} to {} would cross zero",
                start, event.value
            )));
        }
        Ok(())
    }

    /// Remove all events at or after `cancel_time`
    pub fn cancel_scheduled_values(&mut self, cancel_time: f64) {
        self.events.retain(|e| e.time < cancel_time);
    }

    /// Value at time `t`
    pub fn value_at(&self, default: f32, t: f64) -> f32 {
        let next = self.events.partition_point(|e| e.time <= t);
        if self.events.get(next).map_or(false, AutomationEvent::is_ramp) {
            return self.ramp_value(next, default, t);
        }
        match next.checked_sub(1) {
            None => default,
            Some(index) => self.hold_value(index, default, t),
        }
    }

    /// Fill `out` with the values of consecutive sample frames starting at `start`
    pub fn fill(&self, default: f32, start: f64, dt: f64, out: &mut [f32]) {
        out.iter_mut()
            .enumerate()
            .for_each(|(i, v)| *v = self.value_at(default, start + i as f64 * dt));
    }

    /// The value when the timeline no longer changes from `t` onwards
    pub fn settled_value(&self, t: f64) -> Option<f32> {
        if self.events.len() != 1 {
            return None;
        }
        let event = &self.events[0];
        match event.kind {
            AutomationEventKind::SetTarget { .. } => None,
            AutomationEventKind::SetValueCurve { duration, .. } => {
                (event.time + duration <= t).then(|| event.value)
            }
            _ => (event.time <= t).then(|| event.value),
        }
    }

    /// True when no event affects values before `t`
    pub fn starts_after(&self, t: f64) -> bool {
        self.events
            .first()
            .map_or(true, |e| e.time >= t && !e.is_ramp())
    }

    /// Drop events that no longer influence values from `t` onwards
    pub fn retire(&mut self, default: f32, t: f64) {
        while self.events.len() >= 2 && self.events[1].time <= t {
            if matches!(self.events[1].kind, AutomationEventKind::SetTarget { .. })
                && self.events[1].start_value.is_none()
            {
                self.events[1].start_value = Some(self.value_before(1, default));
            }
            self.events.remove(0);
        }
    }

    /// End point (time, value) of the segment governed by the event at `index`, where a
    /// following ramp starts
    fn segment_end(&self, index: usize, default: f32) -> (f64, f32) {
        let previous = match index.checked_sub(1) {
            Some(previous) => previous,
            None => return (0., default),
        };
        let event = &self.events[previous];
        match &event.kind {
            AutomationEventKind::SetTarget { .. } => (event.time, self.value_before(previous, default)),
            AutomationEventKind::SetValueCurve { duration, .. } => {
                (event.time + duration, event.value)
            }
            _ => (event.time, event.value),
        }
    }

    /// Value right before the event at `index` starts
    fn value_before(&self, index: usize, default: f32) -> f32 {
        if let Some(v) = self.events[index].start_value {
            return v;
        }
        match index.checked_sub(1) {
            None => default,
            Some(previous) => self.hold_value(previous, default, self.events[index].time),
        }
    }

    /// Value at `t` of the event at `index`, when no ramp is in progress
    fn hold_value(&self, index: usize, default: f32, t: f64) -> f32 {
        let event = &self.events[index];
        match &event.kind {
            AutomationEventKind::SetValue
            | AutomationEventKind::LinearRamp
            | AutomationEventKind::ExponentialRamp => event.value,
            AutomationEventKind::SetTarget { time_constant } => {
                let start = f64::from(self.value_before(index, default));
                let target = f64::from(event.value);
                let decay = (-(t - event.time) / time_constant).exp();
                (target + (start - target) * decay) as f32
            }
            AutomationEventKind::SetValueCurve { values, duration } => {
                curve_value(values, event.time, *duration, t)
            }
        }
    }

    /// Value at `t` of the ramp at `index`, `t` lies before the ramp end
    fn ramp_value(&self, index: usize, default: f32, t: f64) -> f32 {
        let event = &self.events[index];
        let (t0, v0) = self.segment_end(index, default);
        if t <= t0 {
            return v0;
        }
        if event.time <= t0 {
            return event.value;
        }
        let phase = (t - t0) / (event.time - t0);
        let v1 = event.value;

        match event.kind {
            AutomationEventKind::LinearRamp => {
                (f64::from(v0) + f64::from(v1 - v0) * phase) as f32
            }
            AutomationEventKind::ExponentialRamp => {
                if v0 == 0. || v0.signum() != v1.signum() {
                    v0
                } else {
                    (f64::from(v0) * (f64::from(v1) / f64::from(v0)).powf(phase)) as f32
                }
            }
            _ => unreachable!(),
        }
    }
}
