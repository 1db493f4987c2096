use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::AudioNode;
use crate::context::AudioContextRegistration;
use crate::events::{Event, EventHandler, EventType};
use crate::render::graph::GraphMutation;
use crate::render::RenderScope;
use crate::{validate_time_value, AtomicF64, Error, RENDER_QUANTUM_SIZE};

/// Playback progress of a scheduled source
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlaybackState {
    /// `start` was not called yet
    Unscheduled,
    /// Started, waiting for the start time to be reached
    Scheduled,
    /// Producing output
    Playing,
    /// Stop time (or end of the buffer) was rendered, the node stays silent from now on
    Finished,
}

impl From<u8> for PlaybackState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Unscheduled,
            1 => Self::Scheduled,
            2 => Self::Playing,
            _ => Self::Finished,
        }
    }
}

/// Interface of source nodes, controlling start and stop times.
/// The node will emit silence before it is started, and after it has ended.
pub trait AudioScheduledSourceNode: AudioNode {
    /// Play immediately
    ///
    /// # Errors
    ///
    /// `InvalidState` if the source was already started
    fn start(&self) -> Result<(), Error> {
        let when = self.context().current_time();
        self.start_at(when)
    }

    /// Schedule playback start at given timestamp
    ///
    /// A time in the past starts playback right away.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a negative or non-finite time
    /// - `InvalidState` if the source was already started
    fn start_at(&self, when: f64) -> Result<(), Error>;

    /// Stop immediately
    ///
    /// # Errors
    ///
    /// `InvalidState` if the source was not started
    fn stop(&self) -> Result<(), Error> {
        let when = self.context().current_time();
        self.stop_at(when)
    }

    /// Schedule playback stop at given timestamp
    ///
    /// Can be called multiple times, the latest call wins.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a negative or non-finite time
    /// - `InvalidState` if the source was not started
    fn stop_at(&self, when: f64) -> Result<(), Error>;

    /// Current playback state, as last observed by the render thread
    fn playback_state(&self) -> PlaybackState;

    /// Register callback to run when the source node has stopped playing
    ///
    /// For all [`AudioScheduledSourceNode`]s, the ended event is dispatched when the stop time
    /// determined by stop() is reached. For an
    /// [`AudioBufferSourceNode`](crate::node::AudioBufferSourceNode), the event is also
    /// dispatched because the duration has been reached or if the entire buffer has been played.
    ///
    /// Only a single event handler is active at any time. Calling this method multiple times will
    /// override the previous event handler.
    fn set_onended<F: FnOnce(Event) + Send + 'static>(&self, callback: F) {
        let callback = move |_| callback(Event { type_: "ended" });

        self.context().set_event_handler(
            EventType::Ended(self.registration().id()),
            EventHandler::Once(Box::new(callback)),
        );
    }

    /// Unset the callback to run when the source node has stopped playing
    fn clear_onended(&self) {
        self.context()
            .clear_event_handler(EventType::Ended(self.registration().id()));
    }
}

/// Part of the quantum a source plays in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Playback {
    /// The start frame lies after this quantum
    Pending,
    /// Frames `begin..end` of this quantum are played, `last` when the stop frame falls inside
    Active { begin: usize, end: usize, last: bool },
    /// Finished in an earlier quantum
    Ended,
}

/// Start and stop times shared between a source node and its processor
#[derive(Clone, Debug)]
pub(crate) struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug)]
struct SchedulerInner {
    state: AtomicU8,
    start: AtomicF64,
    stop: AtomicF64,
}

/// First frame at or after `time`
///
/// Times are computed from frame counts, allow for the rounding of that conversion.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn frame_at(time: f64, sample_rate: f32) -> u64 {
    let frame = time * f64::from(sample_rate);
    let nearest = frame.round();
    if (frame - nearest).abs() < 1e-6 {
        nearest as u64
    } else {
        frame.ceil() as u64
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: AtomicU8::new(PlaybackState::Unscheduled as u8),
                start: AtomicF64::new(f64::INFINITY),
                stop: AtomicF64::new(f64::INFINITY),
            }),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.state.load(Ordering::SeqCst).into()
    }

    /// Control side: schedule the start and keep the node alive until it finishes
    pub fn start_at(&self, when: f64, registration: &AudioContextRegistration) -> Result<(), Error> {
        validate_time_value(when, "start time")?;
        let context = registration.context();
        context.ensure_open()?;

        self.inner
            .state
            .compare_exchange(
                PlaybackState::Unscheduled as u8,
                PlaybackState::Scheduled as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| Error::InvalidState("cannot call `start` twice".into()))?;

        self.inner.start.store(when.max(context.current_time()));
        context.submit(GraphMutation::ActivateSource {
            id: registration.id(),
        });

        Ok(())
    }

    /// Control side: (re)schedule the stop, the latest call wins
    pub fn stop_at(&self, when: f64) -> Result<(), Error> {
        validate_time_value(when, "stop time")?;
        if self.state() == PlaybackState::Unscheduled {
            return Err(Error::InvalidState(
                "cannot call `stop` before `start`".into(),
            ));
        }

        self.inner.stop.store(when);
        Ok(())
    }

    pub fn start_time(&self) -> f64 {
        self.inner.start.load()
    }

    /// Render side: the part of the current quantum that is played
    pub fn playback(&self, scope: &RenderScope) -> Playback {
        if self.state() == PlaybackState::Finished {
            return Playback::Ended;
        }
        let start = self.inner.start.load();
        if !start.is_finite() {
            return Playback::Pending;
        }
        let stop = self.inner.stop.load();

        let quantum_start = scope.current_frame;
        let quantum_end = quantum_start + RENDER_QUANTUM_SIZE as u64;
        let start_frame = frame_at(start, scope.sample_rate);
        let stop_frame = if stop.is_finite() {
            frame_at(stop, scope.sample_rate)
        } else {
            u64::MAX
        };

        let last = stop_frame < quantum_end;
        if start_frame >= quantum_end && !last {
            return Playback::Pending;
        }

        let begin = (start_frame.clamp(quantum_start, quantum_end) - quantum_start) as usize;
        let end = (stop_frame.clamp(quantum_start, quantum_end) - quantum_start) as usize;
        let end = end.max(begin);
        if begin < end {
            self.set_state(PlaybackState::Playing);
        }

        Playback::Active { begin, end, last }
    }

    /// Render side: playback is over, leave the active-source set at the end of the quantum
    pub fn finish(&self, scope: &RenderScope) {
        if self.state() == PlaybackState::Finished {
            return;
        }
        self.set_state(PlaybackState::Finished);
        scope.notify_finished();
        scope.send_ended_event();
    }

    fn set_state(&self, state: PlaybackState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(quantum: u64) -> RenderScope {
        RenderScope::new(quantum * RENDER_QUANTUM_SIZE as u64, 48000.)
    }

    fn started(start: f64, stop: f64) -> Scheduler {
        let scheduler = Scheduler::new();
        scheduler.set_state(PlaybackState::Scheduled);
        scheduler.inner.start.store(start);
        scheduler.inner.stop.store(stop);
        scheduler
    }

    #[test]
    fn test_frame_at() {
        assert_eq!(frame_at(0.5, 48000.), 24000);
        assert_eq!(frame_at(0.1, 48000.), 4800);
        assert_eq!(frame_at(129. / 48000., 48000.), 129);
        assert_eq!(frame_at(1.5 / 48000., 48000.), 2);
    }

    #[test]
    fn test_unscheduled_is_pending() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.playback(&scope(0)), Playback::Pending);
        assert_eq!(scheduler.state(), PlaybackState::Unscheduled);
    }

    #[test]
    fn test_start_and_stop_inside_quanta() {
        let scheduler = started(130. / 48000., 300. / 48000.);

        assert_eq!(scheduler.playback(&scope(0)), Playback::Pending);
        assert_eq!(
            scheduler.playback(&scope(1)),
            Playback::Active {
                begin: 2,
                end: 128,
                last: false
            }
        );
        assert_eq!(scheduler.state(), PlaybackState::Playing);
        assert_eq!(
            scheduler.playback(&scope(2)),
            Playback::Active {
                begin: 0,
                end: 44,
                last: true
            }
        );
    }

    #[test]
    fn test_stop_on_quantum_boundary_finishes_next_quantum() {
        let scheduler = started(0., 256. / 48000.);
        assert_eq!(
            scheduler.playback(&scope(1)),
            Playback::Active {
                begin: 0,
                end: 128,
                last: false
            }
        );
        assert_eq!(
            scheduler.playback(&scope(2)),
            Playback::Active {
                begin: 0,
                end: 0,
                last: true
            }
        );
    }

    #[test]
    fn test_stop_before_start_plays_nothing() {
        let scheduler = started(100. / 48000., 50. / 48000.);
        assert_eq!(
            scheduler.playback(&scope(0)),
            Playback::Active {
                begin: 100,
                end: 100,
                last: true
            }
        );
        assert_eq!(scheduler.state(), PlaybackState::Scheduled);
    }

    #[test]
    fn test_finish_once() {
        let scheduler = started(0., 0.);
        let scope = scope(0);
        scheduler.finish(&scope);
        scheduler.finish(&scope);
        assert_eq!(scope.take_finished().len(), 1);
        assert_eq!(scheduler.playback(&scope), Playback::Ended);
    }
}
