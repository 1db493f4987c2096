use crate::context::AudioNodeId;
use crate::render::graph::Node;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

/// The Event interface
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Event {
    pub type_: &'static str,
}

/// Event fired when the processor of a node panicked during rendering
///
/// The node outputs silence for the remainder of its lifetime.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// The panic message
    pub message: String,
    /// Inherits from this base Event
    pub event: Event,
}

#[derive(Hash, Eq, PartialEq, Debug, Clone, Copy)]
pub(crate) enum EventType {
    Ended(AudioNodeId),
    StateChange,
    ProcessorError(AudioNodeId),
}

#[derive(Debug)]
pub(crate) enum EventPayload {
    None,
    ProcessorError(ErrorEvent),
}

#[derive(Debug)]
pub(crate) struct EventDispatch {
    type_: EventType,
    payload: EventPayload,
}

impl EventDispatch {
    pub fn ended(id: AudioNodeId) -> Self {
        EventDispatch {
            type_: EventType::Ended(id),
            payload: EventPayload::None,
        }
    }

    pub fn state_change() -> Self {
        EventDispatch {
            type_: EventType::StateChange,
            payload: EventPayload::None,
        }
    }

    pub fn processor_error(id: AudioNodeId, message: String) -> Self {
        EventDispatch {
            type_: EventType::ProcessorError(id),
            payload: EventPayload::ProcessorError(ErrorEvent {
                message,
                event: Event {
                    type_: "ErrorEvent",
                },
            }),
        }
    }
}

pub(crate) enum EventHandler {
    Once(Box<dyn FnOnce(EventPayload) + Send + 'static>),
    Multiple(Box<dyn FnMut(EventPayload) + Send + 'static>),
}

/// Nodes removed from the graph, shipped off the render thread to be freed
pub(crate) type Garbage = Vec<(AudioNodeId, Node)>;

/// Control-side worker: runs event callbacks and frees removed nodes
#[derive(Clone, Default)]
pub(crate) struct EventLoop {
    event_handlers: Arc<Mutex<HashMap<EventType, EventHandler>>>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("handlers", &self.event_handlers.lock().len())
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the event thread
    ///
    /// The thread exits when the render side dropped both of its senders.
    pub fn run(
        &self,
        event_channel: Receiver<EventDispatch>,
        garbage_channel: Receiver<Garbage>,
        reclaim_ids: Sender<AudioNodeId>,
    ) {
        let self_clone = self.clone();

        std::thread::spawn(move || {
            log::debug!("Entering event loop thread");
            let never_events = crossbeam_channel::never();
            let never_garbage = crossbeam_channel::never();
            let mut events_open = true;
            let mut garbage_open = true;

            // this thread is dedicated to event handling so we can block
            while events_open || garbage_open {
                let events = if events_open {
                    &event_channel
                } else {
                    &never_events
                };
                let garbage = if garbage_open {
                    &garbage_channel
                } else {
                    &never_garbage
                };

                crossbeam_channel::select! {
                    recv(events) -> msg => match msg {
                        Ok(event) => self_clone.handle_event(event),
                        Err(_) => events_open = false,
                    },
                    recv(garbage) -> msg => match msg {
                        Ok(nodes) => {
                            // events of the freed nodes were sent before them, run those first
                            event_channel
                                .try_iter()
                                .for_each(|event| self_clone.handle_event(event));
                            self_clone.free_nodes(nodes, &reclaim_ids);
                        }
                        Err(_) => garbage_open = false,
                    },
                }
            }
            log::debug!("Exiting event loop thread");
        });
    }

    fn handle_event(&self, event: EventDispatch) {
        let EventDispatch { type_, payload } = event;

        // the callback may register new handlers, so it runs without the lock held
        let handler = self.event_handlers.lock().remove(&type_);
        match handler {
            Some(EventHandler::Once(f)) => (f)(payload),
            Some(EventHandler::Multiple(mut f)) => {
                (f)(payload);
                self.event_handlers
                    .lock()
                    .entry(type_)
                    .or_insert(EventHandler::Multiple(f));
            }
            None => {
                if let EventPayload::ProcessorError(e) = payload {
                    log::warn!("Processor of node {:?} panicked: {}", type_, e.message);
                }
            }
        }
    }

    fn free_nodes(&self, nodes: Garbage, reclaim_ids: &Sender<AudioNodeId>) {
        for (id, node) in nodes {
            drop(node);
            log::debug!("Freed node {:?}", id);

            {
                let mut handlers = self.event_handlers.lock();
                handlers.remove(&EventType::Ended(id));
                handlers.remove(&EventType::ProcessorError(id));
            }
            // the context may be gone already
            let _ = reclaim_ids.send(id);
        }
    }

    pub fn set_handler(&self, event: EventType, callback: EventHandler) {
        self.event_handlers.lock().insert(event, callback);
    }

    pub fn clear_handler(&self, event: EventType) {
        self.event_handlers.lock().remove(&event);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_once_handler_runs_once() {
        let event_loop = EventLoop::new();
        let (event_send, event_recv) = crossbeam_channel::bounded(8);
        let (_garbage_send, garbage_recv) = crossbeam_channel::unbounded::<Garbage>();
        let (reclaim_send, _reclaim_recv) = crossbeam_channel::unbounded();
        event_loop.run(event_recv, garbage_recv, reclaim_send);

        let (called_send, called_recv) = crossbeam_channel::unbounded();
        event_loop.set_handler(
            EventType::Ended(AudioNodeId(3)),
            EventHandler::Once(Box::new(move |_| called_send.send(()).unwrap())),
        );

        event_send.send(EventDispatch::ended(AudioNodeId(3))).unwrap();
        event_send.send(EventDispatch::ended(AudioNodeId(3))).unwrap();
        assert!(called_recv
            .recv_timeout(Duration::from_secs(1))
            .is_ok());
        assert!(called_recv
            .recv_timeout(Duration::from_millis(50))
            .is_err());
    }

    #[test]
    fn test_multiple_handler_sees_every_state_change() {
        let event_loop = EventLoop::new();
        let (event_send, event_recv) = crossbeam_channel::bounded(8);
        let (_garbage_send, garbage_recv) = crossbeam_channel::unbounded::<Garbage>();
        let (reclaim_send, _reclaim_recv) = crossbeam_channel::unbounded();
        event_loop.run(event_recv, garbage_recv, reclaim_send);

        let (state_send, state_recv) = crossbeam_channel::unbounded();
        event_loop.set_handler(
            EventType::StateChange,
            EventHandler::Multiple(Box::new(move |_| {
                state_send.send(()).unwrap();
            })),
        );

        for _ in 0..2 {
            event_send.send(EventDispatch::state_change()).unwrap();
        }
        let timeout = Duration::from_secs(1);
        assert!(state_recv.recv_timeout(timeout).is_ok());
        assert!(state_recv.recv_timeout(timeout).is_ok());
    }
}
