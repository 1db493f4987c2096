//! Graph lock shared by the control and render thread

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};

use super::graph::{Graph, GraphMutation};

/// Owner of the audio graph
///
/// The control thread takes the lock with [`lock`](Self::lock) (blocking), the render thread with
/// [`try_lock`](Self::try_lock) (never blocking). Mutations submitted while the lock is held are
/// queued and applied, in submission order, before anything else touches the graph again.
pub(crate) struct GraphScheduler {
    graph: Mutex<Graph>,
    deferred_send: Sender<GraphMutation>,
    deferred_recv: Receiver<GraphMutation>,
}

impl std::fmt::Debug for GraphScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphScheduler")
            .field("deferred", &self.deferred_recv.len())
            .finish_non_exhaustive()
    }
}

impl GraphScheduler {
    pub fn new(graph: Graph) -> Self {
        let (deferred_send, deferred_recv) = crossbeam_channel::unbounded();
        Self {
            graph: Mutex::new(graph),
            deferred_send,
            deferred_recv,
        }
    }

    /// Blocking acquisition, for the control thread only
    pub fn lock(&self) -> MutexGuard<'_, Graph> {
        let mut graph = self.graph.lock();
        self.apply_deferred(&mut graph);
        graph
    }

    /// Non-blocking acquisition, for the render thread
    ///
    /// Returns `None` when the control thread holds the lock. The caller renders silence for this
    /// quantum and tries again at the next one.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Graph>> {
        let mut graph = self.graph.try_lock()?;
        self.apply_deferred(&mut graph);
        Some(graph)
    }

    /// Apply a mutation now when the graph is free, queue it otherwise
    pub fn submit(&self, mutation: GraphMutation) {
        match self.graph.try_lock() {
            Some(mut graph) => {
                self.apply_deferred(&mut graph);
                graph.apply(mutation);
            }
            None => {
                // the receiver lives in self, sending cannot fail
                let _ = self.deferred_send.send(mutation);
            }
        }
    }

    fn apply_deferred(&self, graph: &mut Graph) {
        for mutation in self.deferred_recv.try_iter() {
            graph.apply(mutation);
        }
    }

    #[cfg(test)]
    pub fn deferred_count(&self) -> usize {
        self.deferred_recv.len()
    }
}
