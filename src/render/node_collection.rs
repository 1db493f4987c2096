use crate::context::AudioNodeId;
use crate::render::graph::Node;

use std::cell::RefCell;
use std::ops::Index;

/// Arena of render-side nodes, addressed by their stable id
///
/// Slots of freed nodes are left empty until the control thread hands the id out again.
pub(crate) struct NodeCollection {
    nodes: Vec<Option<RefCell<Node>>>,
}

impl NodeCollection {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity);
        nodes.resize_with(capacity, || None);
        Self { nodes }
    }

    #[inline(always)]
    pub fn insert(&mut self, index: AudioNodeId, value: Node) {
        let index = index.0 as usize;
        if index >= self.nodes.len() {
            self.nodes.resize_with(index + 1, || None);
        }
        debug_assert!(self.nodes[index].is_none(), "node id {} reused", index);
        self.nodes[index] = Some(RefCell::new(value));
    }

    #[inline(always)]
    pub fn remove(&mut self, index: AudioNodeId) -> Option<Node> {
        self.nodes
            .get_mut(index.0 as usize)
            .and_then(Option::take)
            .map(RefCell::into_inner)
    }

    #[inline(always)]
    pub fn get(&self, index: AudioNodeId) -> Option<&RefCell<Node>> {
        self.nodes.get(index.0 as usize).and_then(Option::as_ref)
    }

    #[inline(always)]
    pub fn get_mut(&mut self, index: AudioNodeId) -> Option<&mut Node> {
        self.nodes
            .get_mut(index.0 as usize)
            .and_then(Option::as_mut)
            .map(RefCell::get_mut)
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }
}

impl Index<AudioNodeId> for NodeCollection {
    type Output = RefCell<Node>;

    #[track_caller]
    #[inline(always)]
    fn index(&self, index: AudioNodeId) -> &Self::Output {
        self.get(index)
            .unwrap_or_else(|| panic!("Unexpected index {} for NodeCollection", index.0))
    }
}
