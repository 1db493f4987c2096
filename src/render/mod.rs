//! Primitives related to audio graph rendering

// private mods
pub(crate) mod graph;
mod node_collection;
pub(crate) mod ports;
pub(crate) mod scheduler;

// pub(crate) mods
mod thread;
pub(crate) use thread::*;

// public mods
mod processor;
pub use processor::*;

mod quantum;
pub use quantum::*;
