pub mod activations;
mod graph;
pub mod layers;
pub mod loss;

pub use graph::{Graph, NamedParam, NodeView};
