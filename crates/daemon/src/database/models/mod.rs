mod node;
mod rule;

pub use node::{Node, NodeKey};
pub use rule::Rule;
