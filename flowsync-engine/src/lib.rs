pub mod engine;
pub mod errors;
pub mod node;

#[cfg(test)]
mod tests;

pub use engine::{Context, EdgeKind, Engine, RunResult};
pub use errors::EngineError;
pub use node::{Change, HandlerOutcome, Node, NodeFlags, NodeState, NodeStats};
