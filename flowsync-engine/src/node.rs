use crate::engine::Context;
use crate::errors::EngineError;
use flowsync_types::node::NodeHandle;
use std::any::Any;
use std::fmt::Debug;

/// Where a node's cache stands within the current engine epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Not visited this epoch (or the epoch was canceled before reaching it).
    Stale,
    /// Visited; cache identical to last epoch.
    Unchanged,
    /// Visited; cache changed this epoch.
    Updated,
}

/// What a recompute reported about the node's cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    Updated,
}

/// What an incremental change handler reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    Unchanged,
    Updated,
    /// The handler cannot fold this delta; the engine falls back to a full
    /// recompute, which is always correct.
    Unhandled,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NodeFlags {
    /// Node produces per-iteration tracked data; the engine invokes
    /// `clear_tracked` during init-run.
    pub clears_tracked_data: bool,
    /// Node accumulates southbound mutations. The engine requires every
    /// flagged node to take the declared write gate (see
    /// [`crate::Engine::set_write_gate`]) as an input, so pending writes
    /// are re-surfaced the moment writability returns. Cancellation of
    /// read-only iterations stays uniform through `run(recompute_allowed)`.
    pub may_write_southbound: bool,
    /// Node's `is_valid` is meaningful and consulted every iteration.
    pub has_validity_check: bool,
}

impl NodeFlags {
    pub fn clears_tracked() -> Self {
        Self {
            clears_tracked_data: true,
            ..Default::default()
        }
    }

    pub fn writes_southbound() -> Self {
        Self {
            may_write_southbound: true,
            ..Default::default()
        }
    }
}

/// Per-node scheduling counters, surfaced over unixctl.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeStats {
    pub recompute: u64,
    pub handled: u64,
    pub changes: u64,
    pub cancels: u64,
}

/// One unit of derived state. Implementations own their cache exclusively;
/// reads of other nodes go through the [`Context`] and must not outlive the
/// callback.
pub trait Node: Debug + 'static {
    /// One-time setup before the first iteration, in dependency order.
    fn init(&mut self, ctx: &Context) -> Result<(), EngineError> {
        let _ = ctx;
        Ok(())
    }

    /// Full recompute of the cache from current inputs.
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError>;

    /// Folds the delta of one updated input into the cache without
    /// recomputing. The default declares every input unhandled.
    fn handle_change(
        &mut self,
        input: &NodeHandle,
        ctx: &Context,
    ) -> Result<HandlerOutcome, EngineError> {
        let _ = (input, ctx);
        Ok(HandlerOutcome::Unhandled)
    }

    /// Drops per-iteration tracked data. Called during init-run for nodes
    /// flagged `clears_tracked_data`.
    fn clear_tracked(&mut self) {}

    /// Whether the cache may still be consumed incrementally. Invalid nodes
    /// recompute regardless of input deltas.
    fn is_valid(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
