use crate::errors::EngineError;
use crate::node::{Change, HandlerOutcome, Node, NodeFlags, NodeState, NodeStats};
use daggy::petgraph::algo::toposort;
use flowsync_types::log::{debug, info};
use flowsync_types::node::NodeHandle;
use std::collections::HashMap;

/// Kind of a dependency edge: whether the downstream node registered a
/// typed change handler for this input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    /// Deltas from this input are folded in by `handle_change`.
    WithHandler,
    /// Any delta from this input forces a full recompute downstream.
    RecomputeOnly,
}

/// How an iteration ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunResult {
    Completed,
    /// A node required a recompute in a read-only iteration. Caches are as
    /// they were; force-recompute is set for the next iteration.
    Canceled { node: NodeHandle },
}

#[derive(Debug)]
struct NodeSlot {
    handle: NodeHandle,
    flags: NodeFlags,
    /// Taken out while the node's own callback runs, so the callback can
    /// borrow every *other* node through the [`Context`].
    payload: Option<Box<dyn Node>>,
    /// Inputs in registration order, as the traversal consumes them.
    inputs: Vec<(daggy::NodeIndex, EdgeKind)>,
    state: NodeState,
    last_run_epoch: u64,
    last_changed_epoch: u64,
    stats: NodeStats,
}

/// The incremental engine: a registry of computation nodes in a DAG,
/// driven once per main-loop iteration.
#[derive(Debug)]
pub struct Engine {
    graph: daggy::Dag<NodeSlot, EdgeKind>,
    lookup: HashMap<NodeHandle, daggy::NodeIndex>,
    topo: Vec<daggy::NodeIndex>,
    /// Input every `may_write_southbound` node is required to take, so a
    /// writability transition re-runs the nodes holding pending writes.
    write_gate: Option<daggy::NodeIndex>,
    epoch: u64,
    force_recompute: bool,
    iterations: u64,
    canceled_iterations: u64,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            graph: daggy::Dag::new(),
            lookup: HashMap::new(),
            topo: Vec::new(),
            write_gate: None,
            epoch: 0,
            force_recompute: false,
            iterations: 0,
            canceled_iterations: 0,
        }
    }

    /// Registers a node. Panics if the handle is already registered:
    /// the graph is wired once at startup and duplicates are programmer
    /// errors.
    pub fn add_node(
        &mut self,
        handle: NodeHandle,
        flags: NodeFlags,
        payload: Box<dyn Node>,
    ) -> daggy::NodeIndex {
        let node_index = self.graph.add_node(NodeSlot {
            handle: handle.clone(),
            flags,
            payload: Some(payload),
            inputs: Vec::new(),
            state: NodeState::Stale,
            last_run_epoch: 0,
            last_changed_epoch: 0,
            stats: NodeStats::default(),
        });
        if let Some(prev) = self.lookup.insert(handle, node_index) {
            panic!("A node {prev:?} has already been inserted using specified node handle");
        }
        node_index
    }

    /// Adds a dependency edge from `from` (input) to `to` (dependent).
    pub fn connect(
        &mut self,
        from: &NodeHandle,
        to: &NodeHandle,
        kind: EdgeKind,
    ) -> Result<(), EngineError> {
        let from_index = self.node_index(from)?;
        let to_index = self.node_index(to)?;
        self.graph
            .add_edge(from_index, to_index, kind)
            .map_err(|_| EngineError::WouldCycle)?;
        self.graph[to_index].inputs.push((from_index, kind));
        Ok(())
    }

    pub fn connect_with_handler(
        &mut self,
        from: &NodeHandle,
        to: &NodeHandle,
    ) -> Result<(), EngineError> {
        self.connect(from, to, EdgeKind::WithHandler)
    }

    /// Declares the leaf that reflects southbound writability. Every node
    /// flagged `may_write_southbound` must be connected to it; `init`
    /// checks the contract.
    pub fn set_write_gate(&mut self, handle: &NodeHandle) -> Result<(), EngineError> {
        self.write_gate = Some(self.node_index(handle)?);
        Ok(())
    }

    /// Freezes the traversal order and runs every node's `init` in
    /// dependency order. Must be called once before the first `run`.
    /// Panics if a `may_write_southbound` node is not wired to the write
    /// gate: that is a graph-construction programmer error.
    pub fn init(&mut self) -> Result<(), EngineError> {
        for node in self.graph.raw_nodes() {
            let slot = &node.weight;
            if !slot.flags.may_write_southbound {
                continue;
            }
            let Some(gate) = self.write_gate else {
                panic!(
                    "node {} may write southbound but no write gate was declared",
                    slot.handle
                );
            };
            if !slot.inputs.iter().any(|(input, _)| *input == gate) {
                panic!(
                    "node {} may write southbound but has no edge from the write gate",
                    slot.handle
                );
            }
        }
        self.topo = toposort(self.graph.graph(), None)
            .expect("daggy graphs are acyclic")
            .into_iter()
            .collect();
        for i in 0..self.topo.len() {
            let idx = self.topo[i];
            let mut payload = self.take_payload(idx);
            let result = {
                let ctx = Context {
                    engine: self,
                    epoch: self.epoch,
                };
                payload.init(&ctx)
            };
            self.put_payload(idx, payload);
            result?;
        }
        info!("engine initialized with {} nodes", self.topo.len());
        Ok(())
    }

    /// Flags the next iteration as a full recompute for every node.
    pub fn trigger_recompute(&mut self, reason: &str) {
        if !self.force_recompute {
            info!("engine: forced recompute next iteration ({reason})");
        }
        self.force_recompute = true;
    }

    pub fn force_recompute_pending(&self) -> bool {
        self.force_recompute
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Drives one iteration: init-run, then topological traversal with the
    /// recompute-vs-handler strategy per node. `recompute_allowed` is false
    /// for read-only iterations (no writable transaction available).
    pub fn run(&mut self, recompute_allowed: bool) -> Result<RunResult, EngineError> {
        if self.topo.is_empty() && self.graph.node_count() > 0 {
            return Err(EngineError::NotInitialized);
        }
        self.epoch += 1;
        self.iterations += 1;
        let force = self.force_recompute;

        // Init-run: reset states, drop tracked data from last iteration.
        for i in 0..self.topo.len() {
            let idx = self.topo[i];
            let slot = &mut self.graph[idx];
            slot.state = NodeState::Stale;
            if slot.flags.clears_tracked_data {
                slot.payload
                    .as_mut()
                    .expect("payload present between iterations")
                    .clear_tracked();
            }
        }

        for i in 0..self.topo.len() {
            let idx = self.topo[i];
            match self.run_node(idx, force, recompute_allowed)? {
                NodeOutcome::Done => {}
                NodeOutcome::Canceled => {
                    let node = self.graph[idx].handle.clone();
                    debug!("engine: iteration {} canceled at {node}", self.epoch);
                    self.graph[idx].stats.cancels += 1;
                    self.canceled_iterations += 1;
                    self.force_recompute = true;
                    return Ok(RunResult::Canceled { node });
                }
            }
        }

        // The forced iteration completed; do not leak the flag.
        self.force_recompute = false;
        Ok(RunResult::Completed)
    }

    fn run_node(
        &mut self,
        idx: daggy::NodeIndex,
        force: bool,
        recompute_allowed: bool,
    ) -> Result<NodeOutcome, EngineError> {
        let (inputs, flags) = {
            let slot = &self.graph[idx];
            debug_assert_eq!(slot.state, NodeState::Stale, "node visited twice in epoch");
            (slot.inputs.clone(), slot.flags)
        };

        // Leaf adapters always run: their recompute is the cheap check of
        // the underlying replica and never writes. A node that has never
        // run has no cache for handlers to fold into.
        let never_ran = self.graph[idx].last_run_epoch == 0;
        let mut need_recompute = inputs.is_empty() || force || never_ran;
        let mut handled_inputs = Vec::new();
        for (input_index, kind) in &inputs {
            let input = &self.graph[*input_index];
            debug_assert_ne!(input.state, NodeState::Stale, "inputs precede dependents");
            if input.state == NodeState::Updated {
                match kind {
                    EdgeKind::WithHandler => handled_inputs.push(*input_index),
                    EdgeKind::RecomputeOnly => need_recompute = true,
                }
            }
        }
        if flags.has_validity_check {
            let valid = self.graph[idx]
                .payload
                .as_ref()
                .expect("payload present between iterations")
                .is_valid();
            if !valid {
                need_recompute = true;
            }
        }

        if !need_recompute && handled_inputs.is_empty() {
            // Nothing changed upstream; the cache stands.
            let slot = &mut self.graph[idx];
            slot.state = NodeState::Unchanged;
            slot.last_run_epoch = self.epoch;
            return Ok(NodeOutcome::Done);
        }

        let mut updated = false;
        if !need_recompute {
            // Handler pass; abandon to recompute on the first Unhandled.
            let mut payload = self.take_payload(idx);
            let mut outcome = Ok(HandlerOutcome::Unchanged);
            for input_index in &handled_inputs {
                let input_handle = self.graph[*input_index].handle.clone();
                let ctx = Context {
                    engine: self,
                    epoch: self.epoch,
                };
                outcome = payload.handle_change(&input_handle, &ctx);
                match &outcome {
                    Ok(HandlerOutcome::Updated) => updated = true,
                    Ok(HandlerOutcome::Unchanged) => {}
                    Ok(HandlerOutcome::Unhandled) | Err(_) => break,
                }
            }
            self.put_payload(idx, payload);
            match outcome? {
                HandlerOutcome::Unhandled => {
                    let handle = &self.graph[idx].handle;
                    debug!("engine: {handle} left a delta unhandled, recomputing");
                    need_recompute = true;
                    updated = false;
                }
                _ => {
                    self.graph[idx].stats.handled += handled_inputs.len() as u64;
                }
            }
        }

        if need_recompute {
            if !recompute_allowed && !inputs.is_empty() {
                return Ok(NodeOutcome::Canceled);
            }
            let mut payload = self.take_payload(idx);
            let result = {
                let ctx = Context {
                    engine: self,
                    epoch: self.epoch,
                };
                payload.run(&ctx)
            };
            self.put_payload(idx, payload);
            updated = result? == Change::Updated;
            self.graph[idx].stats.recompute += 1;
        }

        let epoch = self.epoch;
        let slot = &mut self.graph[idx];
        slot.last_run_epoch = epoch;
        slot.state = if updated {
            slot.last_changed_epoch = epoch;
            slot.stats.changes += 1;
            NodeState::Updated
        } else {
            NodeState::Unchanged
        };
        Ok(NodeOutcome::Done)
    }

    /// Whether the node's cache changed during the current epoch.
    pub fn node_changed(&self, handle: &NodeHandle) -> Result<bool, EngineError> {
        let slot = self.slot(handle)?;
        Ok(slot.state == NodeState::Updated && slot.last_changed_epoch == self.epoch)
    }

    pub fn node_state(&self, handle: &NodeHandle) -> Result<NodeState, EngineError> {
        Ok(self.slot(handle)?.state)
    }

    /// Typed read of a node payload, for the main loop and unixctl between
    /// iterations (and for node callbacks through [`Context`]).
    pub fn node<T: Node>(&self, handle: &NodeHandle) -> Result<&T, EngineError> {
        let slot = self.slot(handle)?;
        let payload = slot
            .payload
            .as_ref()
            .ok_or_else(|| EngineError::NodeUnavailable(handle.clone()))?;
        payload
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| EngineError::NodeTypeMismatch(handle.clone()))
    }

    /// Typed mutable access, for feeding leaf adapters outside `run`.
    pub fn node_mut<T: Node>(&mut self, handle: &NodeHandle) -> Result<&mut T, EngineError> {
        let index = self.node_index(handle)?;
        let payload = self.graph[index]
            .payload
            .as_mut()
            .ok_or_else(|| EngineError::NodeUnavailable(handle.clone()))?;
        payload
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| EngineError::NodeTypeMismatch(handle.clone()))
    }

    pub fn node_handles(&self) -> impl Iterator<Item = &NodeHandle> {
        self.graph.raw_nodes().iter().map(|node| &node.weight.handle)
    }

    pub fn node_stats(&self, handle: &NodeHandle) -> Result<NodeStats, EngineError> {
        Ok(self.slot(handle)?.stats)
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn canceled_iterations(&self) -> u64 {
        self.canceled_iterations
    }

    fn slot(&self, handle: &NodeHandle) -> Result<&NodeSlot, EngineError> {
        Ok(&self.graph[self.node_index(handle)?])
    }

    fn node_index(&self, handle: &NodeHandle) -> Result<daggy::NodeIndex, EngineError> {
        self.lookup
            .get(handle)
            .copied()
            .ok_or_else(|| EngineError::InvalidNodeHandle(handle.clone()))
    }

    fn take_payload(&mut self, idx: daggy::NodeIndex) -> Box<dyn Node> {
        self.graph[idx]
            .payload
            .take()
            .expect("payload present between iterations")
    }

    fn put_payload(&mut self, idx: daggy::NodeIndex, payload: Box<dyn Node>) {
        self.graph[idx].payload = Some(payload);
    }
}

enum NodeOutcome {
    Done,
    Canceled,
}

/// Borrow window into the engine handed to node callbacks. Reads taken
/// through it must not outlive the callback.
pub struct Context<'a> {
    engine: &'a Engine,
    epoch: u64,
}

impl<'a> Context<'a> {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Borrows another node's payload. The currently-running node is taken
    /// out of its slot and cannot be read through its own context.
    pub fn node<T: Node>(&self, handle: &NodeHandle) -> Result<&'a T, EngineError> {
        self.engine.node(handle)
    }

    /// Whether `handle` changed during this epoch.
    pub fn input_updated(&self, handle: &NodeHandle) -> Result<bool, EngineError> {
        self.engine.node_changed(handle)
    }
}
