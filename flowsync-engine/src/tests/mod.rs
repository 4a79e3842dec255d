use crate::engine::{Context, EdgeKind, Engine, RunResult};
use crate::errors::EngineError;
use crate::node::{Change, HandlerOutcome, Node, NodeFlags, NodeState};
use flowsync_types::chk;
use flowsync_types::node::NodeHandle;
use std::any::Any;

/// Leaf standing in for an input adapter: deltas are queued from outside
/// the engine and folded in when the leaf runs, leaving tracked data for
/// downstream handlers.
#[derive(Debug, Default)]
struct ValueNode {
    value: i64,
    pending: Vec<i64>,
    tracked: Vec<i64>,
}

impl Node for ValueNode {
    fn run(&mut self, _ctx: &Context) -> Result<Change, EngineError> {
        if self.pending.is_empty() {
            return Ok(Change::Unchanged);
        }
        for delta in self.pending.drain(..) {
            self.value += delta;
            self.tracked.push(delta);
        }
        Ok(Change::Updated)
    }

    fn clear_tracked(&mut self) {
        self.tracked.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Derived node summing its inputs, with an incremental handler that folds
/// tracked deltas. `refuse_handler` turns every delta into Unhandled.
#[derive(Debug)]
struct SumNode {
    inputs: Vec<NodeHandle>,
    total: i64,
    recomputes: u64,
    handled: u64,
    refuse_handler: bool,
    valid: bool,
}

impl SumNode {
    fn new(inputs: Vec<NodeHandle>) -> Self {
        Self {
            inputs,
            total: 0,
            recomputes: 0,
            handled: 0,
            refuse_handler: false,
            valid: true,
        }
    }
}

impl Node for SumNode {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        self.recomputes += 1;
        self.valid = true;
        let mut total = 0;
        for input in &self.inputs {
            total += ctx.node::<ValueNode>(input)?.value;
        }
        let changed = total != self.total;
        self.total = total;
        Ok(if changed {
            Change::Updated
        } else {
            Change::Unchanged
        })
    }

    fn handle_change(
        &mut self,
        input: &NodeHandle,
        ctx: &Context,
    ) -> Result<HandlerOutcome, EngineError> {
        if self.refuse_handler {
            return Ok(HandlerOutcome::Unhandled);
        }
        self.handled += 1;
        let tracked = &ctx.node::<ValueNode>(input)?.tracked;
        if tracked.is_empty() {
            return Ok(HandlerOutcome::Unchanged);
        }
        self.total += tracked.iter().sum::<i64>();
        Ok(HandlerOutcome::Updated)
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn two_leaf_engine(sum_flags: NodeFlags) -> (Engine, NodeHandle, NodeHandle, NodeHandle) {
    let a = NodeHandle::new("leaf-a");
    let b = NodeHandle::new("leaf-b");
    let sum = NodeHandle::new("sum");
    let mut engine = Engine::new();
    engine.add_node(
        a.clone(),
        NodeFlags::clears_tracked(),
        Box::new(ValueNode::default()),
    );
    engine.add_node(
        b.clone(),
        NodeFlags::clears_tracked(),
        Box::new(ValueNode::default()),
    );
    engine.add_node(
        sum.clone(),
        sum_flags,
        Box::new(SumNode::new(vec![a.clone(), b.clone()])),
    );
    chk!(engine.connect_with_handler(&a, &sum));
    chk!(engine.connect_with_handler(&b, &sum));
    chk!(engine.init());
    (engine, a, b, sum)
}

fn push_delta(engine: &mut Engine, leaf: &NodeHandle, delta: i64) {
    chk!(engine.node_mut::<ValueNode>(leaf)).pending.push(delta);
}

#[test]
fn test_initial_run_recomputes_then_idempotent() {
    let (mut engine, a, _b, sum) = two_leaf_engine(NodeFlags::default());
    push_delta(&mut engine, &a, 3);
    assert_eq!(chk!(engine.run(true)), RunResult::Completed);
    assert_eq!(chk!(engine.node::<SumNode>(&sum)).total, 3);
    // First visit of a node with updated inputs recomputes (nothing cached).
    assert_eq!(chk!(engine.node::<SumNode>(&sum)).recomputes, 1);
    assert!(chk!(engine.node_changed(&sum)));

    // No input changes: second run touches nothing and reports no change.
    assert_eq!(chk!(engine.run(true)), RunResult::Completed);
    assert_eq!(chk!(engine.node::<SumNode>(&sum)).recomputes, 1);
    assert!(!chk!(engine.node_changed(&sum)));
    assert_eq!(chk!(engine.node_state(&sum)), NodeState::Unchanged);
}

#[test]
fn test_handler_folds_delta_without_recompute() {
    let (mut engine, a, b, sum) = two_leaf_engine(NodeFlags::default());
    push_delta(&mut engine, &a, 3);
    chk!(engine.run(true));

    push_delta(&mut engine, &a, 2);
    push_delta(&mut engine, &b, 5);
    chk!(engine.run(true));
    let node = chk!(engine.node::<SumNode>(&sum));
    assert_eq!(node.total, 10);
    assert_eq!(node.recomputes, 1, "handlers must not trigger recompute");
    assert_eq!(node.handled, 2);
    assert!(chk!(engine.node_changed(&sum)));
}

#[test]
fn test_unhandled_falls_back_to_recompute() {
    let (mut engine, a, _b, sum) = two_leaf_engine(NodeFlags::default());
    chk!(engine.run(true));
    chk!(engine.node_mut::<SumNode>(&sum)).refuse_handler = true;

    push_delta(&mut engine, &a, 7);
    chk!(engine.run(true));
    let node = chk!(engine.node::<SumNode>(&sum));
    assert_eq!(node.total, 7);
    assert_eq!(node.recomputes, 2);
}

#[test]
fn test_recompute_only_edge_forces_recompute() {
    let a = NodeHandle::new("leaf-a");
    let sum = NodeHandle::new("sum");
    let mut engine = Engine::new();
    engine.add_node(
        a.clone(),
        NodeFlags::clears_tracked(),
        Box::new(ValueNode::default()),
    );
    engine.add_node(
        sum.clone(),
        NodeFlags::default(),
        Box::new(SumNode::new(vec![a.clone()])),
    );
    chk!(engine.connect(&a, &sum, EdgeKind::RecomputeOnly));
    chk!(engine.init());
    chk!(engine.run(true));

    push_delta(&mut engine, &a, 1);
    chk!(engine.run(true));
    let node = chk!(engine.node::<SumNode>(&sum));
    assert_eq!(node.recomputes, 2);
    assert_eq!(node.handled, 0);
}

#[test]
fn test_force_recompute_bypasses_handlers_once() {
    let (mut engine, a, _b, sum) = two_leaf_engine(NodeFlags::default());
    chk!(engine.run(true));
    engine.trigger_recompute("test");
    push_delta(&mut engine, &a, 1);
    chk!(engine.run(true));
    let node = chk!(engine.node::<SumNode>(&sum));
    assert_eq!(node.recomputes, 2);
    assert_eq!(node.handled, 0);
    assert!(!engine.force_recompute_pending(), "flag consumed on completion");

    // The following iteration is incremental again.
    push_delta(&mut engine, &a, 1);
    chk!(engine.run(true));
    assert_eq!(chk!(engine.node::<SumNode>(&sum)).recomputes, 2);
}

#[test]
fn test_readonly_iteration_cancels_and_recovers() {
    let (mut engine, a, _b, sum) = two_leaf_engine(NodeFlags::default());
    chk!(engine.run(true));
    chk!(engine.node_mut::<SumNode>(&sum)).refuse_handler = true;
    push_delta(&mut engine, &a, 4);

    // Read-only: the unhandled delta needs a recompute, so the iteration
    // is abandoned and the cache keeps its old contents.
    let result = chk!(engine.run(false));
    assert_eq!(result, RunResult::Canceled { node: sum.clone() });
    assert_eq!(chk!(engine.node::<SumNode>(&sum)).total, 0);
    assert!(engine.force_recompute_pending());

    // Next writable iteration drains the recompute in one pass.
    chk!(engine.node_mut::<SumNode>(&sum)).refuse_handler = false;
    assert_eq!(chk!(engine.run(true)), RunResult::Completed);
    assert_eq!(chk!(engine.node::<SumNode>(&sum)).total, 4);
}

#[test]
fn test_leaves_still_run_in_readonly_iterations() {
    let (mut engine, a, _b, _sum) = two_leaf_engine(NodeFlags::default());
    chk!(engine.run(true));
    push_delta(&mut engine, &a, 2);
    // Handlers cover the delta, so a read-only iteration completes.
    assert_eq!(chk!(engine.run(false)), RunResult::Completed);
    assert_eq!(chk!(engine.node::<ValueNode>(&a)).value, 2);
}

#[test]
fn test_invalid_node_recomputes_without_input_changes() {
    let (mut engine, _a, _b, sum) = two_leaf_engine(NodeFlags {
        has_validity_check: true,
        ..Default::default()
    });
    chk!(engine.run(true));
    chk!(engine.node_mut::<SumNode>(&sum)).valid = false;
    chk!(engine.run(true));
    assert_eq!(chk!(engine.node::<SumNode>(&sum)).recomputes, 2);
}

#[test]
fn test_tracked_data_cleared_each_iteration() {
    let (mut engine, a, _b, _sum) = two_leaf_engine(NodeFlags::default());
    push_delta(&mut engine, &a, 1);
    chk!(engine.run(true));
    assert_eq!(chk!(engine.node::<ValueNode>(&a)).tracked, vec![1]);
    chk!(engine.run(true));
    assert!(chk!(engine.node::<ValueNode>(&a)).tracked.is_empty());
}

#[test]
fn test_handler_matches_recompute() {
    // Handler soundness: folding deltas incrementally must land on the
    // same cache as a forced recompute over the same inputs.
    let (mut engine, a, b, sum) = two_leaf_engine(NodeFlags::default());
    chk!(engine.run(true));
    for (leaf, delta) in [(&a, 5), (&b, -2), (&a, 9), (&b, 1)] {
        push_delta(&mut engine, leaf, delta);
        chk!(engine.run(true));
    }
    let incremental = chk!(engine.node::<SumNode>(&sum)).total;
    engine.trigger_recompute("equivalence check");
    chk!(engine.run(true));
    assert_eq!(chk!(engine.node::<SumNode>(&sum)).total, incremental);
}

#[test]
#[should_panic(expected = "already been inserted")]
fn test_duplicate_handle_panics() {
    let mut engine = Engine::new();
    engine.add_node(
        NodeHandle::new("dup"),
        NodeFlags::default(),
        Box::new(ValueNode::default()),
    );
    engine.add_node(
        NodeHandle::new("dup"),
        NodeFlags::default(),
        Box::new(ValueNode::default()),
    );
}

#[test]
#[should_panic(expected = "no write gate was declared")]
fn test_writer_without_gate_panics_at_init() {
    let leaf = NodeHandle::new("leaf");
    let writer = NodeHandle::new("writer");
    let mut engine = Engine::new();
    engine.add_node(
        leaf.clone(),
        NodeFlags::default(),
        Box::new(ValueNode::default()),
    );
    engine.add_node(
        writer.clone(),
        NodeFlags::writes_southbound(),
        Box::new(SumNode::new(vec![leaf.clone()])),
    );
    chk!(engine.connect_with_handler(&leaf, &writer));
    let _ = engine.init();
}

#[test]
#[should_panic(expected = "no edge from the write gate")]
fn test_writer_not_wired_to_gate_panics_at_init() {
    let leaf = NodeHandle::new("leaf");
    let gate = NodeHandle::new("gate");
    let writer = NodeHandle::new("writer");
    let mut engine = Engine::new();
    engine.add_node(
        leaf.clone(),
        NodeFlags::default(),
        Box::new(ValueNode::default()),
    );
    engine.add_node(
        gate.clone(),
        NodeFlags::default(),
        Box::new(ValueNode::default()),
    );
    engine.add_node(
        writer.clone(),
        NodeFlags::writes_southbound(),
        Box::new(SumNode::new(vec![leaf.clone()])),
    );
    chk!(engine.connect_with_handler(&leaf, &writer));
    chk!(engine.set_write_gate(&gate));
    let _ = engine.init();
}

#[test]
fn test_writer_wired_to_gate_initializes() {
    let gate = NodeHandle::new("gate");
    let writer = NodeHandle::new("writer");
    let mut engine = Engine::new();
    engine.add_node(
        gate.clone(),
        NodeFlags::default(),
        Box::new(ValueNode::default()),
    );
    engine.add_node(
        writer.clone(),
        NodeFlags::writes_southbound(),
        Box::new(SumNode::new(vec![gate.clone()])),
    );
    chk!(engine.connect_with_handler(&gate, &writer));
    chk!(engine.set_write_gate(&gate));
    chk!(engine.init());
    assert_eq!(chk!(engine.run(true)), RunResult::Completed);
}

#[test]
fn test_cycle_is_rejected() {
    let a = NodeHandle::new("a");
    let b = NodeHandle::new("b");
    let mut engine = Engine::new();
    engine.add_node(a.clone(), NodeFlags::default(), Box::new(ValueNode::default()));
    engine.add_node(b.clone(), NodeFlags::default(), Box::new(ValueNode::default()));
    chk!(engine.connect_with_handler(&a, &b));
    assert!(matches!(
        engine.connect_with_handler(&b, &a),
        Err(EngineError::WouldCycle)
    ));
}
