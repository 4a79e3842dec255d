//! Leaf nodes of the engine graph: per-table database adapters and the
//! small externally-fed signal/queue inputs (southbound writability,
//! OpenFlow liveness, active tunnels, activated ports, netlink events).

use crate::tables;
use flowsync_db::{DbError, Table, TableSink};
use flowsync_engine::{Change, Context, EngineError, Node};
use std::any::Any;
use std::fmt::Debug;

/// Leaf adapter wrapping one monitored table. The session layer applies
/// row changes into `table` between iterations; the node reports Updated
/// when the content sequence moved. Tracked data is consumed by downstream
/// handlers during the iteration and cleared by the main loop at its end.
#[derive(Debug)]
pub struct DbTableNode {
    table: Table,
    last_seq: u64,
}

impl DbTableNode {
    pub fn new(name: &str) -> Self {
        let mut table = Table::new(name);
        tables::register_indexes(&mut table);
        Self { table, last_seq: 0 }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut Table {
        &mut self.table
    }
}

impl Node for DbTableNode {
    fn run(&mut self, _ctx: &Context) -> Result<Change, EngineError> {
        let seq = self.table.seq();
        let changed = seq != self.last_seq;
        self.last_seq = seq;
        Ok(if changed {
            Change::Updated
        } else {
            Change::Unchanged
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Externally-fed scalar input: the main loop sets the value between
/// iterations; the node reports Updated when it moved. Used for the
/// southbound read-only gate, OpenFlow liveness and the active tunnel set.
#[derive(Debug)]
pub struct SignalNode<T: Debug + PartialEq + 'static> {
    value: T,
    dirty: bool,
}

impl<T: Debug + PartialEq + 'static> SignalNode<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    pub fn set(&mut self, value: T) {
        if self.value != value {
            self.value = value;
            self.dirty = true;
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }
}

impl<T: Debug + PartialEq + 'static> Node for SignalNode<T> {
    fn run(&mut self, _ctx: &Context) -> Result<Change, EngineError> {
        Ok(if std::mem::take(&mut self.dirty) {
            Change::Updated
        } else {
            Change::Unchanged
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Externally-fed queue input: items pushed between iterations become the
/// visible batch of exactly one iteration (activated ports, netlink
/// notifications). The engine clears the batch at the next init-run.
#[derive(Debug)]
pub struct QueueNode<T: Debug + 'static> {
    pending: Vec<T>,
    current: Vec<T>,
}

impl<T: Debug + 'static> QueueNode<T> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            current: Vec::new(),
        }
    }

    pub fn push(&mut self, item: T) {
        self.pending.push(item);
    }

    /// The batch visible during the current iteration.
    pub fn current(&self) -> &[T] {
        &self.current
    }
}

impl<T: Debug + 'static> Default for QueueNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug + 'static> Node for QueueNode<T> {
    fn run(&mut self, _ctx: &Context) -> Result<Change, EngineError> {
        if self.pending.is_empty() {
            return Ok(Change::Unchanged);
        }
        self.current.append(&mut self.pending);
        Ok(Change::Updated)
    }

    fn clear_tracked(&mut self) {
        self.current.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Routes session messages into the leaf adapters that own the tables.
/// Constructed around the engine for the duration of one drain.
pub struct EngineTableSink<'a> {
    engine: &'a mut flowsync_engine::Engine,
    node_for: fn(&str) -> flowsync_types::node::NodeHandle,
}

impl<'a> EngineTableSink<'a> {
    pub fn southbound(engine: &'a mut flowsync_engine::Engine) -> Self {
        Self {
            engine,
            node_for: tables::sb_node,
        }
    }

    pub fn vswitch(engine: &'a mut flowsync_engine::Engine) -> Self {
        Self {
            engine,
            node_for: tables::ovs_node,
        }
    }
}

impl TableSink for EngineTableSink<'_> {
    fn sink_table_mut(&mut self, name: &str) -> Result<&mut Table, DbError> {
        let handle = (self.node_for)(name);
        let node = self
            .engine
            .node_mut::<DbTableNode>(&handle)
            .map_err(|_| DbError::UnknownTable(name.to_string()))?;
        Ok(node.table_mut())
    }
}
