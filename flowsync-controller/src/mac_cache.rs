//! MAC/FDB cache: projections of the dynamic MAC-binding, static
//! MAC-binding and FDB tables, with a row-level delta for the flow output
//! handlers. Static bindings shadow dynamic ones for the same (port, ip).

use crate::inputs::DbTableNode;
use crate::tables::{self, sb};
use flowsync_db::{Row, RowChange};
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_types::node::NodeHandle;
use flowsync_types::uuid::Uuid;
use std::any::Any;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacRowKind {
    Dynamic,
    Static,
    Fdb,
}

#[derive(Clone, Debug)]
pub struct MacEvent {
    pub uuid: Uuid,
    pub kind: MacRowKind,
    pub change: RowChange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MacEntry {
    pub uuid: Uuid,
    pub mac: String,
    pub datapath: Option<Uuid>,
    pub is_static: bool,
}

#[derive(Debug, Default)]
pub struct MacCache {
    /// (logical port, ip) -> mac, dynamic and static merged.
    bindings: BTreeMap<(String, String), MacEntry>,
    /// (datapath tunnel key, mac) -> port tunnel key.
    fdb: BTreeMap<(i64, String), i64>,
    tracked: Option<Vec<MacEvent>>,
}

impl MacCache {
    pub fn lookup(&self, lport: &str, ip: &str) -> Option<&MacEntry> {
        self.bindings.get(&(lport.to_string(), ip.to_string()))
    }

    pub fn bindings(&self) -> &BTreeMap<(String, String), MacEntry> {
        &self.bindings
    }

    pub fn fdb(&self) -> &BTreeMap<(i64, String), i64> {
        &self.fdb
    }

    pub fn tracked(&self) -> Option<&[MacEvent]> {
        self.tracked.as_deref()
    }

    fn binding_key(row: &Row) -> Option<(String, String)> {
        Some((
            row.str("logical_port")?.to_string(),
            row.str("ip")?.to_string(),
        ))
    }

    fn insert_binding(&mut self, row: &Row, is_static: bool) {
        let Some(key) = Self::binding_key(row) else {
            return;
        };
        let Some(mac) = row.str("mac") else {
            return;
        };
        let entry = MacEntry {
            uuid: row.uuid(),
            mac: mac.to_string(),
            datapath: row.uuid_col("datapath"),
            is_static,
        };
        match self.bindings.get(&key) {
            // A dynamic binding never displaces a static one unless the
            // static row allows it.
            Some(existing) if existing.is_static && !is_static => {}
            _ => {
                self.bindings.insert(key, entry);
            }
        }
    }

    fn remove_binding(&mut self, row: &Row) {
        if let Some(key) = Self::binding_key(row) {
            if self
                .bindings
                .get(&key)
                .is_some_and(|e| e.uuid == row.uuid())
            {
                self.bindings.remove(&key);
            }
        }
    }

    fn fold(&mut self, kind: MacRowKind, change: RowChange, row: &Row) {
        match kind {
            MacRowKind::Dynamic | MacRowKind::Static => match change {
                RowChange::Deleted => self.remove_binding(row),
                RowChange::New | RowChange::Updated => {
                    self.insert_binding(row, kind == MacRowKind::Static)
                }
            },
            MacRowKind::Fdb => {
                let key = (
                    row.integer("dp_key").unwrap_or(0),
                    row.str("mac").unwrap_or("").to_string(),
                );
                match change {
                    RowChange::Deleted => {
                        self.fdb.remove(&key);
                    }
                    RowChange::New | RowChange::Updated => {
                        self.fdb.insert(key, row.integer("port_key").unwrap_or(0));
                    }
                }
            }
        }
    }

    fn kind_of(input: &NodeHandle) -> Option<MacRowKind> {
        if *input == tables::sb_node(sb::MAC_BINDING) {
            Some(MacRowKind::Dynamic)
        } else if *input == tables::sb_node(sb::STATIC_MAC_BINDING) {
            Some(MacRowKind::Static)
        } else if *input == tables::sb_node(sb::FDB) {
            Some(MacRowKind::Fdb)
        } else {
            None
        }
    }

    fn table_of(kind: MacRowKind) -> &'static str {
        match kind {
            MacRowKind::Dynamic => sb::MAC_BINDING,
            MacRowKind::Static => sb::STATIC_MAC_BINDING,
            MacRowKind::Fdb => sb::FDB,
        }
    }
}

impl Node for MacCache {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let prev_bindings = std::mem::take(&mut self.bindings);
        let prev_fdb = std::mem::take(&mut self.fdb);
        // Static bindings folded last so they take precedence.
        for kind in [MacRowKind::Dynamic, MacRowKind::Fdb, MacRowKind::Static] {
            let table = ctx
                .node::<DbTableNode>(&tables::sb_node(Self::table_of(kind)))?
                .table();
            for row in table.iter() {
                self.fold(kind, RowChange::New, row);
            }
        }
        self.tracked = None;
        Ok(
            if prev_bindings != self.bindings || prev_fdb != self.fdb {
                Change::Updated
            } else {
                Change::Unchanged
            },
        )
    }

    fn handle_change(
        &mut self,
        input: &NodeHandle,
        ctx: &Context,
    ) -> Result<HandlerOutcome, EngineError> {
        let Some(kind) = Self::kind_of(input) else {
            return Ok(HandlerOutcome::Unhandled);
        };
        let table = ctx
            .node::<DbTableNode>(&tables::sb_node(Self::table_of(kind)))?
            .table();
        let mut events = self.tracked.take().unwrap_or_default();
        let mut changed = false;
        for t in table.tracked() {
            self.fold(kind, t.change, &t.row);
            events.push(MacEvent {
                uuid: t.uuid(),
                kind,
                change: t.change,
            });
            changed = true;
        }
        self.tracked = Some(events);
        Ok(if changed {
            HandlerOutcome::Updated
        } else {
            HandlerOutcome::Unchanged
        })
    }

    fn clear_tracked(&mut self) {
        self.tracked = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
