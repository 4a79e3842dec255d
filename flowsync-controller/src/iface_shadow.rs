//! Shadow of the virtual-switch interface table. The raw tracked delta
//! only carries new images; binding decisions need the *previous*
//! `external_ids:iface-id` to know which logical port an interface stopped
//! advertising, so this node keeps the old values and emits a diffed delta
//! of its own.

use crate::inputs::DbTableNode;
use crate::tables::{self, ovs};
use flowsync_db::RowChange;
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_types::node::NodeHandle;
use flowsync_types::uuid::Uuid;
use std::any::Any;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub struct IfaceRec {
    pub uuid: Uuid,
    /// Logical port advertised via `external_ids:iface-id`, if any.
    pub iface_id: Option<String>,
    pub ofport: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct IfaceChange {
    pub name: String,
    pub old: Option<IfaceRec>,
    pub new: Option<IfaceRec>,
}

#[derive(Debug, Default)]
pub struct IfaceShadow {
    ifaces: BTreeMap<String, IfaceRec>,
    /// Per-iteration diff; `None` after a full recompute, which tells
    /// dependents their own handler cannot proceed incrementally.
    tracked: Option<Vec<IfaceChange>>,
}

impl IfaceShadow {
    pub fn ifaces(&self) -> &BTreeMap<String, IfaceRec> {
        &self.ifaces
    }

    pub fn tracked(&self) -> Option<&[IfaceChange]> {
        self.tracked.as_deref()
    }

    /// Interface record advertising `iface_id`, if exactly one does.
    pub fn by_iface_id(&self, iface_id: &str) -> Option<(&str, &IfaceRec)> {
        self.ifaces
            .iter()
            .find(|(_, rec)| rec.iface_id.as_deref() == Some(iface_id))
            .map(|(name, rec)| (name.as_str(), rec))
    }

    fn rec_of(row: &flowsync_db::Row) -> IfaceRec {
        IfaceRec {
            uuid: row.uuid(),
            iface_id: row
                .smap_get("external_ids", "iface-id")
                .map(str::to_string),
            ofport: row.integer("ofport").filter(|p| *p > 0),
        }
    }
}

impl Node for IfaceShadow {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let table = ctx
            .node::<DbTableNode>(&tables::ovs_node(ovs::INTERFACE))?
            .table();
        let mut next = BTreeMap::new();
        for row in table.iter() {
            let Some(name) = row.str("name") else {
                continue;
            };
            next.insert(name.to_string(), Self::rec_of(row));
        }
        let changed = next != self.ifaces;
        self.ifaces = next;
        self.tracked = None;
        Ok(if changed {
            Change::Updated
        } else {
            Change::Unchanged
        })
    }

    fn handle_change(
        &mut self,
        _input: &NodeHandle,
        ctx: &Context,
    ) -> Result<HandlerOutcome, EngineError> {
        let table = ctx
            .node::<DbTableNode>(&tables::ovs_node(ovs::INTERFACE))?
            .table();
        let mut changes = Vec::new();
        for t in table.tracked() {
            let Some(name) = t.row.str("name") else {
                continue;
            };
            let old = self.ifaces.get(name).cloned();
            let new = match t.change {
                RowChange::Deleted => None,
                RowChange::New | RowChange::Updated => Some(Self::rec_of(&t.row)),
            };
            if old == new {
                continue;
            }
            match &new {
                Some(rec) => {
                    self.ifaces.insert(name.to_string(), rec.clone());
                }
                None => {
                    self.ifaces.remove(name);
                }
            }
            changes.push(IfaceChange {
                name: name.to_string(),
                old,
                new,
            });
        }
        if changes.is_empty() {
            self.tracked = Some(Vec::new());
            return Ok(HandlerOutcome::Unchanged);
        }
        self.tracked = Some(changes);
        Ok(HandlerOutcome::Updated)
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
