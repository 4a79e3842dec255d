//! Address-set materialization: a local projection of the southbound
//! address-set table with a per-iteration delta precise enough for the
//! flow-output handlers to republish only affected flows.

use crate::inputs::DbTableNode;
use crate::tables::{self, sb};
use flowsync_db::RowChange;
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_types::node::NodeHandle;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

/// Content change of one surviving set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AddrSetDiff {
    pub name: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct AddrSetsTracked {
    pub new: Vec<String>,
    pub deleted: Vec<String>,
    pub updated: Vec<AddrSetDiff>,
}

impl AddrSetsTracked {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.deleted.is_empty() && self.updated.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct AddrSets {
    sets: BTreeMap<String, BTreeSet<String>>,
    tracked: Option<AddrSetsTracked>,
}

impl AddrSets {
    pub fn get(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.sets.get(name)
    }

    pub fn sets(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.sets
    }

    pub fn tracked(&self) -> Option<&AddrSetsTracked> {
        self.tracked.as_ref()
    }

    fn addresses(row: &flowsync_db::Row) -> BTreeSet<String> {
        row.str_set("addresses")
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

impl Node for AddrSets {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::ADDRESS_SET))?
            .table();
        let mut next = BTreeMap::new();
        for row in table.iter() {
            if let Some(name) = row.str("name") {
                next.insert(name.to_string(), Self::addresses(row));
            }
        }
        let changed = next != self.sets;
        self.sets = next;
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
            .node::<DbTableNode>(&tables::sb_node(sb::ADDRESS_SET))?
            .table();
        let mut tracked = AddrSetsTracked::default();
        for t in table.tracked() {
            let Some(name) = t.row.str("name") else {
                continue;
            };
            match t.change {
                RowChange::New => {
                    self.sets.insert(name.to_string(), Self::addresses(&t.row));
                    tracked.new.push(name.to_string());
                }
                RowChange::Deleted => {
                    self.sets.remove(name);
                    tracked.deleted.push(name.to_string());
                }
                RowChange::Updated => {
                    if t.column_updated("name") {
                        // Renames are effectively delete+create of a
                        // different set; recompute covers that rarity.
                        return Ok(HandlerOutcome::Unhandled);
                    }
                    let next = Self::addresses(&t.row);
                    let prev = self.sets.get(name).cloned().unwrap_or_default();
                    let diff = AddrSetDiff {
                        name: name.to_string(),
                        added: next.difference(&prev).cloned().collect(),
                        removed: prev.difference(&next).cloned().collect(),
                    };
                    self.sets.insert(name.to_string(), next);
                    if !diff.added.is_empty() || !diff.removed.is_empty() {
                        tracked.updated.push(diff);
                    }
                }
            }
        }
        let changed = !tracked.is_empty();
        self.tracked = Some(tracked);
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
