//! Port-group materialization, the port-name analogue of the address-set
//! projection.

use crate::inputs::DbTableNode;
use crate::tables::{self, sb};
use flowsync_db::RowChange;
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_types::node::NodeHandle;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PortGroupDiff {
    pub name: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PortGroupsTracked {
    pub new: Vec<String>,
    pub deleted: Vec<String>,
    pub updated: Vec<PortGroupDiff>,
}

impl PortGroupsTracked {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.deleted.is_empty() && self.updated.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PortGroups {
    groups: BTreeMap<String, BTreeSet<String>>,
    tracked: Option<PortGroupsTracked>,
}

impl PortGroups {
    pub fn get(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.groups
    }

    pub fn tracked(&self) -> Option<&PortGroupsTracked> {
        self.tracked.as_ref()
    }

    fn ports(row: &flowsync_db::Row) -> BTreeSet<String> {
        row.str_set("ports").into_iter().map(str::to_string).collect()
    }
}

impl Node for PortGroups {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::PORT_GROUP))?
            .table();
        let mut next = BTreeMap::new();
        for row in table.iter() {
            if let Some(name) = row.str("name") {
                next.insert(name.to_string(), Self::ports(row));
            }
        }
        let changed = next != self.groups;
        self.groups = next;
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
            .node::<DbTableNode>(&tables::sb_node(sb::PORT_GROUP))?
            .table();
        let mut tracked = PortGroupsTracked::default();
        for t in table.tracked() {
            let Some(name) = t.row.str("name") else {
                continue;
            };
            match t.change {
                RowChange::New => {
                    self.groups.insert(name.to_string(), Self::ports(&t.row));
                    tracked.new.push(name.to_string());
                }
                RowChange::Deleted => {
                    self.groups.remove(name);
                    tracked.deleted.push(name.to_string());
                }
                RowChange::Updated => {
                    if t.column_updated("name") {
                        return Ok(HandlerOutcome::Unhandled);
                    }
                    let next = Self::ports(&t.row);
                    let prev = self.groups.get(name).cloned().unwrap_or_default();
                    let diff = PortGroupDiff {
                        name: name.to_string(),
                        added: next.difference(&prev).cloned().collect(),
                        removed: prev.difference(&next).cloned().collect(),
                    };
                    self.groups.insert(name.to_string(), next);
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
