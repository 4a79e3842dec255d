//! ACL id projection: stable numeric ids assigned cluster-wide to ACL
//! names, used by sampling actions.

use crate::inputs::DbTableNode;
use crate::tables::{self, sb};
use flowsync_engine::{Change, Context, EngineError, Node};
use std::any::Any;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct AclIds {
    ids: BTreeMap<String, i64>,
}

impl AclIds {
    pub fn get(&self, name: &str) -> Option<i64> {
        self.ids.get(name).copied()
    }

    pub fn ids(&self) -> &BTreeMap<String, i64> {
        &self.ids
    }
}

impl Node for AclIds {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::ACL_ID))?
            .table();
        let mut next = BTreeMap::new();
        for row in table.iter() {
            if let (Some(name), Some(id)) = (row.str("name"), row.integer("id")) {
                next.insert(name.to_string(), id);
            }
        }
        let changed = next != self.ids;
        self.ids = next;
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
