//! Load-balancer materialization: southbound load-balancer rows parsed
//! into VIP/backend form with template variables resolved, plus a
//! dependency manager so a template change republishes only the load
//! balancers that consumed it.

use crate::handles;
use crate::inputs::DbTableNode;
use crate::objdep::ObjDepMgr;
use crate::tables::{self, sb};
use crate::template_vars::TemplateVars;
use flowsync_db::{Row, RowChange};
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_types::node::NodeHandle;
use flowsync_types::uuid::Uuid;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq)]
pub struct LoadBalancer {
    pub uuid: Uuid,
    pub name: String,
    pub protocol: String,
    /// VIP endpoint -> backend endpoints, template-expanded.
    pub vips: BTreeMap<String, Vec<String>>,
    pub datapaths: BTreeSet<Uuid>,
}

#[derive(Clone, Debug, Default)]
pub struct LbTracked {
    pub new: Vec<Uuid>,
    pub updated: Vec<Uuid>,
    pub deleted: Vec<Uuid>,
}

impl LbTracked {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct LbData {
    lbs: BTreeMap<Uuid, LoadBalancer>,
    deps: ObjDepMgr,
    tracked: Option<LbTracked>,
}

fn template_refs(raw: &str, vars: &TemplateVars) -> Vec<String> {
    vars.vars()
        .keys()
        .filter(|name| raw.contains(&format!("${{{name}}}")))
        .map(|name| format!("tv:{name}"))
        .collect()
}

impl LbData {
    pub fn get(&self, uuid: &Uuid) -> Option<&LoadBalancer> {
        self.lbs.get(uuid)
    }

    pub fn load_balancers(&self) -> impl Iterator<Item = &LoadBalancer> {
        self.lbs.values()
    }

    pub fn tracked(&self) -> Option<&LbTracked> {
        self.tracked.as_ref()
    }

    fn materialize(&mut self, row: &Row, vars: &TemplateVars) -> LoadBalancer {
        let mut refs: Vec<String> = Vec::new();
        let mut vips = BTreeMap::new();
        for (vip, backends) in row.map_iter("vips") {
            let backends = backends.as_str().unwrap_or("");
            refs.extend(template_refs(vip, vars));
            refs.extend(template_refs(backends, vars));
            let vip = vars.expand(vip);
            let backends = backends
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(|b| vars.expand(b))
                .collect();
            vips.insert(vip, backends);
        }
        self.deps.record(row.uuid(), refs);
        LoadBalancer {
            uuid: row.uuid(),
            name: row.str("name").unwrap_or("").to_string(),
            protocol: row.str("protocol").unwrap_or("tcp").to_string(),
            vips,
            datapaths: row.uuid_set("datapaths").into_iter().collect(),
        }
    }
}

impl Node for LbData {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let vars = ctx.node::<TemplateVars>(&handles::template_vars())?;
        let table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::LOAD_BALANCER))?
            .table();
        self.deps.clear();
        let mut next = BTreeMap::new();
        for row in table.iter() {
            next.insert(row.uuid(), self.materialize(row, vars));
        }
        let changed = next != self.lbs;
        self.lbs = next;
        self.tracked = None;
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
        let vars = ctx.node::<TemplateVars>(&handles::template_vars())?;
        let table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::LOAD_BALANCER))?
            .table();
        let mut tracked = match self.tracked.take() {
            Some(tracked) => tracked,
            None => LbTracked::default(),
        };

        if *input == handles::template_vars() {
            let Some(changed_vars) = vars.tracked() else {
                self.tracked = Some(tracked);
                return Ok(HandlerOutcome::Unhandled);
            };
            let mut affected: BTreeSet<Uuid> = BTreeSet::new();
            for name in changed_vars {
                affected.extend(self.deps.objects_for(&format!("tv:{name}")));
            }
            for uuid in affected {
                if let Some(row) = table.get(&uuid) {
                    let row = row.clone();
                    let lb = self.materialize(&row, vars);
                    if self.lbs.insert(uuid, lb).is_some() {
                        tracked.updated.push(uuid);
                    } else {
                        tracked.new.push(uuid);
                    }
                }
            }
        } else {
            for t in table.tracked() {
                match t.change {
                    RowChange::Deleted => {
                        self.lbs.remove(&t.uuid());
                        self.deps.remove_object(&t.uuid());
                        tracked.deleted.push(t.uuid());
                    }
                    RowChange::New => {
                        let lb = self.materialize(&t.row, vars);
                        self.lbs.insert(t.uuid(), lb);
                        tracked.new.push(t.uuid());
                    }
                    RowChange::Updated => {
                        let lb = self.materialize(&t.row, vars);
                        self.lbs.insert(t.uuid(), lb);
                        tracked.updated.push(t.uuid());
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
