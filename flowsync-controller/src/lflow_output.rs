//! Logical-flow output node: translates the logical-flow table (plus load
//! balancers, MAC/FDB caches and multicast groups) into the desired
//! OpenFlow rule set for the local datapaths, incrementally wherever a
//! handler can fold the delta, with a bounded translation cache.

use crate::addr_sets::AddrSets;
use crate::handles;
use crate::inputs::DbTableNode;
use crate::lb_data::{LbData, LoadBalancer};
use crate::lflow_cache::{CachedFlow, LflowCache, LflowCacheStats};
use crate::mac_cache::{MacCache, MacRowKind};
use crate::objdep::ObjDepMgr;
use crate::port_groups::PortGroups;
use crate::runtime_data::RuntimeData;
use crate::tables::{self, index, sb};
use crate::template_vars::TemplateVars;
use crate::translate;
use flowsync_db::{Row, RowChange, Table};
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_ofctrl::{DesiredFlowTable, ExtendTable, FlowKey, OfConn, OfError};
use flowsync_types::node::NodeHandle;
use flowsync_types::uuid::Uuid;
use std::any::Any;
use std::collections::BTreeSet;

/// Everything the translation reads, borrowed from the engine registry for
/// the duration of one callback.
struct Inputs<'a> {
    rt: &'a RuntimeData,
    addr_sets: &'a AddrSets,
    port_groups: &'a PortGroups,
    template_vars: &'a TemplateVars,
    lb_data: &'a LbData,
    mac_cache: &'a MacCache,
    lflow_table: &'a Table,
    dp_group_table: &'a Table,
    mg_table: &'a Table,
    mac_binding_table: &'a Table,
    static_mac_table: &'a Table,
    fdb_table: &'a Table,
}

fn gather<'a>(ctx: &Context<'a>) -> Result<Inputs<'a>, EngineError> {
    Ok(Inputs {
        rt: ctx.node::<RuntimeData>(&handles::runtime_data())?,
        addr_sets: ctx.node::<AddrSets>(&handles::addr_sets())?,
        port_groups: ctx.node::<PortGroups>(&handles::port_groups())?,
        template_vars: ctx.node::<TemplateVars>(&handles::template_vars())?,
        lb_data: ctx.node::<LbData>(&handles::lb_data())?,
        mac_cache: ctx.node::<MacCache>(&handles::mac_cache())?,
        lflow_table: ctx
            .node::<DbTableNode>(&tables::sb_node(sb::LOGICAL_FLOW))?
            .table(),
        dp_group_table: ctx
            .node::<DbTableNode>(&tables::sb_node(sb::LOGICAL_DP_GROUP))?
            .table(),
        mg_table: ctx
            .node::<DbTableNode>(&tables::sb_node(sb::MULTICAST_GROUP))?
            .table(),
        mac_binding_table: ctx
            .node::<DbTableNode>(&tables::sb_node(sb::MAC_BINDING))?
            .table(),
        static_mac_table: ctx
            .node::<DbTableNode>(&tables::sb_node(sb::STATIC_MAC_BINDING))?
            .table(),
        fdb_table: ctx
            .node::<DbTableNode>(&tables::sb_node(sb::FDB))?
            .table(),
    })
}

#[derive(Debug)]
pub struct LflowOutput {
    desired: DesiredFlowTable,
    groups: ExtendTable,
    meters: ExtendTable,
    cache: LflowCache,
    deps: ObjDepMgr,
    /// Datapaths whose whole flow complement has been produced, so a
    /// datapath turning local is populated exactly once even when row
    /// deltas for it land in the same iteration.
    populated_dps: BTreeSet<Uuid>,
    /// Millisecond clock fed by the main loop before each iteration, used
    /// by the cache trim policy.
    now_ms: i64,
}

impl LflowOutput {
    pub fn new(cache: LflowCache) -> Self {
        Self {
            desired: DesiredFlowTable::new(),
            groups: ExtendTable::new("group", u32::MAX - 1),
            meters: ExtendTable::new("meter", u32::MAX - 1),
            cache,
            deps: ObjDepMgr::new(),
            populated_dps: BTreeSet::new(),
            now_ms: 0,
        }
    }

    pub fn desired(&self) -> &DesiredFlowTable {
        &self.desired
    }

    pub fn groups(&self) -> &ExtendTable {
        &self.groups
    }

    pub fn meters(&self) -> &ExtendTable {
        &self.meters
    }

    pub fn set_clock(&mut self, now_ms: i64) {
        self.now_ms = now_ms;
    }

    pub fn cache_stats(&self) -> LflowCacheStats {
        self.cache.stats()
    }

    pub fn cache_flush(&mut self) {
        self.cache.flush();
    }

    pub fn cache_trim(&mut self) {
        self.cache.trim(self.now_ms, false);
    }

    pub fn reconfigure_cache(&mut self, config: crate::config::LflowCacheConfig) {
        self.cache.reconfigure(config, self.now_ms);
    }

    /// Drops state derived from dead row pointers after a southbound
    /// re-snapshot.
    pub fn on_reconnect(&mut self) {
        self.cache.flush();
    }

    /// Programs groups and meters so the switch matches the desired side.
    pub fn sync_extend_tables(&mut self, conn: &mut dyn OfConn) -> Result<usize, OfError> {
        Ok(self.groups.sync(conn)? + self.meters.sync(conn)?)
    }

    pub fn forget_installed_extends(&mut self) {
        self.groups.forget_existing();
        self.meters.forget_existing();
    }

    /// Resolves `group(def)` / `meter(def)` action templates to stable
    /// ids, allocating on first use.
    fn resolve_extends(&mut self, actions: &str) -> Result<String, EngineError> {
        let mut out = actions.to_string();
        loop {
            let Some((kind, start)) = ["group(", "meter("]
                .iter()
                .filter_map(|prefix| out.find(prefix).map(|at| (*prefix, at)))
                .min_by_key(|(_, at)| *at)
            else {
                break;
            };
            let def_start = start + kind.len();
            let Some(rel_end) = out[def_start..].find(')') else {
                break;
            };
            let def_end = def_start + rel_end;
            let def = out[def_start..def_end].to_string();
            let id = if kind == "group(" {
                self.groups.ensure_desired(&def)
            } else {
                self.meters.ensure_desired(&def)
            }
            .map_err(EngineError::internal)?;
            let tag = if kind == "group(" { "group" } else { "meter" };
            out.replace_range(start..=def_end, &format!("{tag}:{id}"));
        }
        Ok(out)
    }

    fn add_flows(
        &mut self,
        origin: Uuid,
        flows: &[CachedFlow],
    ) -> Result<(), EngineError> {
        for flow in flows {
            let actions = self.resolve_extends(&flow.actions)?;
            self.desired.add(
                origin,
                FlowKey {
                    table: flow.table,
                    priority: flow.priority,
                    match_: flow.match_.clone(),
                },
                actions,
            );
        }
        Ok(())
    }

    fn datapaths_of_lflow(row: &Row, dp_group_table: &Table) -> Vec<Uuid> {
        if let Some(dp) = row.uuid_col("logical_datapath") {
            return vec![dp];
        }
        if let Some(group) = row.uuid_col("logical_dp_group") {
            if let Some(group_row) = dp_group_table.get(&group) {
                return group_row.uuid_set("datapaths");
            }
        }
        Vec::new()
    }

    /// Translates one logical-flow row for every local datapath it spans.
    fn add_lflow(&mut self, row: &Row, inputs: &Inputs) -> Result<(), EngineError> {
        let mut refs: BTreeSet<String> = BTreeSet::new();
        let mut any = false;
        for dp_uuid in Self::datapaths_of_lflow(row, inputs.dp_group_table) {
            let Some(ld) = inputs.rt.local_datapaths().get(&dp_uuid) else {
                continue;
            };
            any = true;
            let key = translate::lflow_cache_key(
                row,
                ld.tunnel_key,
                inputs.addr_sets,
                inputs.port_groups,
                inputs.template_vars,
            );
            let (flows, flow_refs) = match self.cache.get(&key) {
                Some(hit) => hit,
                None => {
                    let t = translate::translate_lflow(
                        row,
                        ld.tunnel_key,
                        inputs.addr_sets,
                        inputs.port_groups,
                        inputs.template_vars,
                    );
                    self.cache
                        .insert(key, t.flows.clone(), t.refs.clone(), self.now_ms);
                    (t.flows, t.refs)
                }
            };
            self.add_flows(row.uuid(), &flows)?;
            refs.extend(flow_refs);
            refs.insert(format!("dp:{dp_uuid}"));
        }
        if any {
            self.deps.record(row.uuid(), refs);
        }
        Ok(())
    }

    fn add_lb(&mut self, lb: &LoadBalancer, inputs: &Inputs) -> Result<(), EngineError> {
        let mut refs: BTreeSet<String> = BTreeSet::new();
        let mut flows = Vec::new();
        for dp_uuid in &lb.datapaths {
            let Some(ld) = inputs.rt.local_datapaths().get(dp_uuid) else {
                continue;
            };
            refs.insert(format!("dp:{dp_uuid}"));
            for (vip, backends) in &lb.vips {
                let (group_def, mut flow) =
                    translate::translate_lb_vip(&lb.protocol, vip, backends, ld.tunnel_key);
                let id = self
                    .groups
                    .ensure_desired(&group_def)
                    .map_err(EngineError::internal)?;
                flow.actions = flow.actions.replace("<gid>", &id.to_string());
                flows.push(flow);
            }
        }
        if !refs.is_empty() {
            self.add_flows(lb.uuid, &flows)?;
            self.deps.record(lb.uuid, refs);
        }
        Ok(())
    }

    fn add_mac_rows_for_uuid(
        &mut self,
        uuid: &Uuid,
        inputs: &Inputs,
    ) -> Result<(), EngineError> {
        let row = inputs
            .mac_binding_table
            .get(uuid)
            .or_else(|| inputs.static_mac_table.get(uuid));
        if let Some(row) = row {
            let (Some(lport), Some(ip), Some(mac), Some(dp)) = (
                row.str("logical_port"),
                row.str("ip"),
                row.str("mac"),
                row.uuid_col("datapath"),
            ) else {
                return Ok(());
            };
            // A shadowed dynamic binding produces nothing; the static row
            // owns the (port, ip) pair.
            if inputs
                .mac_cache
                .lookup(lport, ip)
                .is_some_and(|e| e.uuid != *uuid)
            {
                return Ok(());
            }
            if let Some(ld) = inputs.rt.local_datapaths().get(&dp) {
                let flow = translate::translate_mac_binding(lport, ip, mac, ld.tunnel_key);
                self.add_flows(*uuid, &[flow])?;
                self.deps.record(*uuid, [format!("dp:{dp}")]);
            }
            return Ok(());
        }
        if let Some(row) = inputs.fdb_table.get(uuid) {
            let (Some(mac), Some(dp_key)) = (row.str("mac"), row.integer("dp_key")) else {
                return Ok(());
            };
            let local = inputs
                .rt
                .local_datapaths()
                .iter()
                .find(|(_, ld)| ld.tunnel_key == dp_key);
            if let Some((dp_uuid, _)) = local {
                let flow =
                    translate::translate_fdb(dp_key, mac, row.integer("port_key").unwrap_or(0));
                self.add_flows(*uuid, &[flow])?;
                self.deps.record(*uuid, [format!("dp:{dp_uuid}")]);
            }
        }
        Ok(())
    }

    fn add_multicast_group(&mut self, row: &Row, inputs: &Inputs) -> Result<(), EngineError> {
        let Some(dp) = row.uuid_col("datapath") else {
            return Ok(());
        };
        let Some(ld) = inputs.rt.local_datapaths().get(&dp) else {
            return Ok(());
        };
        if let Some(flow) = translate::translate_multicast_group(row, ld.tunnel_key) {
            self.add_flows(row.uuid(), &[flow])?;
            self.deps.record(row.uuid(), [format!("dp:{dp}")]);
        }
        Ok(())
    }

    fn retract(&mut self, origin: &Uuid) {
        self.desired.retract(origin);
        self.deps.remove_object(origin);
    }

    /// Re-adds whatever `origin` currently stands for, whichever table it
    /// lives in; used after retraction when the source row survives.
    fn re_add_origin(&mut self, origin: &Uuid, inputs: &Inputs) -> Result<(), EngineError> {
        if let Some(row) = inputs.lflow_table.get(origin) {
            return self.add_lflow(&row.clone(), inputs);
        }
        if let Some(lb) = inputs.lb_data.get(origin) {
            return self.add_lb(&lb.clone(), inputs);
        }
        if let Some(row) = inputs.mg_table.get(origin) {
            return self.add_multicast_group(&row.clone(), inputs);
        }
        self.add_mac_rows_for_uuid(origin, inputs)
    }

    /// Everything that references one resource key gets retracted and
    /// freshly translated.
    fn republish_resource(&mut self, resource: &str, inputs: &Inputs) -> Result<bool, EngineError> {
        let origins: Vec<Uuid> = self.deps.objects_for(resource).collect();
        for origin in &origins {
            self.retract(origin);
        }
        for origin in &origins {
            self.re_add_origin(origin, inputs)?;
        }
        Ok(!origins.is_empty())
    }

    /// Populates every flow kind for one newly local datapath.
    fn populate_datapath(&mut self, dp_uuid: Uuid, inputs: &Inputs) -> Result<(), EngineError> {
        let direct: Vec<Row> = inputs
            .lflow_table
            .rows_by_index(index::BY_LOGICAL_DATAPATH, &flowsync_db::IndexKey::Uuid(dp_uuid))?
            .cloned()
            .collect();
        for row in &direct {
            self.add_lflow(row, inputs)?;
        }
        let grouped: Vec<Row> = inputs
            .lflow_table
            .iter()
            .filter(|row| row.uuid_col("logical_datapath").is_none())
            .filter(|row| {
                Self::datapaths_of_lflow(row, inputs.dp_group_table).contains(&dp_uuid)
            })
            .cloned()
            .collect();
        for row in &grouped {
            self.add_lflow(row, inputs)?;
        }

        let lbs: Vec<LoadBalancer> = inputs
            .lb_data
            .load_balancers()
            .filter(|lb| lb.datapaths.contains(&dp_uuid))
            .cloned()
            .collect();
        for lb in &lbs {
            self.add_lb(lb, inputs)?;
        }

        let mgs: Vec<Row> = inputs
            .mg_table
            .rows_by_index(index::BY_DATAPATH, &flowsync_db::IndexKey::Uuid(dp_uuid))?
            .cloned()
            .collect();
        for row in &mgs {
            self.add_multicast_group(row, inputs)?;
        }

        let mac_uuids: Vec<Uuid> = inputs
            .mac_binding_table
            .rows_by_index(index::BY_DATAPATH, &flowsync_db::IndexKey::Uuid(dp_uuid))?
            .map(Row::uuid)
            .chain(
                inputs
                    .static_mac_table
                    .rows_by_index(
                        index::BY_DATAPATH,
                        &flowsync_db::IndexKey::Uuid(dp_uuid),
                    )?
                    .map(Row::uuid),
            )
            .collect();
        for uuid in &mac_uuids {
            self.add_mac_rows_for_uuid(uuid, inputs)?;
        }
        let dp_key = inputs
            .rt
            .local_datapaths()
            .get(&dp_uuid)
            .map(|ld| ld.tunnel_key)
            .unwrap_or(0);
        let fdb_uuids: Vec<Uuid> = inputs
            .fdb_table
            .iter()
            .filter(|row| row.integer("dp_key") == Some(dp_key))
            .map(Row::uuid)
            .collect();
        for uuid in &fdb_uuids {
            self.add_mac_rows_for_uuid(uuid, inputs)?;
        }
        Ok(())
    }
}

impl Node for LflowOutput {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let inputs = gather(ctx)?;
        self.desired.clear();
        self.groups.clear_desired();
        self.meters.clear_desired();
        self.deps.clear();
        self.populated_dps = inputs.rt.local_datapath_uuids();
        for dp_uuid in self.populated_dps.clone() {
            self.populate_datapath(dp_uuid, &inputs)?;
        }
        Ok(Change::Updated)
    }

    fn handle_change(
        &mut self,
        input: &NodeHandle,
        ctx: &Context,
    ) -> Result<HandlerOutcome, EngineError> {
        let inputs = gather(ctx)?;
        let mut changed = false;

        if *input == tables::sb_node(sb::LOGICAL_FLOW) {
            let tracked: Vec<_> = inputs.lflow_table.tracked().to_vec();
            for t in &tracked {
                self.retract(&t.uuid());
                if t.change != RowChange::Deleted {
                    self.add_lflow(&t.row, &inputs)?;
                }
                changed = true;
            }
        } else if *input == handles::runtime_data() {
            let Some(tracked) = inputs.rt.tracked() else {
                return Ok(HandlerOutcome::Unhandled);
            };
            for dp in tracked.to_vec() {
                let resource = format!("dp:{}", dp.datapath);
                if !inputs.rt.is_local_datapath(&dp.datapath) {
                    // Datapath left the local set: everything translated
                    // for it goes away.
                    self.populated_dps.remove(&dp.datapath);
                    let origins: Vec<Uuid> = self.deps.objects_for(&resource).collect();
                    for origin in &origins {
                        self.retract(origin);
                        // Objects spanning several datapaths keep their
                        // other instantiations.
                        self.re_add_origin(origin, &inputs)?;
                    }
                    changed |= !origins.is_empty();
                } else if self.populated_dps.insert(dp.datapath) {
                    self.populate_datapath(dp.datapath, &inputs)?;
                    changed = true;
                }
            }
        } else if *input == handles::addr_sets() {
            let Some(tracked) = inputs.addr_sets.tracked() else {
                return Ok(HandlerOutcome::Unhandled);
            };
            let names: Vec<String> = tracked
                .new
                .iter()
                .chain(tracked.deleted.iter())
                .cloned()
                .chain(tracked.updated.iter().map(|d| d.name.clone()))
                .collect();
            for name in names {
                changed |= self.republish_resource(&format!("as:{name}"), &inputs)?;
            }
        } else if *input == handles::port_groups() {
            let Some(tracked) = inputs.port_groups.tracked() else {
                return Ok(HandlerOutcome::Unhandled);
            };
            let names: Vec<String> = tracked
                .new
                .iter()
                .chain(tracked.deleted.iter())
                .cloned()
                .chain(tracked.updated.iter().map(|d| d.name.clone()))
                .collect();
            for name in names {
                changed |= self.republish_resource(&format!("pg:{name}"), &inputs)?;
            }
        } else if *input == handles::template_vars() {
            let Some(tracked) = inputs.template_vars.tracked() else {
                return Ok(HandlerOutcome::Unhandled);
            };
            for name in tracked.to_vec() {
                changed |= self.republish_resource(&format!("tv:{name}"), &inputs)?;
            }
        } else if *input == handles::lb_data() {
            let Some(tracked) = inputs.lb_data.tracked() else {
                return Ok(HandlerOutcome::Unhandled);
            };
            let tracked = tracked.clone();
            for uuid in tracked.deleted {
                self.retract(&uuid);
                changed = true;
            }
            for uuid in tracked.new.into_iter().chain(tracked.updated) {
                self.retract(&uuid);
                if let Some(lb) = inputs.lb_data.get(&uuid) {
                    self.add_lb(&lb.clone(), &inputs)?;
                }
                changed = true;
            }
        } else if *input == handles::mac_cache() {
            let Some(events) = inputs.mac_cache.tracked() else {
                return Ok(HandlerOutcome::Unhandled);
            };
            for event in events.to_vec() {
                self.retract(&event.uuid);
                if event.change != RowChange::Deleted || event.kind == MacRowKind::Static {
                    self.add_mac_rows_for_uuid(&event.uuid, &inputs)?;
                }
                // A static row appearing or vanishing re-exposes the
                // dynamic binding underneath.
                if event.kind == MacRowKind::Static {
                    for entry in inputs.mac_cache.bindings().values() {
                        if !entry.is_static {
                            let uuid = entry.uuid;
                            self.retract(&uuid);
                            self.add_mac_rows_for_uuid(&uuid, &inputs)?;
                        }
                    }
                }
                changed = true;
            }
        } else if *input == tables::sb_node(sb::MULTICAST_GROUP) {
            let tracked: Vec<_> = inputs.mg_table.tracked().to_vec();
            for t in &tracked {
                self.retract(&t.uuid());
                if t.change != RowChange::Deleted {
                    self.add_multicast_group(&t.row, &inputs)?;
                }
                changed = true;
            }
        } else if *input == tables::sb_node(sb::LOGICAL_DP_GROUP) {
            // Datapath-group membership edits fan out unpredictably;
            // recompute is the correct fallback.
            return Ok(HandlerOutcome::Unhandled);
        } else {
            return Ok(HandlerOutcome::Unhandled);
        }

        Ok(if changed {
            HandlerOutcome::Updated
        } else {
            HandlerOutcome::Unchanged
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
