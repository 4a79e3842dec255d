//! Connection-tracking zone allocator. Zone ids are 16-bit, per local
//! logical port plus one SNAT zone per local router datapath. Assignments
//! survive restarts by being persisted in the integration bridge's
//! external-ids and read back before fresh allocation.

use crate::global_config::GlobalConfig;
use crate::handles;
use crate::inputs::DbTableNode;
use crate::runtime_data::{LportTag, RuntimeData};
use crate::tables::{self, ovs, sb};
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_types::ids::ZoneId;
use flowsync_types::log::debug;
use flowsync_types::node::NodeHandle;
use flowsync_types::uuid::Uuid;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

pub const MIN_ZONE: ZoneId = 1;
pub const MAX_ZONE: ZoneId = 65_535;

/// External-ids key prefix under which assignments are persisted.
pub const ZONE_KEY_PREFIX: &str = "ct-zone-";

/// A persistence operation to fold into the next virtual-switch
/// transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct ZoneOp {
    pub name: String,
    pub zone: ZoneId,
    pub add: bool,
}

#[derive(Debug, Default)]
pub struct CtZones {
    assigned: BTreeMap<String, ZoneId>,
    pending: Vec<ZoneOp>,
}

impl CtZones {
    pub fn assigned(&self) -> &BTreeMap<String, ZoneId> {
        &self.assigned
    }

    pub fn zone_of(&self, name: &str) -> Option<ZoneId> {
        self.assigned.get(name).copied()
    }

    /// Pending persistence ops, drained by the commit pass.
    pub fn take_pending(&mut self) -> Vec<ZoneOp> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn snat_zone_name(dp: &Uuid) -> String {
        format!("{dp}_snat")
    }

    fn alloc(in_use: &BTreeSet<ZoneId>) -> Option<ZoneId> {
        (MIN_ZONE..=MAX_ZONE).find(|zone| !in_use.contains(zone))
    }

    fn assign(&mut self, name: &str, restored: Option<ZoneId>, in_use: &mut BTreeSet<ZoneId>) {
        if let Some(zone) = self.assigned.get(name) {
            in_use.insert(*zone);
            return;
        }
        let zone = restored
            .filter(|z| !in_use.contains(z))
            .or_else(|| Self::alloc(in_use));
        if let Some(zone) = zone {
            in_use.insert(zone);
            self.assigned.insert(name.to_string(), zone);
            self.pending.push(ZoneOp {
                name: name.to_string(),
                zone,
                add: true,
            });
            debug!("ct-zones: assigned zone {zone} to {name}");
        }
    }

    fn release(&mut self, name: &str) {
        if let Some(zone) = self.assigned.remove(name) {
            self.pending.push(ZoneOp {
                name: name.to_string(),
                zone,
                add: false,
            });
            debug!("ct-zones: released zone {zone} of {name}");
        }
    }

    /// Names that currently need a zone: every local binding plus an SNAT
    /// context per local router datapath.
    fn needed(ctx: &Context) -> Result<BTreeSet<String>, EngineError> {
        let rt = ctx.node::<RuntimeData>(&handles::runtime_data())?;
        let dp_table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::DATAPATH_BINDING))?
            .table();
        let mut names: BTreeSet<String> =
            rt.local_bindings().keys().cloned().collect();
        for dp in rt.local_datapaths().keys() {
            let is_router = dp_table
                .get(dp)
                .is_some_and(|row| row.smap_get("external_ids", "logical-router").is_some());
            if is_router {
                names.insert(Self::snat_zone_name(dp));
            }
        }
        Ok(names)
    }

    fn restored_zones(ctx: &Context) -> Result<BTreeMap<String, ZoneId>, EngineError> {
        let br_int = ctx.node::<GlobalConfig>(&handles::global_config())?.br_int();
        let bridge_table = ctx
            .node::<DbTableNode>(&tables::ovs_node(ovs::BRIDGE))?
            .table();
        let mut restored = BTreeMap::new();
        if let Some(bridge) = br_int.and_then(|uuid| bridge_table.get(&uuid)) {
            for (key, value) in bridge.map_iter("external_ids") {
                if let Some(name) = key.strip_prefix(ZONE_KEY_PREFIX) {
                    if let Some(zone) = value.as_str().and_then(|v| v.parse::<ZoneId>().ok()) {
                        restored.insert(name.to_string(), zone);
                    }
                }
            }
        }
        Ok(restored)
    }
}

impl Node for CtZones {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let needed = Self::needed(ctx)?;
        let restored = Self::restored_zones(ctx)?;

        let prev = self.assigned.clone();
        for name in prev.keys() {
            if !needed.contains(name) {
                self.release(name);
            }
        }
        let mut in_use: BTreeSet<ZoneId> = self.assigned.values().copied().collect();
        for name in &needed {
            self.assign(name, restored.get(name).copied(), &mut in_use);
        }
        Ok(if self.assigned != prev {
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
        if *input == handles::runtime_data() {
            let rt = ctx.node::<RuntimeData>(&handles::runtime_data())?;
            let Some(tracked) = rt.tracked() else {
                return Ok(HandlerOutcome::Unhandled);
            };
            let mut in_use: BTreeSet<ZoneId> = self.assigned.values().copied().collect();
            let before = self.assigned.clone();
            for dp in tracked {
                // Datapath arrival or departure moves SNAT contexts; take
                // the full recompute for those.
                if !rt.is_local_datapath(&dp.datapath) {
                    return Ok(HandlerOutcome::Unhandled);
                }
                for lport in &dp.lports {
                    match lport.tag {
                        LportTag::New | LportTag::Updated => {
                            self.assign(&lport.name, None, &mut in_use);
                        }
                        LportTag::Removed => self.release(&lport.name),
                    }
                }
            }
            return Ok(if self.assigned != before {
                HandlerOutcome::Updated
            } else {
                HandlerOutcome::Unchanged
            });
        }

        if *input == tables::ovs_node(ovs::BRIDGE) {
            // The external-ids column is tracked so out-of-band edits to
            // persisted zones are noticed and re-asserted.
            let bridge_table = ctx
                .node::<DbTableNode>(&tables::ovs_node(ovs::BRIDGE))?
                .table();
            let br_int = ctx.node::<GlobalConfig>(&handles::global_config())?.br_int();
            let mut reasserted = false;
            for t in bridge_table.tracked() {
                if Some(t.uuid()) != br_int || !t.column_updated("external_ids") {
                    continue;
                }
                for (name, zone) in &self.assigned {
                    let key = format!("{ZONE_KEY_PREFIX}{name}");
                    let stored = t.row.smap_get("external_ids", &key);
                    if stored != Some(zone.to_string().as_str()) {
                        self.pending.push(ZoneOp {
                            name: name.clone(),
                            zone: *zone,
                            add: true,
                        });
                        reasserted = true;
                    }
                }
            }
            return Ok(if reasserted {
                HandlerOutcome::Updated
            } else {
                HandlerOutcome::Unchanged
            });
        }

        Ok(HandlerOutcome::Unhandled)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
