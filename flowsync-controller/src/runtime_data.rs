//! The local-scope node: which datapaths, logical ports and related ports
//! live on this chassis, derived only from database contents. Also the
//! origin of chassis claims and of the tracked-datapath delta every
//! downstream flow producer consumes.

use crate::global_config::GlobalConfig;
use crate::handles;
use crate::iface_shadow::IfaceShadow;
use crate::inputs::{DbTableNode, SignalNode};
use crate::tables::{self, index, sb};
use flowsync_db::{IndexKey, Row, RowChange, Table};
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_types::log::debug;
use flowsync_types::node::NodeHandle;
use flowsync_types::uuid::Uuid;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LportTag {
    New,
    Updated,
    Removed,
}

#[derive(Clone, Debug)]
pub struct TrackedLport {
    pub name: String,
    pub tag: LportTag,
}

/// Per-iteration delta of local scope, grouped by datapath. This is the
/// channel through which flow producers learn what to re-flow.
#[derive(Clone, Debug)]
pub struct TrackedDatapath {
    pub datapath: Uuid,
    pub tunnel_key: i64,
    pub lports: Vec<TrackedLport>,
}

/// A southbound chassis assignment this node wants written.
#[derive(Clone, Debug, PartialEq)]
pub struct Claim {
    pub port_binding: Uuid,
    pub logical_port: String,
    pub iface: Uuid,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalPort {
    pub port_binding: Uuid,
    pub datapath: Uuid,
    pub kind: String,
    pub tunnel_key: i64,
    pub ofport: Option<i64>,
    /// Migration-style binding that must see an explicit activation step
    /// before flows treat it as live.
    pub requires_activation: bool,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct LocalDatapath {
    pub tunnel_key: i64,
    /// Patch ports on this datapath and the peer datapath they lead to.
    pub peer_ports: Vec<(String, Uuid)>,
}

#[derive(Debug, Default)]
pub struct RuntimeData {
    local_datapaths: BTreeMap<Uuid, LocalDatapath>,
    local_bindings: BTreeMap<String, LocalPort>,
    related_ports: BTreeSet<String>,
    tracked: Option<Vec<TrackedDatapath>>,
    pending_claims: Vec<Claim>,
}

impl RuntimeData {
    pub fn local_datapaths(&self) -> &BTreeMap<Uuid, LocalDatapath> {
        &self.local_datapaths
    }

    pub fn local_datapath_uuids(&self) -> BTreeSet<Uuid> {
        self.local_datapaths.keys().copied().collect()
    }

    pub fn is_local_datapath(&self, dp: &Uuid) -> bool {
        self.local_datapaths.contains_key(dp)
    }

    pub fn local_bindings(&self) -> &BTreeMap<String, LocalPort> {
        &self.local_bindings
    }

    pub fn related_ports(&self) -> &BTreeSet<String> {
        &self.related_ports
    }

    /// `None` after a full recompute: consumers must rebuild rather than
    /// fold.
    pub fn tracked(&self) -> Option<&[TrackedDatapath]> {
        self.tracked.as_deref()
    }

    pub fn pending_claims(&self) -> &[Claim] {
        &self.pending_claims
    }

    fn track_lport(&mut self, datapath: Uuid, tunnel_key: i64, name: &str, tag: LportTag) {
        let tracked = self.tracked.get_or_insert_with(Vec::new);
        let dp = match tracked.iter_mut().find(|t| t.datapath == datapath) {
            Some(dp) => dp,
            None => {
                tracked.push(TrackedDatapath {
                    datapath,
                    tunnel_key,
                    lports: Vec::new(),
                });
                tracked.last_mut().unwrap()
            }
        };
        if let Some(existing) = dp.lports.iter_mut().find(|l| l.name == name) {
            if existing.tag != tag {
                existing.tag = if tag == LportTag::Removed {
                    LportTag::Removed
                } else {
                    existing.tag
                };
            }
        } else {
            dp.lports.push(TrackedLport {
                name: name.to_string(),
                tag,
            });
        }
    }

    fn local_port_of(pb: &Row, ofport: Option<i64>) -> Option<LocalPort> {
        Some(LocalPort {
            port_binding: pb.uuid(),
            datapath: pb.uuid_col("datapath")?,
            kind: pb.str("type").unwrap_or("").to_string(),
            tunnel_key: pb.integer("tunnel_key").unwrap_or(0),
            ofport,
            requires_activation: pb.smap_get("options", "activation-strategy") == Some("rarp"),
        })
    }

    /// Adds `dp` to the local set and chases patch peers to a fixpoint.
    fn extend_with_datapath(
        &mut self,
        dp_uuid: Uuid,
        pb_table: &Table,
        dp_table: &Table,
    ) -> Result<(), EngineError> {
        let mut queue = VecDeque::from([dp_uuid]);
        while let Some(dp) = queue.pop_front() {
            if self.local_datapaths.contains_key(&dp) {
                continue;
            }
            let tunnel_key = dp_table
                .get(&dp)
                .and_then(|row| row.integer("tunnel_key"))
                .unwrap_or(0);
            let mut entry = LocalDatapath {
                tunnel_key,
                peer_ports: Vec::new(),
            };
            for pb in pb_table.rows_by_index(index::BY_DATAPATH, &IndexKey::Uuid(dp))? {
                if pb.str("type") != Some("patch") {
                    continue;
                }
                let Some(peer_name) = pb.smap_get("options", "peer") else {
                    continue;
                };
                let Some(peer_pb) = pb_table.row_by_index(
                    index::BY_NAME,
                    &IndexKey::str(peer_name.to_string()),
                )?
                else {
                    continue;
                };
                if let Some(peer_dp) = peer_pb.uuid_col("datapath") {
                    entry
                        .peer_ports
                        .push((pb.str("logical_port").unwrap_or("").to_string(), peer_dp));
                    queue.push_back(peer_dp);
                }
            }
            self.local_datapaths.insert(dp, entry);
        }
        Ok(())
    }

    /// Binds one advertised interface to its port binding, including its
    /// child ports, and queues a claim if the southbound does not yet say
    /// the port lives here.
    fn bind_iface(
        &mut self,
        chassis: &str,
        iface_id: &str,
        iface_uuid: Uuid,
        ofport: Option<i64>,
        pb_table: &Table,
        dp_table: &Table,
        track: bool,
    ) -> Result<(), EngineError> {
        let Some(pb) = pb_table.row_by_index(index::BY_NAME, &IndexKey::str(iface_id))? else {
            // The binding may not have arrived yet; monitor conditions
            // widen once the datapath shows up elsewhere.
            return Ok(());
        };
        let Some(port) = Self::local_port_of(pb, ofport) else {
            return Ok(());
        };
        let datapath = port.datapath;
        let tunnel_key = port.tunnel_key;
        self.extend_with_datapath(datapath, pb_table, dp_table)?;
        let prev = self.local_bindings.insert(iface_id.to_string(), port);
        if pb.str("chassis") != Some(chassis) {
            self.pending_claims.push(Claim {
                port_binding: pb.uuid(),
                logical_port: iface_id.to_string(),
                iface: iface_uuid,
            });
        }
        if track {
            let dp_key = self
                .local_datapaths
                .get(&datapath)
                .map(|d| d.tunnel_key)
                .unwrap_or(tunnel_key);
            let tag = if prev.is_some() {
                LportTag::Updated
            } else {
                LportTag::New
            };
            self.track_lport(datapath, dp_key, iface_id, tag);
        }

        // Child ports declare this port as their parent and land here with
        // it.
        for child in pb_table.iter() {
            if child.smap_get("options", "requested-chassis").is_some() {
                continue;
            }
            if child.str("parent_port") != Some(iface_id) {
                continue;
            }
            let Some(name) = child.str("logical_port") else {
                continue;
            };
            if let Some(port) = Self::local_port_of(child, ofport) {
                let child_dp = port.datapath;
                let child_key = port.tunnel_key;
                self.extend_with_datapath(child_dp, pb_table, dp_table)?;
                let prev = self.local_bindings.insert(name.to_string(), port);
                if child.str("chassis") != Some(chassis) {
                    self.pending_claims.push(Claim {
                        port_binding: child.uuid(),
                        logical_port: name.to_string(),
                        iface: iface_uuid,
                    });
                }
                if track {
                    let tag = if prev.is_some() {
                        LportTag::Updated
                    } else {
                        LportTag::New
                    };
                    self.track_lport(child_dp, child_key, name, tag);
                }
            }
        }
        Ok(())
    }

    fn rebuild_related_ports(&mut self, pb_table: &Table) -> Result<(), EngineError> {
        self.related_ports.clear();
        for dp in self.local_datapaths.keys().copied().collect::<Vec<_>>() {
            for pb in pb_table.rows_by_index(index::BY_DATAPATH, &IndexKey::Uuid(dp))? {
                let Some(name) = pb.str("logical_port") else {
                    continue;
                };
                if !self.local_bindings.contains_key(name) {
                    self.related_ports.insert(name.to_string());
                }
            }
        }
        Ok(())
    }
}

impl Node for RuntimeData {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let chassis = ctx
            .node::<GlobalConfig>(&handles::global_config())?
            .chassis_name()
            .to_string();
        let shadow = ctx.node::<IfaceShadow>(&handles::iface_shadow())?;
        let pb_table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::PORT_BINDING))?
            .table();
        let dp_table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::DATAPATH_BINDING))?
            .table();

        let prev_dps = std::mem::take(&mut self.local_datapaths);
        let prev_bindings = std::mem::take(&mut self.local_bindings);
        let prev_related = std::mem::take(&mut self.related_ports);
        self.pending_claims.clear();
        self.tracked = None;

        for (_, rec) in shadow.ifaces() {
            if let Some(iface_id) = rec.iface_id.clone() {
                self.bind_iface(
                    &chassis, &iface_id, rec.uuid, rec.ofport, pb_table, dp_table, false,
                )?;
            }
        }
        self.rebuild_related_ports(pb_table)?;

        let changed = prev_dps != self.local_datapaths
            || prev_bindings != self.local_bindings
            || prev_related != self.related_ports;
        if changed {
            debug!(
                "runtime-data: {} local datapaths, {} local ports, {} related",
                self.local_datapaths.len(),
                self.local_bindings.len(),
                self.related_ports.len()
            );
        }
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
        let pb_table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::PORT_BINDING))?
            .table();
        let dp_table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::DATAPATH_BINDING))?
            .table();
        let chassis = ctx
            .node::<GlobalConfig>(&handles::global_config())?
            .chassis_name()
            .to_string();

        let sb_read_only = *ctx
            .node::<crate::inputs::SignalNode<bool>>(&handles::sb_ro())?
            .get();
        // A binding that still needs its chassis claim written cannot be
        // folded in while the southbound is read-only; the fallback
        // recompute cancels the iteration, which is the intended handshake.
        let needs_claim = |name: &str| -> Result<bool, EngineError> {
            Ok(pb_table
                .row_by_index(index::BY_NAME, &IndexKey::str(name))?
                .is_some_and(|pb| pb.str("chassis") != Some(chassis.as_str())))
        };

        if *input == handles::iface_shadow() {
            let shadow = ctx.node::<IfaceShadow>(&handles::iface_shadow())?;
            let Some(changes) = shadow.tracked() else {
                return Ok(HandlerOutcome::Unhandled);
            };
            // Handled iterations always leave a (possibly empty) delta, so
            // downstream handlers can fold rather than recompute.
            self.tracked.get_or_insert_with(Vec::new);
            let mut updated = false;
            for change in changes {
                let old_id = change.old.as_ref().and_then(|r| r.iface_id.clone());
                let new_id = change.new.as_ref().and_then(|r| r.iface_id.clone());
                match (&old_id, &new_id) {
                    (Some(_), None) | (Some(_), Some(_)) if old_id != new_id => {
                        // A binding went away; undoing the patch closure
                        // incrementally is not worth the complexity.
                        return Ok(HandlerOutcome::Unhandled);
                    }
                    (None, None) => {}
                    _ => {
                        if let (Some(id), Some(rec)) = (&new_id, &change.new) {
                            if sb_read_only && needs_claim(id)? {
                                return Ok(HandlerOutcome::Unhandled);
                            }
                            let had = self.local_bindings.contains_key(id);
                            self.bind_iface(
                                &chassis, id, rec.uuid, rec.ofport, pb_table, dp_table, true,
                            )?;
                            updated |= !had || self.local_bindings.contains_key(id);
                        }
                    }
                }
            }
            if updated {
                self.rebuild_related_ports(pb_table)?;
            }
            return Ok(if updated {
                HandlerOutcome::Updated
            } else {
                HandlerOutcome::Unchanged
            });
        }

        if *input == tables::sb_node(sb::PORT_BINDING) {
            let shadow = ctx.node::<IfaceShadow>(&handles::iface_shadow())?;
            self.tracked.get_or_insert_with(Vec::new);
            let mut updated = false;
            for t in pb_table.tracked() {
                let Some(name) = t.row.str("logical_port") else {
                    continue;
                };
                match t.change {
                    RowChange::Deleted => {
                        if self.local_bindings.contains_key(name)
                            || t.row
                                .uuid_col("datapath")
                                .is_some_and(|dp| self.local_datapaths.contains_key(&dp))
                        {
                            return Ok(HandlerOutcome::Unhandled);
                        }
                    }
                    RowChange::New | RowChange::Updated => {
                        if t.row.str("chassis") == Some(chassis.as_str()) {
                            // Claim acknowledged; stop asking for it.
                            self.pending_claims
                                .retain(|c| c.port_binding != t.row.uuid());
                        }
                        if t.row.str("type") == Some("patch") {
                            let on_local = t
                                .row
                                .uuid_col("datapath")
                                .is_some_and(|dp| self.local_datapaths.contains_key(&dp));
                            if on_local {
                                // Topology change; recompute the closure.
                                return Ok(HandlerOutcome::Unhandled);
                            }
                            continue;
                        }
                        if let Some((_, rec)) = shadow.by_iface_id(name) {
                            let rec = rec.clone();
                            if sb_read_only && needs_claim(name)? {
                                return Ok(HandlerOutcome::Unhandled);
                            }
                            self.bind_iface(
                                &chassis, name, rec.uuid, rec.ofport, pb_table, dp_table, true,
                            )?;
                            updated = true;
                        } else if let Some(dp) = t.row.uuid_col("datapath") {
                            if self.local_datapaths.contains_key(&dp) {
                                let dp_key = self.local_datapaths[&dp].tunnel_key;
                                self.related_ports.insert(name.to_string());
                                self.track_lport(dp, dp_key, name, LportTag::Updated);
                                updated = true;
                            }
                        }
                    }
                }
            }
            return Ok(if updated {
                HandlerOutcome::Updated
            } else {
                HandlerOutcome::Unchanged
            });
        }

        if *input == handles::sb_ro() || *input == handles::active_tunnels() {
            // Writability returned or tunnel membership moved: surface the
            // pending claims again so the commit pass drains them.
            return Ok(if self.pending_claims.is_empty() {
                HandlerOutcome::Unchanged
            } else {
                HandlerOutcome::Updated
            });
        }

        Ok(HandlerOutcome::Unhandled)
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
