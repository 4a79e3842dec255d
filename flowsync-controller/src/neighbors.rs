//! Neighbor exchange, the ARP/ND sibling of the route subsystem:
//! advertised MAC bindings become kernel neighbor entries on mapped
//! interfaces, and kernel-learned neighbors are written back as
//! southbound MAC bindings.

use crate::global_config::GlobalConfig;
use crate::handles;
use crate::inputs::{DbTableNode, QueueNode, SignalNode};
use crate::netlink::{KernelNeigh, NeighOp, NetlinkEvent};
use crate::runtime_data::RuntimeData;
use crate::tables::{self, sb};
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_types::node::NodeHandle;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

/// Desired kernel neighbor entries from the advertised-MAC-binding table.
#[derive(Debug, Default)]
pub struct Neighbors {
    desired: BTreeSet<KernelNeigh>,
}

impl Neighbors {
    pub fn desired(&self) -> &BTreeSet<KernelNeigh> {
        &self.desired
    }
}

impl Node for Neighbors {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let rt = ctx.node::<RuntimeData>(&handles::runtime_data())?;
        let config = ctx
            .node::<GlobalConfig>(&handles::global_config())?
            .config();
        let table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::ADVERTISED_MAC_BINDING))?
            .table();

        let mapping: BTreeMap<&str, &str> = config
            .routing_port_mapping
            .iter()
            .map(|(lport, dev)| (lport.as_str(), dev.as_str()))
            .collect();

        let mut desired = BTreeSet::new();
        for row in table.iter() {
            let Some(dp) = row.uuid_col("datapath") else {
                continue;
            };
            if !rt.is_local_datapath(&dp) {
                continue;
            }
            let Some(device) = row.str("logical_port").and_then(|p| mapping.get(p)) else {
                continue;
            };
            let (Some(ip), Some(mac)) = (row.str("ip"), row.str("mac")) else {
                continue;
            };
            desired.insert(KernelNeigh {
                ip: ip.to_string(),
                mac: mac.to_string(),
                device: device.to_string(),
            });
        }

        let changed = desired != self.desired;
        self.desired = desired;
        Ok(if changed {
            Change::Updated
        } else {
            Change::Unchanged
        })
    }

    fn handle_change(
        &mut self,
        _input: &NodeHandle,
        _ctx: &Context,
    ) -> Result<HandlerOutcome, EngineError> {
        // Same stance as the route node: incremental not yet proved.
        Ok(HandlerOutcome::Unhandled)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A learned-neighbor mutation for the southbound MAC-binding table.
#[derive(Clone, Debug, PartialEq)]
pub enum LearnedNeighOp {
    Add(KernelNeigh),
    Del(KernelNeigh),
}

#[derive(Debug, Default)]
pub struct NeighborSync {
    kernel: BTreeSet<KernelNeigh>,
    pending_kernel_ops: Vec<NeighOp>,
    pending_learned: Vec<LearnedNeighOp>,
    mapped_devices: BTreeSet<String>,
}

impl NeighborSync {
    pub fn take_kernel_ops(&mut self) -> Vec<NeighOp> {
        std::mem::take(&mut self.pending_kernel_ops)
    }

    pub fn take_learned(&mut self) -> Vec<LearnedNeighOp> {
        std::mem::take(&mut self.pending_learned)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_kernel_ops.is_empty() || !self.pending_learned.is_empty()
    }

    fn reconcile(
        &mut self,
        desired: &BTreeSet<KernelNeigh>,
        already_learned: &BTreeSet<(String, String)>,
    ) -> bool {
        let mut changed = false;
        for neigh in desired {
            if !self.kernel.contains(neigh) {
                self.pending_kernel_ops.push(NeighOp::Add(neigh.clone()));
                changed = true;
            }
        }
        for neigh in &self.kernel {
            if !self.mapped_devices.contains(&neigh.device) || desired.contains(neigh) {
                continue;
            }
            if already_learned.contains(&(neigh.ip.clone(), neigh.mac.clone())) {
                continue;
            }
            let op = LearnedNeighOp::Add(neigh.clone());
            if !self.pending_learned.contains(&op) {
                self.pending_learned.push(op);
                changed = true;
            }
        }
        changed
    }

    fn already_learned(ctx: &Context) -> Result<BTreeSet<(String, String)>, EngineError> {
        let table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::MAC_BINDING))?
            .table();
        Ok(table
            .iter()
            .filter_map(|row| {
                Some((
                    row.str("ip")?.to_string(),
                    row.str("mac").unwrap_or("").to_string(),
                ))
            })
            .collect())
    }
}

impl Node for NeighborSync {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let neighbors = ctx.node::<Neighbors>(&handles::neighbors())?;
        let config = ctx
            .node::<GlobalConfig>(&handles::global_config())?
            .config();
        self.mapped_devices = config
            .routing_port_mapping
            .iter()
            .map(|(_, dev)| dev.clone())
            .collect();
        self.pending_kernel_ops.clear();
        self.pending_learned.clear();
        let already = Self::already_learned(ctx)?;
        let changed = self.reconcile(neighbors.desired(), &already);
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
        if *input == handles::neighbors_notify() {
            let queue = ctx.node::<QueueNode<NetlinkEvent>>(&handles::neighbors_notify())?;
            let mut changed = false;
            for event in queue.current() {
                match event {
                    NetlinkEvent::NeighAdded(neigh) => {
                        changed |= self.kernel.insert(neigh.clone());
                    }
                    NetlinkEvent::NeighRemoved(neigh) => {
                        changed |= self.kernel.remove(neigh);
                    }
                    NetlinkEvent::RouteAdded(_) | NetlinkEvent::RouteRemoved(_) => {}
                }
            }
            if changed {
                let desired = ctx.node::<Neighbors>(&handles::neighbors())?.desired().clone();
                let already = Self::already_learned(ctx)?;
                self.reconcile(&desired, &already);
            }
            return Ok(if changed {
                HandlerOutcome::Updated
            } else {
                HandlerOutcome::Unchanged
            });
        }

        if *input == handles::neighbor_status() {
            let status = ctx.node::<SignalNode<u64>>(&handles::neighbor_status())?;
            let _ = status.get();
            let desired = ctx.node::<Neighbors>(&handles::neighbors())?.desired().clone();
            for neigh in &desired {
                self.kernel.insert(neigh.clone());
            }
            return Ok(HandlerOutcome::Unchanged);
        }

        if *input == handles::sb_ro() {
            return Ok(if self.has_pending() {
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
