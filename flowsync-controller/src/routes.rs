//! Route exchange: southbound advertised routes projected onto the kernel
//! routing table, and kernel routes on mapped interfaces learned back into
//! the southbound. The *notify* leaf flips when the watcher observes a
//! kernel change; the *status* leaf flips when our own netlink writes
//! complete; the diff-and-apply node in between converges without
//! oscillating.

use crate::global_config::GlobalConfig;
use crate::handles;
use crate::inputs::{DbTableNode, QueueNode, SignalNode};
use crate::netlink::{KernelRoute, NetlinkEvent, RouteOp};
use crate::runtime_data::RuntimeData;
use crate::tables::{self, sb};
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_types::node::NodeHandle;
use flowsync_types::uuid::Uuid;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

/// Desired kernel routes derived from the advertised-route table filtered
/// to local datapaths and the configured port mapping.
#[derive(Debug, Default)]
pub struct Routes {
    desired: BTreeSet<KernelRoute>,
    /// Route -> originating advertised-route row, for learned-route
    /// suppression and dumps.
    origins: BTreeMap<KernelRoute, Uuid>,
}

impl Routes {
    pub fn desired(&self) -> &BTreeSet<KernelRoute> {
        &self.desired
    }

    pub fn origin_of(&self, route: &KernelRoute) -> Option<Uuid> {
        self.origins.get(route).copied()
    }
}

impl Node for Routes {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let rt = ctx.node::<RuntimeData>(&handles::runtime_data())?;
        let config = ctx
            .node::<GlobalConfig>(&handles::global_config())?
            .config();
        let table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::ADVERTISED_ROUTE))?
            .table();

        let mapping: BTreeMap<&str, &str> = config
            .routing_port_mapping
            .iter()
            .map(|(lport, dev)| (lport.as_str(), dev.as_str()))
            .collect();

        let mut desired = BTreeSet::new();
        let mut origins = BTreeMap::new();
        for row in table.iter() {
            let Some(dp) = row.uuid_col("datapath") else {
                continue;
            };
            if !rt.is_local_datapath(&dp) {
                continue;
            }
            let Some(lport) = row.str("logical_port") else {
                continue;
            };
            let Some(device) = mapping.get(lport) else {
                continue;
            };
            let Some(prefix) = row.str("ip_prefix") else {
                continue;
            };
            let route = KernelRoute {
                table: 254,
                prefix: prefix.to_string(),
                nexthop: row.str("nexthop").unwrap_or("").to_string(),
                device: device.to_string(),
            };
            origins.insert(route.clone(), row.uuid());
            desired.insert(route);
        }

        let changed = desired != self.desired;
        self.desired = desired;
        self.origins = origins;
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
        // Declared incremental, but the incremental path has not been
        // proved correct; fall back to recompute for now.
        Ok(HandlerOutcome::Unhandled)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A learned-route mutation for the southbound.
#[derive(Clone, Debug, PartialEq)]
pub enum LearnedRouteOp {
    Add(KernelRoute),
    Del(KernelRoute),
}

/// Diff-and-apply between the desired routes and the kernel view.
#[derive(Debug, Default)]
pub struct RouteSync {
    kernel: BTreeSet<KernelRoute>,
    pending_kernel_ops: Vec<RouteOp>,
    pending_learned: Vec<LearnedRouteOp>,
    /// Devices we learn on; kernel routes elsewhere are not ours to touch.
    mapped_devices: BTreeSet<String>,
}

impl RouteSync {
    pub fn kernel_view(&self) -> &BTreeSet<KernelRoute> {
        &self.kernel
    }

    /// Kernel ops to hand to the netlink port; drained by the main loop.
    pub fn take_kernel_ops(&mut self) -> Vec<RouteOp> {
        std::mem::take(&mut self.pending_kernel_ops)
    }

    /// Learned-route mutations for the commit pass.
    pub fn take_learned(&mut self) -> Vec<LearnedRouteOp> {
        std::mem::take(&mut self.pending_learned)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_kernel_ops.is_empty() || !self.pending_learned.is_empty()
    }

    fn reconcile(
        &mut self,
        desired: &BTreeSet<KernelRoute>,
        already_learned: &BTreeSet<(String, String)>,
    ) -> bool {
        let mut changed = false;
        for route in desired {
            if !self.kernel.contains(route) {
                self.pending_kernel_ops.push(RouteOp::Add(route.clone()));
                changed = true;
            }
        }
        for route in &self.kernel {
            if !self.mapped_devices.contains(&route.device) || desired.contains(route) {
                continue;
            }
            // Not ours and present in the kernel: learn it upward rather
            // than deleting, unless the southbound already has it.
            if already_learned.contains(&(route.prefix.clone(), route.nexthop.clone())) {
                continue;
            }
            let op = LearnedRouteOp::Add(route.clone());
            if !self.pending_learned.contains(&op) {
                self.pending_learned.push(op);
                changed = true;
            }
        }
        changed
    }

    fn already_learned(ctx: &Context) -> Result<BTreeSet<(String, String)>, EngineError> {
        let table = ctx
            .node::<crate::inputs::DbTableNode>(&tables::sb_node(sb::LEARNED_ROUTE))?
            .table();
        Ok(table
            .iter()
            .filter_map(|row| {
                Some((
                    row.str("ip_prefix")?.to_string(),
                    row.str("nexthop").unwrap_or("").to_string(),
                ))
            })
            .collect())
    }
}

impl Node for RouteSync {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let routes = ctx.node::<Routes>(&handles::routes())?;
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
        let changed = self.reconcile(routes.desired(), &already);
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
        if *input == handles::routes_notify() {
            let queue = ctx.node::<QueueNode<NetlinkEvent>>(&handles::routes_notify())?;
            let mut changed = false;
            for event in queue.current() {
                match event {
                    NetlinkEvent::RouteAdded(route) => {
                        changed |= self.kernel.insert(route.clone());
                    }
                    NetlinkEvent::RouteRemoved(route) => {
                        changed |= self.kernel.remove(route);
                    }
                    NetlinkEvent::NeighAdded(_) | NetlinkEvent::NeighRemoved(_) => {}
                }
            }
            if changed {
                let desired = ctx.node::<Routes>(&handles::routes())?.desired().clone();
                let already = Self::already_learned(ctx)?;
                self.reconcile(&desired, &already);
            }
            return Ok(if changed {
                HandlerOutcome::Updated
            } else {
                HandlerOutcome::Unchanged
            });
        }

        if *input == handles::route_status() {
            // Our own writes completed; fold them into the kernel view so
            // the next diff is quiet.
            let status = ctx.node::<SignalNode<u64>>(&handles::route_status())?;
            let _ = status.get();
            let desired = ctx.node::<Routes>(&handles::routes())?.desired().clone();
            for route in &desired {
                self.kernel.insert(route.clone());
            }
            return Ok(HandlerOutcome::Unchanged);
        }

        if *input == handles::sb_ro() {
            // Writability moved: surface pending learned routes again so
            // the commit pass drains them.
            return Ok(if self.has_pending() {
                HandlerOutcome::Updated
            } else {
                HandlerOutcome::Unchanged
            });
        }

        if *input == handles::routes() {
            // See Routes::handle_change: preserved as recompute until the
            // incremental path is proved.
            return Ok(HandlerOutcome::Unhandled);
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
