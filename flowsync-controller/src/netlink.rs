//! Netlink bridge types. The watcher thread and the applier are
//! collaborators; the engine sees kernel state only through the notify
//! queue and its own write-completion signal.

use flowsync_types::errors::BoxedError;
use std::fmt::Debug;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelRoute {
    pub table: u32,
    pub prefix: String,
    pub nexthop: String,
    pub device: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelNeigh {
    pub ip: String,
    pub mac: String,
    pub device: String,
}

/// One kernel change observed by the watcher thread.
#[derive(Clone, Debug, PartialEq)]
pub enum NetlinkEvent {
    RouteAdded(KernelRoute),
    RouteRemoved(KernelRoute),
    NeighAdded(KernelNeigh),
    NeighRemoved(KernelNeigh),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RouteOp {
    Add(KernelRoute),
    Del(KernelRoute),
}

#[derive(Clone, Debug, PartialEq)]
pub enum NeighOp {
    Add(KernelNeigh),
    Del(KernelNeigh),
}

/// The kernel-facing side of the route/neighbor subsystem. Applying ops
/// returns a completion counter; the main loop feeds it back into the
/// status leaves so the diff-and-apply nodes converge without
/// oscillation.
pub trait NetlinkPort: Debug {
    fn apply_routes(&mut self, ops: &[RouteOp]) -> Result<u64, BoxedError>;
    fn apply_neighs(&mut self, ops: &[NeighOp]) -> Result<u64, BoxedError>;
}

/// In-process stand-in used by tests and by deployments without kernel
/// route exchange: ops are applied to an internal table and immediately
/// acknowledged.
#[derive(Debug, Default)]
pub struct LoopbackNetlink {
    pub routes: Vec<KernelRoute>,
    pub neighs: Vec<KernelNeigh>,
    seq: u64,
}

impl NetlinkPort for LoopbackNetlink {
    fn apply_routes(&mut self, ops: &[RouteOp]) -> Result<u64, BoxedError> {
        for op in ops {
            match op {
                RouteOp::Add(route) => {
                    if !self.routes.contains(route) {
                        self.routes.push(route.clone());
                    }
                }
                RouteOp::Del(route) => self.routes.retain(|r| r != route),
            }
        }
        self.seq += 1;
        Ok(self.seq)
    }

    fn apply_neighs(&mut self, ops: &[NeighOp]) -> Result<u64, BoxedError> {
        for op in ops {
            match op {
                NeighOp::Add(neigh) => {
                    if !self.neighs.contains(neigh) {
                        self.neighs.push(neigh.clone());
                    }
                }
                NeighOp::Del(neigh) => self.neighs.retain(|n| n != neigh),
            }
        }
        self.seq += 1;
        Ok(self.seq)
    }
}
