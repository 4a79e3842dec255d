//! Interface-status manager: serializes the lifecycle of a locally bound
//! interface through claimed → installed → ready (and released → removed
//! on teardown), bound to actual rule installation through the OpenFlow
//! sequence-number subsystem.

use flowsync_ofctrl::{SeqnoSubsys, SeqnoType};
use flowsync_types::log::{debug, info};
use flowsync_types::uuid::Uuid;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IfaceState {
    /// Chassis claim written (or pending) in the southbound.
    Claimed,
    /// Flows for the port are in the desired table and handed to the
    /// switch; waiting for the barrier acknowledgment.
    Installed,
    /// The switch confirmed installation; `up` can be reported.
    Ready,
    Released,
    Removed,
}

#[derive(Clone, Debug)]
struct IfaceRec {
    state: IfaceState,
    port_binding: Uuid,
    /// Waits for an explicit activation before flows go live.
    requires_activation: bool,
    /// Seqno at which this interface's flows were handed to the switch.
    installed_at: Option<u64>,
}

/// A southbound status write the manager wants performed.
#[derive(Clone, Debug, PartialEq)]
pub enum StatusUpdate {
    SetUp { port_binding: Uuid, up: bool },
}

#[derive(Debug)]
pub struct IfStatusMgr {
    ifaces: BTreeMap<String, IfaceRec>,
    seqno_type: SeqnoType,
    /// Monotonic counter handed to `want_ack`; one tick per flow push.
    seqno: u64,
    pending_updates: Vec<StatusUpdate>,
    /// Ports whose activation completed and that the physical-flow node
    /// must pick up.
    newly_activated: Vec<String>,
}

impl IfStatusMgr {
    pub fn new(seqno: &mut SeqnoSubsys) -> Self {
        Self {
            ifaces: BTreeMap::new(),
            seqno_type: seqno.register_type(),
            seqno: 0,
            pending_updates: Vec::new(),
            newly_activated: Vec::new(),
        }
    }

    pub fn state_of(&self, name: &str) -> Option<IfaceState> {
        self.ifaces.get(name).map(|rec| rec.state)
    }

    pub fn claim(&mut self, name: &str, port_binding: Uuid, requires_activation: bool) {
        let rec = self.ifaces.entry(name.to_string()).or_insert(IfaceRec {
            state: IfaceState::Claimed,
            port_binding,
            requires_activation,
            installed_at: None,
        });
        if rec.state == IfaceState::Released || rec.state == IfaceState::Removed {
            info!("if-status: re-claiming {name}");
            rec.state = IfaceState::Claimed;
            rec.installed_at = None;
        }
        rec.port_binding = port_binding;
        rec.requires_activation = requires_activation;
    }

    pub fn release(&mut self, name: &str) {
        if let Some(rec) = self.ifaces.get_mut(name) {
            if rec.state != IfaceState::Released && rec.state != IfaceState::Removed {
                debug!("if-status: releasing {name}");
                rec.state = IfaceState::Released;
                self.pending_updates.push(StatusUpdate::SetUp {
                    port_binding: rec.port_binding,
                    up: false,
                });
            }
        }
    }

    /// The activation packet for a deferred port was seen; flows may now
    /// be installed for it.
    pub fn activate(&mut self, name: &str) {
        if let Some(rec) = self.ifaces.get_mut(name) {
            if rec.requires_activation {
                rec.requires_activation = false;
                self.newly_activated.push(name.to_string());
            }
        }
    }

    /// Called after the desired flows were handed to the switch; arms a
    /// sequence-number request binding `Ready` to actual installation.
    pub fn flows_pushed(&mut self, seqno_subsys: &mut SeqnoSubsys) {
        let mut armed = false;
        self.seqno += 1;
        for rec in self.ifaces.values_mut() {
            if rec.state == IfaceState::Claimed && !rec.requires_activation {
                rec.state = IfaceState::Installed;
                rec.installed_at = Some(self.seqno);
                armed = true;
            }
        }
        if armed {
            seqno_subsys.want_ack(self.seqno_type, self.seqno);
        }
    }

    /// Folds switch acknowledgments; interfaces whose installation seqno
    /// is covered become ready and report `up`.
    pub fn run(&mut self, seqno_subsys: &SeqnoSubsys) {
        let Some(acked) = seqno_subsys.acked(self.seqno_type) else {
            return;
        };
        for (name, rec) in self.ifaces.iter_mut() {
            if rec.state == IfaceState::Installed
                && rec.installed_at.is_some_and(|at| at <= acked)
            {
                info!("if-status: {name} is ready");
                rec.state = IfaceState::Ready;
                self.pending_updates.push(StatusUpdate::SetUp {
                    port_binding: rec.port_binding,
                    up: true,
                });
            }
        }
        self.ifaces
            .retain(|_, rec| rec.state != IfaceState::Removed);
        for rec in self.ifaces.values_mut() {
            if rec.state == IfaceState::Released {
                rec.state = IfaceState::Removed;
            }
        }
    }

    pub fn take_pending_updates(&mut self) -> Vec<StatusUpdate> {
        std::mem::take(&mut self.pending_updates)
    }

    pub fn take_newly_activated(&mut self) -> Vec<String> {
        std::mem::take(&mut self.newly_activated)
    }

    pub fn dump(&self) -> Vec<(String, IfaceState)> {
        self.ifaces
            .iter()
            .map(|(name, rec)| (name.clone(), rec.state))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsync_ofctrl::{OfConn, OfError, OfMsg};

    #[derive(Debug, Default)]
    struct FakeConn {
        sent: Vec<OfMsg>,
    }

    impl OfConn for FakeConn {
        fn connected(&self) -> bool {
            true
        }
        fn backlog(&self) -> usize {
            0
        }
        fn send(&mut self, msg: OfMsg) -> Result<(), OfError> {
            self.sent.push(msg);
            Ok(())
        }
    }

    #[test]
    fn test_claimed_to_ready_via_seqno() {
        let mut seqno = SeqnoSubsys::new();
        let mut mgr = IfStatusMgr::new(&mut seqno);
        let pb = Uuid::new_v4();
        mgr.claim("lp1", pb, false);
        assert_eq!(mgr.state_of("lp1"), Some(IfaceState::Claimed));

        mgr.flows_pushed(&mut seqno);
        assert_eq!(mgr.state_of("lp1"), Some(IfaceState::Installed));

        // Not ready until the switch acknowledges the barrier.
        mgr.run(&seqno);
        assert_eq!(mgr.state_of("lp1"), Some(IfaceState::Installed));

        let mut conn = FakeConn::default();
        seqno.run(&mut conn).unwrap();
        let OfMsg::Barrier { xid } = conn.sent[0] else {
            panic!("expected barrier");
        };
        seqno.ack_barrier(xid);
        mgr.run(&seqno);
        assert_eq!(mgr.state_of("lp1"), Some(IfaceState::Ready));
        assert_eq!(
            mgr.take_pending_updates(),
            vec![StatusUpdate::SetUp {
                port_binding: pb,
                up: true
            }]
        );
    }

    #[test]
    fn test_activation_gate() {
        let mut seqno = SeqnoSubsys::new();
        let mut mgr = IfStatusMgr::new(&mut seqno);
        mgr.claim("lp-mig", Uuid::new_v4(), true);
        mgr.flows_pushed(&mut seqno);
        // Still claimed: activation has not happened.
        assert_eq!(mgr.state_of("lp-mig"), Some(IfaceState::Claimed));

        mgr.activate("lp-mig");
        assert_eq!(mgr.take_newly_activated(), vec!["lp-mig".to_string()]);
        mgr.flows_pushed(&mut seqno);
        assert_eq!(mgr.state_of("lp-mig"), Some(IfaceState::Installed));
    }

    #[test]
    fn test_release_reports_down() {
        let mut seqno = SeqnoSubsys::new();
        let mut mgr = IfStatusMgr::new(&mut seqno);
        let pb = Uuid::new_v4();
        mgr.claim("lp1", pb, false);
        mgr.release("lp1");
        assert_eq!(mgr.state_of("lp1"), Some(IfaceState::Released));
        assert_eq!(
            mgr.take_pending_updates(),
            vec![StatusUpdate::SetUp {
                port_binding: pb,
                up: false
            }]
        );
    }
}
