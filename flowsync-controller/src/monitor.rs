//! Monitor-condition manager: derives, per southbound table, the filter of
//! rows the server should ship, from the current local scope and chassis
//! identity. Re-invoked after every local-scope change; the `nb_cfg`
//! water-mark must not advance while submitted conditions are
//! unacknowledged.

use crate::tables::sb;
use flowsync_db::{Clause, Condition, ConditionBuilder, DbError, DbSession};
use flowsync_types::log::debug;
use flowsync_types::uuid::Uuid;
use std::collections::BTreeSet;

/// Port-binding types shipped regardless of datapath locality, because
/// they extend the local scope rather than being derived from it.
const ALWAYS_MONITORED_PORT_TYPES: [&str; 5] =
    ["patch", "chassisredirect", "external", "l2gateway", "localnet"];

/// The local scope as the condition builder consumes it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MonitorScope {
    pub local_datapaths: BTreeSet<Uuid>,
    /// Tunnel keys of the local datapaths, for tables keyed numerically.
    pub local_dp_keys: BTreeSet<i64>,
    /// Datapath groups intersecting the local set.
    pub dp_groups: BTreeSet<Uuid>,
}

#[derive(Debug, Default)]
pub struct MonitorCondMgr {
    last_scope: Option<MonitorScope>,
    last_chassis: Option<String>,
    monitor_all: bool,
}

impl MonitorCondMgr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes and submits all conditions. Returns the expected
    /// condition seqno after submission (unchanged when nothing moved).
    pub fn update(
        &mut self,
        session: &mut DbSession,
        chassis: Option<&str>,
        scope: &MonitorScope,
        monitor_all: bool,
    ) -> Result<u64, DbError> {
        if self.last_scope.as_ref() == Some(scope)
            && self.last_chassis.as_deref() == chassis
            && self.monitor_all == monitor_all
        {
            return Ok(session.expected_cond_seqno());
        }
        debug!(
            "monitor conditions: chassis={:?}, {} local datapaths, monitor_all={}",
            chassis,
            scope.local_datapaths.len(),
            monitor_all
        );

        let mut seqno = session.expected_cond_seqno();
        for table in sb::CONDITIONAL {
            let condition = if monitor_all {
                Condition::All
            } else {
                match chassis {
                    None => Self::startup_condition(table),
                    Some(chassis) => Self::scoped_condition(table, chassis, scope),
                }
            };
            seqno = session.set_condition(table, condition)?;
        }
        self.last_scope = Some(scope.clone());
        self.last_chassis = chassis.map(str::to_string);
        self.monitor_all = monitor_all;
        Ok(seqno)
    }

    /// Forces resubmission on the next update, e.g. after reconnection.
    pub fn invalidate(&mut self) {
        self.last_scope = None;
    }

    /// Before the chassis identity is known, tables whose absence would
    /// disrupt traffic are monitored permissively; the rest ship nothing.
    fn startup_condition(table: &str) -> Condition {
        if sb::STARTUP_BROAD.contains(&table) {
            Condition::All
        } else {
            Condition::None
        }
    }

    fn scoped_condition(table: &str, chassis: &str, scope: &MonitorScope) -> Condition {
        let mut b = ConditionBuilder::new();
        let dps = || scope.local_datapaths.iter().copied();
        match table {
            sb::PORT_BINDING => {
                b.clause(Clause::in_uuids("datapath", dps()));
                b.clause(Clause::eq("chassis", chassis));
                b.clause(Clause::in_strs("type", ALWAYS_MONITORED_PORT_TYPES));
            }
            sb::LOGICAL_FLOW => {
                b.clause(Clause::in_uuids("logical_datapath", dps()));
                b.clause(Clause::in_uuids(
                    "logical_dp_group",
                    scope.dp_groups.iter().copied(),
                ));
            }
            sb::FDB => {
                b.clause(Clause::In {
                    column: "dp_key".to_string(),
                    values: scope.local_dp_keys.iter().map(|k| (*k).into()).collect(),
                });
            }
            sb::LOAD_BALANCER => {
                b.clause(Clause::intersects_uuids("datapaths", dps()));
            }
            sb::CHASSIS_PRIVATE => {
                b.clause(Clause::eq("name", chassis));
            }
            sb::CHASSIS_TEMPLATE_VAR | sb::CONTROLLER_EVENT => {
                b.clause(Clause::eq("chassis", chassis));
            }
            sb::DNS => {
                b.clause(Clause::intersects_uuids("datapaths", dps()));
            }
            sb::MULTICAST_GROUP
            | sb::MAC_BINDING
            | sb::IP_MULTICAST
            | sb::IGMP_GROUP
            | sb::STATIC_MAC_BINDING
            | sb::ADVERTISED_ROUTE
            | sb::LEARNED_ROUTE
            | sb::ADVERTISED_MAC_BINDING => {
                b.clause(Clause::in_uuids("datapath", dps()));
            }
            _ => {
                b.match_all();
            }
        }
        b.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;
    use flowsync_db::Row;

    struct Harness {
        session: DbSession,
        _txn_rx: crossbeam::channel::Receiver<flowsync_db::TxnRequest>,
        _cond_rx: crossbeam::channel::Receiver<flowsync_db::CondRequest>,
        _msg_tx: crossbeam::channel::Sender<flowsync_db::DbMsg>,
    }

    fn session() -> Harness {
        let (msg_tx, msg_rx) = unbounded();
        let (txn_tx, txn_rx) = unbounded();
        let (cond_tx, cond_rx) = unbounded();
        Harness {
            session: DbSession::new("southbound", msg_rx, txn_tx, cond_tx),
            _txn_rx: txn_rx,
            _cond_rx: cond_rx,
            _msg_tx: msg_tx,
        }
    }

    #[test]
    fn test_startup_mode_is_broad_for_critical_tables() {
        let mut mgr = MonitorCondMgr::new();
        let mut h = session();
        mgr.update(&mut h.session, None, &MonitorScope::default(), false)
            .unwrap();
        assert_eq!(
            h.session.condition(sb::PORT_BINDING),
            Some(&Condition::All)
        );
        assert_eq!(
            h.session.condition(sb::LOGICAL_FLOW),
            Some(&Condition::None)
        );
    }

    #[test]
    fn test_scoped_conditions_select_local_rows() {
        let mut mgr = MonitorCondMgr::new();
        let mut h = session();
        let dp = Uuid::new_v4();
        let scope = MonitorScope {
            local_datapaths: [dp].into_iter().collect(),
            local_dp_keys: [5].into_iter().collect(),
            dp_groups: BTreeSet::new(),
        };
        mgr.update(&mut h.session, Some("hv1"), &scope, false).unwrap();

        let cond = h.session.condition(sb::PORT_BINDING).unwrap();
        let on_dp = Row::new(Uuid::new_v4()).with("datapath", dp.to_string());
        let ours = Row::new(Uuid::new_v4()).with("chassis", "hv1");
        let patch = Row::new(Uuid::new_v4()).with("type", "patch");
        let foreign = Row::new(Uuid::new_v4()).with("chassis", "hv2");
        assert!(cond.matches(&on_dp));
        assert!(cond.matches(&ours));
        assert!(cond.matches(&patch));
        assert!(!cond.matches(&foreign));
    }

    #[test]
    fn test_idempotent_update_keeps_seqno() {
        let mut mgr = MonitorCondMgr::new();
        let mut h = session();
        let scope = MonitorScope::default();
        let s1 = mgr.update(&mut h.session, Some("hv1"), &scope, false).unwrap();
        let s2 = mgr.update(&mut h.session, Some("hv1"), &scope, false).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_monitor_all_disables_conditions() {
        let mut mgr = MonitorCondMgr::new();
        let mut h = session();
        mgr.update(&mut h.session, Some("hv1"), &MonitorScope::default(), true)
            .unwrap();
        for table in sb::CONDITIONAL {
            assert_eq!(h.session.condition(table), Some(&Condition::All));
        }
    }
}
