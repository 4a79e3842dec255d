//! Transaction & commit coordinator: collects the mutations the writer
//! nodes accumulated (chassis claims, interface status, ct-zones, learned
//! routes/neighbors, `nb_cfg` bookkeeping), sequences the two transaction
//! streams, and owns the `nb_cfg` machinery — there is exactly one chassis
//! per process, and this struct is its single home.

use crate::ct_zones::{CtZones, ZONE_KEY_PREFIX};
use crate::errors::ControllerError;
use crate::global_config::GlobalConfig;
use crate::handles;
use crate::ifstatus::{IfStatusMgr, StatusUpdate};
use crate::inputs::DbTableNode;
use crate::neighbors::{LearnedNeighOp, NeighborSync};
use crate::routes::{LearnedRouteOp, RouteSync};
use crate::runtime_data::RuntimeData;
use crate::tables::{self, index, ovs, sb};
use flowsync_db::{DbSession, IndexKey, Row, Txn};
use flowsync_engine::Engine;
use flowsync_ofctrl::{SeqnoSubsys, SeqnoType};
use flowsync_types::log::{debug, info};
use flowsync_types::serde_json::json;
use flowsync_types::uuid::Uuid;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub sb_txn_sent: bool,
    pub ovs_txn_sent: bool,
    pub nb_cfg_written: Option<i64>,
}

#[derive(Debug)]
pub struct CommitCoordinator {
    nb_cfg_seqno_type: SeqnoType,
    /// Highest nb_cfg written back to chassis-private.
    cur_nb_cfg: i64,
    /// Highest nb_cfg for which an installation ack was requested.
    requested_nb_cfg: i64,
    /// Operator-injected delay before reporting (debug command).
    delay_report_ms: i64,
    /// Ack seen, write-back withheld until the clock passes this.
    report_after_ms: Option<i64>,
}

impl CommitCoordinator {
    pub fn new(seqno: &mut SeqnoSubsys) -> Self {
        Self {
            nb_cfg_seqno_type: seqno.register_type(),
            cur_nb_cfg: 0,
            requested_nb_cfg: 0,
            delay_report_ms: 0,
            report_after_ms: None,
        }
    }

    pub fn cur_nb_cfg(&self) -> i64 {
        self.cur_nb_cfg
    }

    pub fn set_delay_report(&mut self, seconds: i64) {
        self.delay_report_ms = seconds.saturating_mul(1000);
    }

    /// Restores the water-mark from the chassis-private row at startup, so
    /// a restart does not re-announce an older nb_cfg.
    pub fn restore_nb_cfg(&mut self, nb_cfg: i64) {
        self.cur_nb_cfg = self.cur_nb_cfg.max(nb_cfg);
        self.requested_nb_cfg = self.requested_nb_cfg.max(nb_cfg);
    }

    /// Phase 1 of `nb_cfg` propagation: ask the switch for an ack of the
    /// current northbound water-mark, but only when the monitor-condition
    /// acknowledgment is current (rows implied by this nb_cfg may not have
    /// arrived otherwise).
    pub fn request_nb_cfg_ack(
        &mut self,
        engine: &Engine,
        sb: &DbSession,
        seqno: &mut SeqnoSubsys,
    ) -> Result<(), ControllerError> {
        if self.cur_nb_cfg == 0 {
            // Restart stability: pick up the water-mark this chassis had
            // already announced rather than re-reporting an older one.
            let chassis = engine
                .node::<GlobalConfig>(&handles::global_config())?
                .chassis_name()
                .to_string();
            let private_table = engine
                .node::<DbTableNode>(&tables::sb_node(sb::CHASSIS_PRIVATE))?
                .table();
            if let Some(row) =
                private_table.row_by_index(index::BY_NAME, &IndexKey::str(chassis))?
            {
                if let Some(previous) = row.integer("nb_cfg") {
                    self.restore_nb_cfg(previous);
                }
            }
        }
        let sb_global = engine
            .node::<DbTableNode>(&tables::sb_node(sb::SB_GLOBAL))?
            .table();
        let Some(nb_cfg) = sb_global.iter().next().and_then(|row| row.integer("nb_cfg")) else {
            return Ok(());
        };
        if !sb.conditions_acked() {
            debug!("nb_cfg {nb_cfg} ignored, monitor conditions not acknowledged");
            return Ok(());
        }
        if nb_cfg > self.requested_nb_cfg {
            self.requested_nb_cfg = nb_cfg;
            seqno.want_ack(self.nb_cfg_seqno_type, nb_cfg as u64);
        }
        Ok(())
    }

    /// Phase 2: once the switch confirmed rule installation up to an
    /// nb_cfg, mirror it (with a timestamp) to chassis-private and the
    /// bridge external-ids.
    fn collect_nb_cfg_write(
        &mut self,
        engine: &Engine,
        seqno: &SeqnoSubsys,
        chassis: &str,
        br_int: Option<Uuid>,
        now_ms: i64,
        sb_txn: &mut Txn,
        ovs_txn: &mut Txn,
    ) -> Result<Option<i64>, ControllerError> {
        let Some(acked) = seqno.acked(self.nb_cfg_seqno_type) else {
            return Ok(None);
        };
        let acked = acked as i64;
        if acked <= self.cur_nb_cfg {
            return Ok(None);
        }
        if self.delay_report_ms > 0 {
            let ready = *self
                .report_after_ms
                .get_or_insert(now_ms + self.delay_report_ms);
            if now_ms < ready {
                return Ok(None);
            }
        }
        self.report_after_ms = None;

        let private_table = engine
            .node::<DbTableNode>(&tables::sb_node(sb::CHASSIS_PRIVATE))?
            .table();
        let Some(private_row) =
            private_table.row_by_index(index::BY_NAME, &IndexKey::str(chassis))?
        else {
            return Ok(None);
        };
        sb_txn.update(
            sb::CHASSIS_PRIVATE,
            private_row.uuid(),
            [
                ("nb_cfg".to_string(), json!(acked)),
                ("nb_cfg_timestamp".to_string(), json!(now_ms)),
            ]
            .into_iter()
            .collect(),
        );
        if let Some(bridge) = br_int {
            ovs_txn.set_key(
                ovs::BRIDGE,
                bridge,
                "external_ids",
                "ovn-nb-cfg",
                acked.to_string(),
            );
            ovs_txn.set_key(
                ovs::BRIDGE,
                bridge,
                "external_ids",
                "ovn-nb-cfg-ts",
                now_ms.to_string(),
            );
        }
        info!("nb_cfg {} installed and reported", acked);
        self.cur_nb_cfg = acked;
        Ok(Some(acked))
    }

    /// Ensures this chassis is registered southbound (chassis row plus its
    /// encaps), as configured on the open-vswitch row.
    fn collect_chassis_registration(
        engine: &Engine,
        config: &GlobalConfig,
        sb_txn: &mut Txn,
    ) -> Result<(), ControllerError> {
        let chassis_table = engine
            .node::<DbTableNode>(&tables::sb_node(sb::CHASSIS))?
            .table();
        let chassis = config.chassis_name();
        if chassis.is_empty()
            || chassis_table
                .row_by_index(index::BY_NAME, &IndexKey::str(chassis))?
                .is_some()
        {
            return Ok(());
        }
        let encap_ips = &config.config().encap_ips;
        let mut encap_uuids = Vec::new();
        for ip in encap_ips {
            let encap_uuid = Uuid::new_v4();
            sb_txn.insert(
                sb::ENCAP,
                Row::new(encap_uuid)
                    .with("type", config.config().encap_type.clone())
                    .with("ip", ip.clone())
                    .with("chassis_name", chassis),
            );
            encap_uuids.push(encap_uuid.to_string());
        }
        info!("registering chassis {chassis} with {} encaps", encap_uuids.len());
        sb_txn.insert(
            sb::CHASSIS,
            Row::new(Uuid::new_v4())
                .with("name", chassis)
                .with("encaps", json!(encap_uuids))
                .with(
                    "other_config",
                    json!({
                        "ovn-bridge-mappings": "",
                        "datapath-type": config.config().datapath_type.clone(),
                        "ovn-transport-zones": config.config().transport_zones.join(","),
                    }),
                ),
        );
        sb_txn.insert(
            sb::CHASSIS_PRIVATE,
            Row::new(Uuid::new_v4())
                .with("name", chassis)
                .with("chassis", chassis)
                .with("nb_cfg", 0),
        );
        Ok(())
    }

    /// Builds and sends both transactions for one completed iteration.
    /// `ovs_seed` carries mutations composed outside the coordinator
    /// (integration-bridge setup). Writer-node state stays pending inside
    /// the nodes until the reply confirms; a `TryAgain` reply forces a
    /// recompute upstream.
    pub fn commit_with_seed(
        &mut self,
        engine: &mut Engine,
        sb_session: &mut DbSession,
        ovs_session: &mut DbSession,
        seqno: &mut SeqnoSubsys,
        ifmgr: &mut IfStatusMgr,
        now_ms: i64,
        ovs_seed: Txn,
    ) -> Result<CommitOutcome, ControllerError> {
        let mut outcome = CommitOutcome::default();
        let (chassis, br_int) = {
            let config = engine.node::<GlobalConfig>(&handles::global_config())?;
            (config.chassis_name().to_string(), config.br_int())
        };

        let mut sb_txn = Txn::new();
        let mut ovs_txn = ovs_seed;

        if sb_session.can_write() {
            let config = engine.node::<GlobalConfig>(&handles::global_config())?;
            Self::collect_chassis_registration(engine, config, &mut sb_txn)?;

            // Chassis claims from the local-scope node.
            let rt = engine.node::<RuntimeData>(&handles::runtime_data())?;
            for claim in rt.pending_claims() {
                debug!("claiming {} for {}", claim.logical_port, chassis);
                sb_txn.update_column(
                    sb::PORT_BINDING,
                    claim.port_binding,
                    "chassis",
                    chassis.clone(),
                );
            }

            // Interface status write-backs.
            for update in ifmgr.take_pending_updates() {
                match update {
                    StatusUpdate::SetUp { port_binding, up } => {
                        sb_txn.update_column(sb::PORT_BINDING, port_binding, "up", up);
                    }
                }
            }

            // Learned routes and neighbors.
            let learned_routes = engine
                .node_mut::<RouteSync>(&handles::route_sync())?
                .take_learned();
            for op in learned_routes {
                match op {
                    LearnedRouteOp::Add(route) => {
                        sb_txn.insert(
                            sb::LEARNED_ROUTE,
                            Row::new(Uuid::new_v4())
                                .with("ip_prefix", route.prefix)
                                .with("nexthop", route.nexthop)
                                .with("logical_port", route.device),
                        );
                    }
                    LearnedRouteOp::Del(_) => {}
                }
            }
            let learned_neighs = engine
                .node_mut::<NeighborSync>(&handles::neighbor_sync())?
                .take_learned();
            for op in learned_neighs {
                match op {
                    LearnedNeighOp::Add(neigh) => {
                        sb_txn.insert(
                            sb::MAC_BINDING,
                            Row::new(Uuid::new_v4())
                                .with("ip", neigh.ip)
                                .with("mac", neigh.mac)
                                .with("logical_port", neigh.device),
                        );
                    }
                    LearnedNeighOp::Del(_) => {}
                }
            }
        }

        if ovs_session.can_write() {
            // Zone assignments are persisted with the next virtual-switch
            // transaction, atomically with whatever else it carries.
            if let Some(bridge) = br_int {
                let zone_ops = engine
                    .node_mut::<CtZones>(&handles::ct_zones())?
                    .take_pending();
                for op in zone_ops {
                    let key = format!("{ZONE_KEY_PREFIX}{}", op.name);
                    if op.add {
                        ovs_txn.set_key(
                            ovs::BRIDGE,
                            bridge,
                            "external_ids",
                            key,
                            op.zone.to_string(),
                        );
                    } else {
                        ovs_txn.delete_key(ovs::BRIDGE, bridge, "external_ids", key);
                    }
                }
            }
        }

        // nb_cfg write-back spans both transactions.
        if sb_session.can_write() {
            outcome.nb_cfg_written = self.collect_nb_cfg_write(
                engine, seqno, &chassis, br_int, now_ms, &mut sb_txn, &mut ovs_txn,
            )?;
        }

        if !sb_txn.is_empty() && sb_session.can_write() {
            sb_session.send_txn(sb_txn)?;
            outcome.sb_txn_sent = true;
        }
        if !ovs_txn.is_empty() && ovs_session.can_write() {
            ovs_session.send_txn(ovs_txn)?;
            outcome.ovs_txn_sent = true;
        }
        Ok(outcome)
    }
}
