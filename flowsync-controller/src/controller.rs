//! The daemon driver: owns the engine, both database sessions, the
//! OpenFlow channel, the netlink bridges, the interface-status manager and
//! the commit coordinator, and runs one cooperative iteration at a time.

use crate::bridge;
use crate::commit::{CommitCoordinator, CommitOutcome};
use crate::config::{resolve_chassis_name, Config};
use crate::ct_zones::CtZones;
use crate::errors::ControllerError;
use crate::global_config::GlobalConfig;
use crate::handles;
use crate::ifstatus::IfStatusMgr;
use crate::inputs::{DbTableNode, EngineTableSink, QueueNode, SignalNode};
use crate::lflow_output::LflowOutput;
use crate::monitor::{MonitorCondMgr, MonitorScope};
use crate::neighbors::NeighborSync;
use crate::netlink::{NetlinkEvent, NetlinkPort};
use crate::pflow_output::PflowOutput;
use crate::routes::RouteSync;
use crate::runtime_data::RuntimeData;
use crate::tables::{self, ovs, sb};
use crate::unixctl::{UnixctlRequest, UnixctlServer};
use flowsync_db::{DbSession, Txn, TxnStatus};
use flowsync_engine::{Engine, RunResult};
use flowsync_ofctrl::{put, InstalledFlowTable, OfConn, SeqnoSubsys};
use flowsync_types::log::{debug, info, warn};
use flowsync_types::ratelimit::LogRateLimiter;
use flowsync_types::uuid::Uuid;
use crossbeam::channel::Receiver;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Inbound events from the OpenFlow channel (delivered by the transport
/// or, in tests, by the fake switch).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum OfEvent {
    Connected,
    Disconnected,
    BarrierAck(u64),
    /// The switch saw the activation packet of a migration-gated port.
    PortActivated(String),
}

/// How one call to `run_once` ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IterationStatus {
    Completed,
    Canceled,
    Paused,
    VersionMismatch,
}

pub struct ControllerOptions {
    pub chassis: Option<String>,
    pub sysconfdir: PathBuf,
    pub unixctl: Option<UnixctlServer>,
}

pub struct Controller {
    pub engine: Engine,
    sb: DbSession,
    ovs: DbSession,
    of_conn: Box<dyn OfConn>,
    of_events: Receiver<OfEvent>,
    installed: InstalledFlowTable,
    seqno: SeqnoSubsys,
    coordinator: CommitCoordinator,
    ifmgr: IfStatusMgr,
    monitor: MonitorCondMgr,
    netlink: Box<dyn NetlinkPort>,
    netlink_events: Receiver<NetlinkEvent>,
    unixctl: Option<UnixctlServer>,
    cli_chassis: Option<String>,
    sysconfdir: PathBuf,
    chassis_resolved: bool,
    version_mismatch_last: bool,
    paused: bool,
    exiting: bool,
    startup_ts_ms: i64,
    injected_packets: Vec<String>,
    loop_log_limiter: LogRateLimiter,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Engine,
        sb: DbSession,
        ovs: DbSession,
        of_conn: Box<dyn OfConn>,
        of_events: Receiver<OfEvent>,
        netlink: Box<dyn NetlinkPort>,
        netlink_events: Receiver<NetlinkEvent>,
        options: ControllerOptions,
    ) -> Self {
        let mut seqno = SeqnoSubsys::new();
        let coordinator = CommitCoordinator::new(&mut seqno);
        let ifmgr = IfStatusMgr::new(&mut seqno);
        Self {
            engine,
            sb,
            ovs,
            of_conn,
            of_events,
            installed: InstalledFlowTable::new(),
            seqno,
            coordinator,
            ifmgr,
            monitor: MonitorCondMgr::new(),
            netlink,
            netlink_events,
            unixctl: options.unixctl,
            cli_chassis: options.chassis,
            sysconfdir: options.sysconfdir,
            chassis_resolved: false,
            version_mismatch_last: false,
            paused: false,
            exiting: false,
            startup_ts_ms: now_ms(),
            injected_packets: Vec::new(),
            loop_log_limiter: LogRateLimiter::new(5, 30),
        }
    }

    pub fn exiting(&self) -> bool {
        self.exiting
    }

    pub fn sb_session(&self) -> &DbSession {
        &self.sb
    }

    pub fn ovs_session(&self) -> &DbSession {
        &self.ovs
    }

    pub fn ifmgr(&self) -> &IfStatusMgr {
        &self.ifmgr
    }

    pub fn seqno(&mut self) -> &mut SeqnoSubsys {
        &mut self.seqno
    }

    pub fn installed(&self) -> &InstalledFlowTable {
        &self.installed
    }

    pub fn injected_packets(&self) -> &[String] {
        &self.injected_packets
    }

    /// The daemon main loop: iterate, then block on the inputs until
    /// something is ready or the probe interval elapses.
    pub fn run(&mut self) -> Result<(), ControllerError> {
        info!("flowsyncd entering main loop");
        while !self.exiting {
            self.run_once()?;
            self.poll_block(Duration::from_millis(500));
        }
        if self.current_config()?.cleanup_on_exit && self.of_conn.connected() {
            info!("draining local flows on exit");
            let empty = flowsync_ofctrl::DesiredFlowTable::new();
            put(&[&empty], &mut self.installed, self.of_conn.as_mut())?;
        }
        info!("flowsyncd exiting");
        Ok(())
    }

    /// Waits for any input to become ready, the suspension point between
    /// iterations.
    fn poll_block(&self, timeout: Duration) {
        let mut select = crossbeam::channel::Select::new();
        select.recv(self.sb.inbox());
        select.recv(self.ovs.inbox());
        select.recv(&self.of_events);
        select.recv(&self.netlink_events);
        if let Some(unixctl) = &self.unixctl {
            select.recv(unixctl.receiver());
        }
        // Readiness only; the messages themselves are drained at the top
        // of the next iteration.
        let _ = select.ready_timeout(timeout);
    }

    /// One iteration of the incremental engine plus its input and output
    /// phases.
    pub fn run_once(&mut self) -> Result<IterationStatus, ControllerError> {
        let now = now_ms();

        // Control surface first: an operator command may pause, resume or
        // force the iteration below.
        self.dispatch_unixctl();
        if self.paused {
            return Ok(IterationStatus::Paused);
        }

        // Inbound events, in fixed order: switch, kernel, virtual-switch
        // database, southbound database.
        self.drain_of_events();
        self.drain_netlink_events()?;
        self.drain_db_sessions()?;
        self.ifmgr.run(&self.seqno);

        self.resolve_identity();
        if !self.northd_version_ok()? {
            if !self.version_mismatch_last {
                self.version_mismatch_last = true;
            }
            return Ok(IterationStatus::VersionMismatch);
        }
        if self.version_mismatch_last {
            // Versions re-converged; nothing incremental survived the gap.
            self.version_mismatch_last = false;
            self.engine.trigger_recompute("northd version converged");
        }

        // Feed the externally computed leaves.
        let read_only = !self.sb.can_write();
        self.engine
            .node_mut::<SignalNode<bool>>(&handles::sb_ro())?
            .set(read_only);
        let of_up = self.of_conn.connected();
        self.engine
            .node_mut::<SignalNode<bool>>(&handles::of_connected())?
            .set(of_up);
        self.engine
            .node_mut::<LflowOutput>(&handles::lflow_output())?
            .set_clock(now);
        for name in self.ifmgr.take_newly_activated() {
            self.engine
                .node_mut::<QueueNode<String>>(&handles::activated_ports())?
                .push(name);
        }

        let recompute_allowed = self.sb.can_write() && self.ovs.can_write();
        let result = self.engine.run(recompute_allowed)?;
        if let RunResult::Canceled { node } = result {
            if self.loop_log_limiter.check() {
                info!("iteration canceled at {node}, recompute forced");
            }
            self.clear_input_tracked()?;
            return Ok(IterationStatus::Canceled);
        }

        // Configuration changes reach the cache tuning knobs here; the
        // nodes that depend on config recompute through their edges.
        if self.engine.node_changed(&handles::global_config())? {
            let cache_config = self.current_config()?.lflow_cache;
            self.engine
                .node_mut::<LflowOutput>(&handles::lflow_output())?
                .reconfigure_cache(cache_config);
        }

        // Output phase: monitor conditions, interface lifecycle, OpenFlow
        // sync, database commit, kernel sync.
        self.update_monitor_conditions()?;
        self.sync_ifstatus()?;
        self.sync_openflow()?;
        self.commit(now)?;
        self.apply_netlink()?;
        self.clear_input_tracked()?;
        Ok(IterationStatus::Completed)
    }

    fn drain_of_events(&mut self) {
        while let Ok(event) = self.of_events.try_recv() {
            match event {
                OfEvent::Connected => {
                    info!("OpenFlow channel connected");
                    self.engine.trigger_recompute("OpenFlow reconnect");
                }
                OfEvent::Disconnected => {
                    warn!("OpenFlow channel disconnected");
                    // The switch starts over; so does our installed view.
                    self.installed.clear();
                    self.seqno.reconnected();
                    if let Ok(lflow) = self.engine.node_mut::<LflowOutput>(&handles::lflow_output())
                    {
                        lflow.forget_installed_extends();
                    }
                    self.engine.trigger_recompute("OpenFlow disconnect");
                }
                OfEvent::BarrierAck(xid) => self.seqno.ack_barrier(xid),
                OfEvent::PortActivated(name) => self.ifmgr.activate(&name),
            }
        }
    }

    fn drain_netlink_events(&mut self) -> Result<(), ControllerError> {
        while let Ok(event) = self.netlink_events.try_recv() {
            match &event {
                NetlinkEvent::RouteAdded(_) | NetlinkEvent::RouteRemoved(_) => {
                    self.engine
                        .node_mut::<QueueNode<NetlinkEvent>>(&handles::routes_notify())?
                        .push(event);
                }
                NetlinkEvent::NeighAdded(_) | NetlinkEvent::NeighRemoved(_) => {
                    self.engine
                        .node_mut::<QueueNode<NetlinkEvent>>(&handles::neighbors_notify())?
                        .push(event);
                }
            }
        }
        Ok(())
    }

    fn drain_db_sessions(&mut self) -> Result<(), ControllerError> {
        let ovs_events = {
            let mut sink = EngineTableSink::vswitch(&mut self.engine);
            self.ovs.run(&mut sink)?
        };
        let sb_events = {
            let mut sink = EngineTableSink::southbound(&mut self.engine);
            self.sb.run(&mut sink)?
        };

        for (session_name, events) in [("vswitch", &ovs_events), ("southbound", &sb_events)] {
            if events.reconnected {
                self.engine
                    .trigger_recompute(&format!("{session_name} reconnected"));
            }
            for (id, status) in &events.txn_replies {
                match status {
                    TxnStatus::Success => debug!("{session_name} txn {id} committed"),
                    status => {
                        if self.loop_log_limiter.check() {
                            warn!("{session_name} txn {id} failed: {status:?}, will retry");
                        }
                        self.engine.trigger_recompute("transaction failed");
                    }
                }
            }
        }
        if sb_events.reconnected {
            // Row pointers cached from the southbound are dead.
            self.engine
                .node_mut::<LflowOutput>(&handles::lflow_output())?
                .on_reconnect();
            self.monitor.invalidate();
        }
        Ok(())
    }

    /// Identity resolution: `--chassis`, then the override file, then
    /// `external_ids:system-id`. First non-empty wins, once, for the
    /// process lifetime.
    fn resolve_identity(&mut self) {
        if self.chassis_resolved {
            return;
        }
        let resolved = {
            let ovs_table = self
                .engine
                .node::<DbTableNode>(&tables::ovs_node(ovs::OPEN_VSWITCH))
                .ok()
                .map(|node| node.table());
            let row = ovs_table.and_then(|t| t.iter().next());
            resolve_chassis_name(self.cli_chassis.as_deref(), &self.sysconfdir, row)
        };
        if let Some(name) = resolved {
            info!("chassis identity: {name}");
            if let Ok(config) = self.engine.node_mut::<GlobalConfig>(&handles::global_config()) {
                config.set_chassis_name(name);
            }
            self.chassis_resolved = true;
        }
    }

    fn current_config(&self) -> Result<Config, ControllerError> {
        let chassis = self
            .engine
            .node::<GlobalConfig>(&handles::global_config())?
            .chassis_name()
            .to_string();
        let ovs_table = self
            .engine
            .node::<DbTableNode>(&tables::ovs_node(ovs::OPEN_VSWITCH))?
            .table();
        Ok(ovs_table
            .iter()
            .next()
            .map(|row| Config::from_open_vswitch(row, &chassis))
            .unwrap_or_default())
    }

    /// The version gate reads the tables directly: when it skips the
    /// processing phase, the engine (and the config node in it) must not
    /// run at all.
    fn northd_version_ok(&mut self) -> Result<bool, ControllerError> {
        let config = self.current_config()?;
        if !config.match_northd_version {
            return Ok(true);
        }
        let sb_global = self
            .engine
            .node::<DbTableNode>(&tables::sb_node(sb::SB_GLOBAL))?
            .table();
        let northd_version = sb_global
            .iter()
            .next()
            .and_then(|row| row.smap_get("options", "northd_internal_version"));
        let ok = northd_version == Some(crate::global_config::INTERNAL_VERSION);
        if !ok && !self.version_mismatch_last && self.loop_log_limiter.check() {
            warn!(
                "northd internal version {} differs from {}, skipping processing",
                northd_version.unwrap_or("<unset>"),
                crate::global_config::INTERNAL_VERSION
            );
        }
        Ok(ok)
    }

    fn monitor_scope(&self) -> Result<MonitorScope, ControllerError> {
        let rt = self.engine.node::<RuntimeData>(&handles::runtime_data())?;
        let dp_group_table = self
            .engine
            .node::<DbTableNode>(&tables::sb_node(sb::LOGICAL_DP_GROUP))?
            .table();
        let local_datapaths = rt.local_datapath_uuids();
        let local_dp_keys = rt
            .local_datapaths()
            .values()
            .map(|ld| ld.tunnel_key)
            .collect();
        let dp_groups: BTreeSet<Uuid> = dp_group_table
            .iter()
            .filter(|row| {
                row.uuid_set("datapaths")
                    .iter()
                    .any(|dp| local_datapaths.contains(dp))
            })
            .map(|row| row.uuid())
            .collect();
        Ok(MonitorScope {
            local_datapaths,
            local_dp_keys,
            dp_groups,
        })
    }

    fn update_monitor_conditions(&mut self) -> Result<(), ControllerError> {
        let config = self.current_config()?;
        let chassis = self
            .engine
            .node::<GlobalConfig>(&handles::global_config())?
            .chassis_name()
            .to_string();
        let scope = self.monitor_scope()?;
        let chassis = if chassis.is_empty() {
            None
        } else {
            Some(chassis)
        };
        self.monitor
            .update(&mut self.sb, chassis.as_deref(), &scope, config.monitor_all)?;
        Ok(())
    }

    /// Feeds claims and releases into the interface-status machine from
    /// the current local scope.
    fn sync_ifstatus(&mut self) -> Result<(), ControllerError> {
        let (claims, bound): (Vec<_>, BTreeSet<String>) = {
            let rt = self.engine.node::<RuntimeData>(&handles::runtime_data())?;
            let claims: Vec<(String, Uuid, bool)> = rt
                .local_bindings()
                .iter()
                .map(|(name, port)| {
                    (name.clone(), port.port_binding, port.requires_activation)
                })
                .collect();
            (claims, rt.local_bindings().keys().cloned().collect())
        };
        for (name, port_binding, requires_activation) in claims {
            self.ifmgr.claim(&name, port_binding, requires_activation);
        }
        for (name, _) in self.ifmgr.dump() {
            if !bound.contains(&name) {
                self.ifmgr.release(&name);
            }
        }
        Ok(())
    }

    fn sync_openflow(&mut self) -> Result<(), ControllerError> {
        if !self.of_conn.connected() {
            return Ok(());
        }
        let result = {
            let lflow = self.engine.node::<LflowOutput>(&handles::lflow_output())?;
            let pflow = self.engine.node::<PflowOutput>(&handles::pflow_output())?;
            put(
                &[lflow.desired(), pflow.desired()],
                &mut self.installed,
                self.of_conn.as_mut(),
            )?
        };
        if result.held_for_backlog {
            if self.loop_log_limiter.check() {
                warn!("OpenFlow backlog, desired flows held back");
            }
            return Ok(());
        }
        self.engine
            .node_mut::<LflowOutput>(&handles::lflow_output())?
            .sync_extend_tables(self.of_conn.as_mut())?;

        // Arm installation acknowledgments: interface readiness and the
        // nb_cfg water-mark both bind to the barrier behind this batch.
        self.ifmgr.flows_pushed(&mut self.seqno);
        self.coordinator
            .request_nb_cfg_ack(&self.engine, &self.sb, &mut self.seqno)?;
        self.seqno.run(self.of_conn.as_mut())?;
        if result.sent > 0 {
            debug!("sent {} flow modifications", result.sent);
        }
        Ok(())
    }

    fn commit(&mut self, now: i64) -> Result<(), ControllerError> {
        // Integration-bridge setup rides in front of the regular
        // virtual-switch mutations.
        let mut ovs_seed = Txn::new();
        if self.ovs.can_write() {
            let config = self.current_config()?;
            let bridge_table = self
                .engine
                .node::<DbTableNode>(&tables::ovs_node(ovs::BRIDGE))?
                .table();
            bridge::ensure_integration_bridge(
                bridge_table,
                &config,
                self.startup_ts_ms,
                &mut ovs_seed,
            )?;
        }

        let outcome: CommitOutcome = self.coordinator.commit_with_seed(
            &mut self.engine,
            &mut self.sb,
            &mut self.ovs,
            &mut self.seqno,
            &mut self.ifmgr,
            now,
            ovs_seed,
        )?;
        if outcome.sb_txn_sent || outcome.ovs_txn_sent {
            debug!(
                "committed transactions (sb={}, ovs={})",
                outcome.sb_txn_sent, outcome.ovs_txn_sent
            );
        }
        Ok(())
    }

    fn apply_netlink(&mut self) -> Result<(), ControllerError> {
        let route_ops = self
            .engine
            .node_mut::<RouteSync>(&handles::route_sync())?
            .take_kernel_ops();
        if !route_ops.is_empty() {
            let seq = self.netlink.apply_routes(&route_ops)?;
            self.engine
                .node_mut::<SignalNode<u64>>(&handles::route_status())?
                .set(seq);
        }
        let neigh_ops = self
            .engine
            .node_mut::<NeighborSync>(&handles::neighbor_sync())?
            .take_kernel_ops();
        if !neigh_ops.is_empty() {
            let seq = self.netlink.apply_neighs(&neigh_ops)?;
            self.engine
                .node_mut::<SignalNode<u64>>(&handles::neighbor_status())?
                .set(seq);
        }
        Ok(())
    }

    /// Tracked input deltas live exactly one iteration.
    fn clear_input_tracked(&mut self) -> Result<(), ControllerError> {
        for table in ovs::ALL {
            self.engine
                .node_mut::<DbTableNode>(&tables::ovs_node(table))?
                .table_mut()
                .clear_tracked();
        }
        for table in sb::ALL {
            self.engine
                .node_mut::<DbTableNode>(&tables::sb_node(table))?
                .table_mut()
                .clear_tracked();
        }
        Ok(())
    }

    fn dispatch_unixctl(&mut self) {
        let Some(unixctl) = &self.unixctl else {
            return;
        };
        let requests: Vec<UnixctlRequest> = unixctl.drain();
        for request in requests {
            self.handle_request(request);
        }
    }

    fn handle_request(&mut self, request: UnixctlRequest) {
        let method = request.method.clone();
        match method.as_str() {
            "exit" => {
                self.exiting = true;
                request.reply("");
            }
            "recompute" => {
                self.engine.trigger_recompute("operator request");
                request.reply("");
            }
            "sb-cluster-state-reset" => {
                self.monitor.invalidate();
                self.engine.trigger_recompute("cluster state reset");
                request.reply("");
            }
            "debug/pause" => {
                self.paused = true;
                request.reply("");
            }
            "debug/resume" => {
                self.paused = false;
                self.engine.trigger_recompute("resumed");
                request.reply("");
            }
            "debug/status" => {
                request.reply(if self.paused { "paused" } else { "running" });
            }
            "debug/delay-nb-cfg-report" => {
                match request.params.first().and_then(|p| p.parse::<i64>().ok()) {
                    Some(seconds) => {
                        self.coordinator.set_delay_report(seconds);
                        request.reply("");
                    }
                    None => request.reply_error("usage: debug/delay-nb-cfg-report SECONDS"),
                }
            }
            "connection-status" => {
                let body = format!(
                    "southbound: {}, vswitch: {}, openflow: {}",
                    if self.sb.writable() { "connected" } else { "read-only" },
                    if self.ovs.writable() { "connected" } else { "read-only" },
                    if self.of_conn.connected() { "connected" } else { "disconnected" },
                );
                request.reply(body);
            }
            "ct-zone-list" => {
                let body = self
                    .engine
                    .node::<CtZones>(&handles::ct_zones())
                    .map(|zones| {
                        zones
                            .assigned()
                            .iter()
                            .map(|(name, zone)| format!("{name} {zone}"))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                request.reply(body);
            }
            "group-table-list" | "meter-table-list" => {
                let want_groups = request.method.starts_with("group");
                let body = self
                    .engine
                    .node::<LflowOutput>(&handles::lflow_output())
                    .map(|lflow| {
                        let table = if want_groups { lflow.groups() } else { lflow.meters() };
                        table
                            .iter_desired()
                            .map(|(def, id)| format!("{id}: {def}"))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                request.reply(body);
            }
            "inject-pkt" => match request.params.first().cloned() {
                Some(microflow) => {
                    self.injected_packets.push(microflow);
                    request.reply("");
                }
                None => request.reply_error("usage: inject-pkt MICROFLOW"),
            },
            "lflow-cache/flush" => {
                if let Ok(lflow) = self.engine.node_mut::<LflowOutput>(&handles::lflow_output()) {
                    lflow.cache_flush();
                }
                self.engine.trigger_recompute("lflow cache flushed");
                request.reply("");
            }
            "lflow-cache/show-stats" => {
                let body = self
                    .engine
                    .node::<LflowOutput>(&handles::lflow_output())
                    .map(|lflow| {
                        let stats = lflow.cache_stats();
                        format!(
                            "entries: {}\nbytes: {}\nhits: {}\nmisses: {}\ntrims: {}\nhigh-water: {}",
                            stats.entries,
                            stats.bytes,
                            stats.hits,
                            stats.misses,
                            stats.trims,
                            stats.high_water_entries
                        )
                    })
                    .unwrap_or_default();
                request.reply(body);
            }
            "debug/dump-local-datapaths" => {
                let body = self
                    .engine
                    .node::<RuntimeData>(&handles::runtime_data())
                    .map(|rt| {
                        rt.local_datapaths()
                            .iter()
                            .map(|(uuid, ld)| format!("{uuid} key={}", ld.tunnel_key))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                request.reply(body);
            }
            "debug/dump-related-ports" => {
                let body = self
                    .engine
                    .node::<RuntimeData>(&handles::runtime_data())
                    .map(|rt| {
                        rt.related_ports()
                            .iter()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                request.reply(body);
            }
            "debug/dump-peer-ports" => {
                let body = self
                    .engine
                    .node::<RuntimeData>(&handles::runtime_data())
                    .map(|rt| {
                        rt.local_datapaths()
                            .iter()
                            .flat_map(|(uuid, ld)| {
                                ld.peer_ports.iter().map(move |(port, peer)| {
                                    format!("{uuid}: {port} -> {peer}")
                                })
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                request.reply(body);
            }
            "debug/dump-engine-stats" => {
                let handles: Vec<_> = self.engine.node_handles().cloned().collect();
                let mut lines = Vec::with_capacity(handles.len());
                for handle in handles {
                    if let Ok(stats) = self.engine.node_stats(&handle) {
                        lines.push(format!(
                            "{handle}: recompute={} handled={} changes={} cancels={}",
                            stats.recompute, stats.handled, stats.changes, stats.cancels
                        ));
                    }
                }
                request.reply(lines.join("\n"));
            }
            other => {
                request.reply_error(format!("unknown command {other}"));
            }
        }
    }
}
