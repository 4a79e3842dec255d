//! End-to-end scenarios: the daemon driven against fake databases and a
//! fake switch, checking the externally visible contract — claims, zone
//! persistence, nb_cfg propagation, read-only handshakes, and the
//! invariants that must hold after every completed iteration.

mod support;

use flowsync_controller::ct_zones::CtZones;
use flowsync_controller::handles;
use flowsync_controller::lflow_output::LflowOutput;
use flowsync_controller::pflow_output::PflowOutput;
use flowsync_controller::runtime_data::RuntimeData;
use flowsync_controller::IterationStatus;
use flowsync_db::Row;
use flowsync_ofctrl::{FlowModCommand, OfMsg};
use flowsync_types::serde_json::json;
use flowsync_types::uuid::Uuid;
use support::{seed_datapath, seed_iface, seed_port_binding, Harness};

/// Invariants that must hold after every completed iteration.
fn check_invariants(h: &Harness) {
    let engine = &h.controller.engine;
    let rt = engine.node::<RuntimeData>(&handles::runtime_data()).unwrap();

    // Every local port's datapath is a local datapath.
    for (name, port) in rt.local_bindings() {
        assert!(
            rt.is_local_datapath(&port.datapath),
            "local port {name} on non-local datapath"
        );
    }

    // No dangling cookies: every provenance entry points at a live rule
    // owned by that origin.
    let lflow = engine.node::<LflowOutput>(&handles::lflow_output()).unwrap();
    let desired = lflow.desired();
    for origin in desired.origins() {
        for key in desired.origin_flows(origin) {
            assert_eq!(
                desired.get(key).map(|f| f.origin),
                Some(*origin),
                "dangling cookie for {origin}"
            );
        }
    }

    // Every group id referenced by a desired flow exists on the desired
    // side of the extend table.
    let group_ids: Vec<u32> = lflow.groups().desired_ids().collect();
    for (_, flow) in desired.iter() {
        if let Some(rest) = flow.actions.split("group:").nth(1) {
            let id: u32 = rest
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap();
            assert!(group_ids.contains(&id), "flow references unknown group {id}");
        }
    }

    // Monitor conditions, interpreted against the southbound, cover every
    // row the engine consumed for its local scope.
    if let Some(cond) = h.controller.sb_session().condition("port_binding") {
        for row in h.sb.store.table("port_binding").unwrap().iter() {
            let local_dp = row
                .uuid_col("datapath")
                .is_some_and(|dp| rt.is_local_datapath(&dp));
            if local_dp {
                assert!(
                    cond.matches(row),
                    "local row {} not covered by monitor condition",
                    row.uuid()
                );
            }
        }
    }
}

#[test]
fn test_scenario_port_claim() {
    let mut h = Harness::new("hv1");
    h.settle();

    let dp1 = seed_datapath(&mut h.sb, 5);
    let lp1 = seed_port_binding(&mut h.sb, "lp1", dp1, 3);
    h.sb.insert(
        "logical_flow",
        Row::new(Uuid::new_v4())
            .with("logical_datapath", dp1.to_string())
            .with("table_id", 0)
            .with("priority", 100)
            .with("pipeline", "ingress")
            .with("match", "ip")
            .with("actions", "next;"),
    );
    seed_iface(&mut h.ovs, "vif1", "lp1", 10);
    h.settle();

    // dp1 entered the local datapaths and lp1 is bound here.
    let rt = h
        .controller
        .engine
        .node::<RuntimeData>(&handles::runtime_data())
        .unwrap();
    assert!(rt.is_local_datapath(&dp1));
    assert!(rt.local_bindings().contains_key("lp1"));

    // The southbound now says the port lives on this chassis.
    let pb = h.sb.row("port_binding", &lp1).unwrap();
    assert_eq!(pb.str("chassis"), Some("hv1"));

    // A ct-zone was allocated and persisted in the bridge external-ids.
    let zones = h.controller.engine.node::<CtZones>(&handles::ct_zones()).unwrap();
    let zone = zones.zone_of("lp1").expect("zone assigned");
    let bridge = h.ovs.find_by("bridge", "name", "br-int").expect("bridge created");
    assert_eq!(
        bridge.smap_get("external_ids", "ct-zone-lp1"),
        Some(zone.to_string().as_str())
    );

    // The desired flow table gained the port's classification and
    // delivery rules plus the logical flow's translation.
    let pflow = h
        .controller
        .engine
        .node::<PflowOutput>(&handles::pflow_output())
        .unwrap();
    assert!(pflow.desired().len() >= 2, "ingress/egress rules expected");
    let lflow = h
        .controller
        .engine
        .node::<LflowOutput>(&handles::lflow_output())
        .unwrap();
    assert_eq!(lflow.desired().len(), 1);
    assert!(h
        .sent_msgs()
        .iter()
        .any(|m| matches!(m, OfMsg::FlowMod { command: FlowModCommand::Add, .. })));

    check_invariants(&h);
}

#[test]
fn test_scenario_nb_cfg_advance() {
    let mut h = Harness::new("hv1");
    h.settle();

    // Chassis registration created chassis-private; push its nb_cfg to 10
    // as the scenario baseline.
    let private = h.sb.find_by("chassis_private", "name", "hv1").unwrap();
    h.sb.update(
        "chassis_private",
        private.uuid(),
        [("nb_cfg".to_string(), json!(10))].into_iter().collect(),
    );
    h.settle();

    let lflow_before: usize = h
        .controller
        .engine
        .node::<LflowOutput>(&handles::lflow_output())
        .unwrap()
        .desired()
        .len();

    // Northbound bumps the water-mark.
    h.sb.insert(
        "sb_global",
        Row::new(Uuid::new_v4()).with("nb_cfg", 11).with("options", json!({})),
    );
    h.settle();

    // Desired flows unchanged; nb_cfg echoed with a timestamp once the
    // switch acknowledged the barrier.
    assert_eq!(
        h.controller
            .engine
            .node::<LflowOutput>(&handles::lflow_output())
            .unwrap()
            .desired()
            .len(),
        lflow_before
    );
    let private = h.sb.find_by("chassis_private", "name", "hv1").unwrap();
    assert_eq!(private.integer("nb_cfg"), Some(11));
    assert!(private.integer("nb_cfg_timestamp").is_some());
    let bridge = h.ovs.find_by("bridge", "name", "br-int").unwrap();
    assert_eq!(bridge.smap_get("external_ids", "ovn-nb-cfg"), Some("11"));
    assert!(bridge.smap_get("external_ids", "ovn-nb-cfg-ts").is_some());

    check_invariants(&h);
}

#[test]
fn test_scenario_readonly_southbound() {
    let mut h = Harness::new("hv1");
    h.settle();

    // The southbound loses its quorum for writes.
    h.sb.set_writable(false);
    h.step();

    // A binding arrives that would require writing a chassis field.
    let dp1 = seed_datapath(&mut h.sb, 5);
    let lp1 = seed_port_binding(&mut h.sb, "lp1", dp1, 3);
    seed_iface(&mut h.ovs, "vif1", "lp1", 10);
    let status = h.step();
    assert_eq!(status, IterationStatus::Canceled);
    assert!(h.controller.engine.force_recompute_pending());
    let pb = h.sb.row("port_binding", &lp1).unwrap();
    assert_eq!(pb.str("chassis"), Some(""));

    // Writability returns: the very next iterations drain the pending
    // claim in one recompute pass.
    h.sb.set_writable(true);
    h.settle();
    let pb = h.sb.row("port_binding", &lp1).unwrap();
    assert_eq!(pb.str("chassis"), Some("hv1"));
    check_invariants(&h);
}

#[test]
fn test_idempotent_iterations_after_settling() {
    let mut h = Harness::new("hv1");
    let dp1 = seed_datapath(&mut h.sb, 5);
    seed_port_binding(&mut h.sb, "lp1", dp1, 3);
    seed_iface(&mut h.ovs, "vif1", "lp1", 10);
    h.settle();
    h.settle();

    let msgs_before = h.sent_msgs().len();
    let flows_before: usize = h
        .controller
        .engine
        .node::<PflowOutput>(&handles::pflow_output())
        .unwrap()
        .desired()
        .len();

    // No input changes: no engine changes, no messages, no commits.
    for _ in 0..3 {
        assert_eq!(h.step(), IterationStatus::Completed);
    }
    assert_eq!(h.sent_msgs().len(), msgs_before);
    assert_eq!(
        h.controller
            .engine
            .node::<PflowOutput>(&handles::pflow_output())
            .unwrap()
            .desired()
            .len(),
        flows_before
    );
    assert!(!h.controller.sb_session().txn_in_flight());
    check_invariants(&h);
}

#[test]
fn test_empty_local_scope_boundary() {
    let mut h = Harness::new("hv1");
    h.settle();

    let rt = h
        .controller
        .engine
        .node::<RuntimeData>(&handles::runtime_data())
        .unwrap();
    assert!(rt.local_datapaths().is_empty());
    let lflow = h
        .controller
        .engine
        .node::<LflowOutput>(&handles::lflow_output())
        .unwrap();
    assert!(lflow.desired().is_empty());
    check_invariants(&h);
}

#[test]
fn test_openflow_backlog_holds_messages() {
    let mut h = Harness::new("hv1");
    let dp1 = seed_datapath(&mut h.sb, 5);
    seed_port_binding(&mut h.sb, "lp1", dp1, 3);
    seed_iface(&mut h.ovs, "vif1", "lp1", 10);
    h.settle();
    let msgs_before = h.sent_msgs().len();

    // Backlog present: the engine keeps running incrementally and desired
    // mutations accumulate, but nothing new reaches the switch.
    h.switch
        .backlog
        .store(flowsync_ofctrl::put::BACKLOG_LIMIT, std::sync::atomic::Ordering::Relaxed);
    seed_port_binding(&mut h.sb, "lp2", dp1, 4);
    seed_iface(&mut h.ovs, "vif2", "lp2", 11);
    assert_eq!(h.step(), IterationStatus::Completed);
    assert_eq!(h.sent_msgs().len(), msgs_before);

    // Backlog clears; the accumulated desired state goes out.
    h.switch
        .backlog
        .store(0, std::sync::atomic::Ordering::Relaxed);
    h.settle();
    assert!(h.sent_msgs().len() > msgs_before);
    check_invariants(&h);
}

#[test]
fn test_restart_preserves_ct_zones_and_assignments() {
    let mut h = Harness::new("hv1");
    let dp1 = seed_datapath(&mut h.sb, 5);
    let _lp1 = seed_port_binding(&mut h.sb, "lp1", dp1, 3);
    seed_iface(&mut h.ovs, "vif1", "lp1", 10);
    h.settle();
    h.settle();

    let zone_before = h
        .controller
        .engine
        .node::<CtZones>(&handles::ct_zones())
        .unwrap()
        .zone_of("lp1")
        .unwrap();

    // "Restart": a fresh controller against the same database contents.
    let mut h2 = Harness::new("hv1");
    for row in h.sb.store.tables().flat_map(|t| {
        let name = t.name().to_string();
        t.iter().cloned().map(move |r| (name.clone(), r)).collect::<Vec<_>>()
    }) {
        h2.sb.insert(&row.0, row.1);
    }
    for row in h.ovs.store.tables().flat_map(|t| {
        let name = t.name().to_string();
        t.iter().cloned().map(move |r| (name.clone(), r)).collect::<Vec<_>>()
    }) {
        if row.0 == "open_vswitch" {
            continue;
        }
        h2.ovs.insert(&row.0, row.1);
    }
    h2.settle();
    h2.settle();

    let zone_after = h2
        .controller
        .engine
        .node::<CtZones>(&handles::ct_zones())
        .unwrap()
        .zone_of("lp1")
        .unwrap();
    assert_eq!(zone_before, zone_after, "zone id must survive restart");

    let pb = h2.sb.find_by("port_binding", "logical_port", "lp1").unwrap();
    assert_eq!(pb.str("chassis"), Some("hv1"));
    check_invariants(&h2);
}

#[test]
fn test_route_exchange_to_kernel_and_back() {
    let mut h = Harness::new("hv1");
    // Map lp1 to a host interface for dynamic route learning.
    let ovs_row = h
        .ovs
        .store
        .table("open_vswitch")
        .unwrap()
        .iter()
        .next()
        .cloned()
        .unwrap();
    h.ovs.update(
        "open_vswitch",
        ovs_row.uuid(),
        [(
            "external_ids".to_string(),
            json!({
                "system-id": "hv1",
                "ovn-encap-ip": "192.0.2.10",
                "dynamic-routing-port-mapping": "lp1:eth0",
            }),
        )]
        .into_iter()
        .collect(),
    );
    let dp1 = seed_datapath(&mut h.sb, 5);
    seed_port_binding(&mut h.sb, "lp1", dp1, 3);
    seed_iface(&mut h.ovs, "vif1", "lp1", 10);
    h.settle();

    // An advertised route for lp1 lands in the kernel via the netlink port.
    h.sb.insert(
        "advertised_route",
        Row::new(Uuid::new_v4())
            .with("datapath", dp1.to_string())
            .with("logical_port", "lp1")
            .with("ip_prefix", "10.1.0.0/24")
            .with("nexthop", "192.0.2.254"),
    );
    h.settle();
    {
        let kernel = h.netlink.inner.lock().unwrap();
        assert!(kernel
            .routes
            .iter()
            .any(|r| r.prefix == "10.1.0.0/24" && r.device == "eth0"));
    }

    // A kernel route appearing on the mapped interface is learned back
    // into the southbound.
    h.netlink_tx
        .send(flowsync_controller::netlink::NetlinkEvent::RouteAdded(
            flowsync_controller::netlink::KernelRoute {
                table: 254,
                prefix: "10.9.0.0/16".to_string(),
                nexthop: "192.0.2.1".to_string(),
                device: "eth0".to_string(),
            },
        ))
        .unwrap();
    h.settle();
    let learned = h.sb.find_by("learned_route", "ip_prefix", "10.9.0.0/16");
    assert!(learned.is_some(), "kernel route must be learned southbound");
    check_invariants(&h);
}

#[test]
fn test_commit_failure_forces_recompute_and_retries() {
    let mut h = Harness::new("hv1");
    h.settle();
    let dp1 = seed_datapath(&mut h.sb, 5);
    let lp1 = seed_port_binding(&mut h.sb, "lp1", dp1, 3);
    seed_iface(&mut h.ovs, "vif1", "lp1", 10);

    // The server rejects the claim once; the engine must retry after a
    // forced recompute rather than losing the mutation.
    h.controller.run_once().unwrap();
    h.sb.reject_txns();
    h.ovs.step();
    h.ack_barriers();
    h.settle();

    let pb = h.sb.row("port_binding", &lp1).unwrap();
    assert_eq!(pb.str("chassis"), Some("hv1"));
    check_invariants(&h);
}
