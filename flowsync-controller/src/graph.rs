//! Construction of the engine graph: every leaf adapter, every derived
//! node, and the dependency edges with their handler registrations. The
//! registration order here is the fixed order adapters are read in at the
//! top of each iteration.

use crate::acl_ids::AclIds;
use crate::addr_sets::AddrSets;
use crate::ct_zones::CtZones;
use crate::evpn::EvpnBindings;
use crate::global_config::GlobalConfig;
use crate::handles;
use crate::iface_shadow::IfaceShadow;
use crate::inputs::{DbTableNode, QueueNode, SignalNode};
use crate::lb_data::LbData;
use crate::lflow_cache::LflowCache;
use crate::lflow_output::LflowOutput;
use crate::mac_cache::MacCache;
use crate::neighbors::{NeighborSync, Neighbors};
use crate::netlink::NetlinkEvent;
use crate::pflow_output::PflowOutput;
use crate::port_groups::PortGroups;
use crate::routes::{RouteSync, Routes};
use crate::runtime_data::RuntimeData;
use crate::tables::{self, ovs, sb};
use crate::template_vars::TemplateVars;
use flowsync_engine::{EdgeKind, Engine, EngineError, NodeFlags};
use std::collections::BTreeSet;

/// Builds the full graph and runs engine init. The engine is ready for
/// its first iteration afterwards.
pub fn build(chassis_name: String, lflow_cache: LflowCache) -> Result<Engine, EngineError> {
    let mut engine = Engine::new();

    // Leaf adapters, in the fixed read order: virtual-switch first, then
    // southbound.
    for table in ovs::ALL {
        engine.add_node(
            tables::ovs_node(table),
            NodeFlags::default(),
            Box::new(DbTableNode::new(table)),
        );
    }
    for table in sb::ALL {
        engine.add_node(
            tables::sb_node(table),
            NodeFlags::default(),
            Box::new(DbTableNode::new(table)),
        );
    }

    // Externally fed inputs.
    engine.add_node(
        handles::sb_ro(),
        NodeFlags::default(),
        Box::new(SignalNode::new(false)),
    );
    engine.add_node(
        handles::of_connected(),
        NodeFlags::default(),
        Box::new(SignalNode::new(false)),
    );
    engine.add_node(
        handles::active_tunnels(),
        NodeFlags::default(),
        Box::new(SignalNode::new(BTreeSet::<String>::new())),
    );
    engine.add_node(
        handles::activated_ports(),
        NodeFlags::clears_tracked(),
        Box::new(QueueNode::<String>::new()),
    );
    engine.add_node(
        handles::routes_notify(),
        NodeFlags::clears_tracked(),
        Box::new(QueueNode::<NetlinkEvent>::new()),
    );
    engine.add_node(
        handles::route_status(),
        NodeFlags::default(),
        Box::new(SignalNode::new(0u64)),
    );
    engine.add_node(
        handles::neighbors_notify(),
        NodeFlags::clears_tracked(),
        Box::new(QueueNode::<NetlinkEvent>::new()),
    );
    engine.add_node(
        handles::neighbor_status(),
        NodeFlags::default(),
        Box::new(SignalNode::new(0u64)),
    );

    // Derived nodes.
    engine.add_node(
        handles::global_config(),
        NodeFlags::default(),
        Box::new(GlobalConfig::new(chassis_name)),
    );
    engine.add_node(
        handles::iface_shadow(),
        NodeFlags::clears_tracked(),
        Box::new(IfaceShadow::default()),
    );
    engine.add_node(
        handles::runtime_data(),
        NodeFlags {
            clears_tracked_data: true,
            may_write_southbound: true,
            has_validity_check: false,
        },
        Box::new(RuntimeData::default()),
    );
    engine.add_node(
        handles::addr_sets(),
        NodeFlags::clears_tracked(),
        Box::new(AddrSets::default()),
    );
    engine.add_node(
        handles::port_groups(),
        NodeFlags::clears_tracked(),
        Box::new(PortGroups::default()),
    );
    engine.add_node(
        handles::template_vars(),
        NodeFlags::clears_tracked(),
        Box::new(TemplateVars::default()),
    );
    engine.add_node(
        handles::lb_data(),
        NodeFlags::clears_tracked(),
        Box::new(LbData::default()),
    );
    engine.add_node(
        handles::mac_cache(),
        NodeFlags::clears_tracked(),
        Box::new(MacCache::default()),
    );
    engine.add_node(
        handles::ct_zones(),
        NodeFlags::default(),
        Box::new(CtZones::default()),
    );
    engine.add_node(
        handles::acl_ids(),
        NodeFlags::default(),
        Box::new(AclIds::default()),
    );
    engine.add_node(
        handles::evpn_bindings(),
        NodeFlags::default(),
        Box::new(EvpnBindings::default()),
    );
    engine.add_node(
        handles::routes(),
        NodeFlags::default(),
        Box::new(Routes::default()),
    );
    engine.add_node(
        handles::route_sync(),
        NodeFlags::writes_southbound(),
        Box::new(RouteSync::default()),
    );
    engine.add_node(
        handles::neighbors(),
        NodeFlags::default(),
        Box::new(Neighbors::default()),
    );
    engine.add_node(
        handles::neighbor_sync(),
        NodeFlags::writes_southbound(),
        Box::new(NeighborSync::default()),
    );
    engine.add_node(
        handles::lflow_output(),
        NodeFlags::default(),
        Box::new(LflowOutput::new(lflow_cache)),
    );
    engine.add_node(
        handles::pflow_output(),
        NodeFlags::default(),
        Box::new(PflowOutput::default()),
    );

    connect_edges(&mut engine)?;
    engine.set_write_gate(&handles::sb_ro())?;
    engine.init()?;
    Ok(engine)
}

fn connect_edges(engine: &mut Engine) -> Result<(), EngineError> {
    use EdgeKind::{RecomputeOnly, WithHandler};

    let edges = [
        // Global configuration digest.
        (tables::ovs_node(ovs::OPEN_VSWITCH), handles::global_config(), RecomputeOnly),
        (tables::ovs_node(ovs::BRIDGE), handles::global_config(), RecomputeOnly),
        (tables::sb_node(sb::SB_GLOBAL), handles::global_config(), RecomputeOnly),
        // Interface shadow.
        (tables::ovs_node(ovs::INTERFACE), handles::iface_shadow(), WithHandler),
        // Local scope.
        (handles::iface_shadow(), handles::runtime_data(), WithHandler),
        (tables::sb_node(sb::PORT_BINDING), handles::runtime_data(), WithHandler),
        (tables::sb_node(sb::DATAPATH_BINDING), handles::runtime_data(), RecomputeOnly),
        (tables::sb_node(sb::CHASSIS), handles::runtime_data(), RecomputeOnly),
        (tables::sb_node(sb::HA_CHASSIS_GROUP), handles::runtime_data(), RecomputeOnly),
        (handles::global_config(), handles::runtime_data(), RecomputeOnly),
        (handles::active_tunnels(), handles::runtime_data(), WithHandler),
        (handles::sb_ro(), handles::runtime_data(), WithHandler),
        // Object projections.
        (tables::sb_node(sb::ADDRESS_SET), handles::addr_sets(), WithHandler),
        (tables::sb_node(sb::PORT_GROUP), handles::port_groups(), WithHandler),
        (tables::sb_node(sb::CHASSIS_TEMPLATE_VAR), handles::template_vars(), WithHandler),
        (handles::global_config(), handles::template_vars(), RecomputeOnly),
        (tables::sb_node(sb::LOAD_BALANCER), handles::lb_data(), WithHandler),
        (handles::template_vars(), handles::lb_data(), WithHandler),
        (tables::sb_node(sb::MAC_BINDING), handles::mac_cache(), WithHandler),
        (tables::sb_node(sb::STATIC_MAC_BINDING), handles::mac_cache(), WithHandler),
        (tables::sb_node(sb::FDB), handles::mac_cache(), WithHandler),
        // Zones.
        (handles::runtime_data(), handles::ct_zones(), WithHandler),
        (tables::ovs_node(ovs::BRIDGE), handles::ct_zones(), WithHandler),
        (handles::global_config(), handles::ct_zones(), RecomputeOnly),
        (tables::sb_node(sb::DATAPATH_BINDING), handles::ct_zones(), RecomputeOnly),
        // ACL sampling ids.
        (tables::sb_node(sb::ACL_ID), handles::acl_ids(), RecomputeOnly),
        // EVPN.
        (handles::runtime_data(), handles::evpn_bindings(), RecomputeOnly),
        (tables::sb_node(sb::CHASSIS), handles::evpn_bindings(), RecomputeOnly),
        (tables::sb_node(sb::ENCAP), handles::evpn_bindings(), RecomputeOnly),
        (tables::sb_node(sb::FDB), handles::evpn_bindings(), RecomputeOnly),
        (tables::sb_node(sb::DATAPATH_BINDING), handles::evpn_bindings(), RecomputeOnly),
        // Route/neighbor exchange.
        (tables::sb_node(sb::ADVERTISED_ROUTE), handles::routes(), WithHandler),
        (handles::runtime_data(), handles::routes(), WithHandler),
        (handles::global_config(), handles::routes(), RecomputeOnly),
        (handles::routes(), handles::route_sync(), WithHandler),
        (handles::routes_notify(), handles::route_sync(), WithHandler),
        (handles::route_status(), handles::route_sync(), WithHandler),
        (handles::sb_ro(), handles::route_sync(), WithHandler),
        (tables::sb_node(sb::LEARNED_ROUTE), handles::route_sync(), RecomputeOnly),
        (tables::sb_node(sb::ADVERTISED_MAC_BINDING), handles::neighbors(), WithHandler),
        (handles::runtime_data(), handles::neighbors(), WithHandler),
        (handles::global_config(), handles::neighbors(), RecomputeOnly),
        (handles::neighbors(), handles::neighbor_sync(), WithHandler),
        (handles::neighbors_notify(), handles::neighbor_sync(), WithHandler),
        (handles::neighbor_status(), handles::neighbor_sync(), WithHandler),
        (handles::sb_ro(), handles::neighbor_sync(), WithHandler),
        (tables::sb_node(sb::MAC_BINDING), handles::neighbor_sync(), RecomputeOnly),
        // Logical flows.
        (tables::sb_node(sb::LOGICAL_FLOW), handles::lflow_output(), WithHandler),
        (tables::sb_node(sb::LOGICAL_DP_GROUP), handles::lflow_output(), WithHandler),
        (tables::sb_node(sb::MULTICAST_GROUP), handles::lflow_output(), WithHandler),
        (handles::runtime_data(), handles::lflow_output(), WithHandler),
        (handles::addr_sets(), handles::lflow_output(), WithHandler),
        (handles::port_groups(), handles::lflow_output(), WithHandler),
        (handles::template_vars(), handles::lflow_output(), WithHandler),
        (handles::lb_data(), handles::lflow_output(), WithHandler),
    ];
    for (from, to, kind) in edges {
        engine.connect(&from, &to, kind)?;
    }

    // Remaining logical-flow inputs and the physical-flow node.
    engine.connect_with_handler(&handles::mac_cache(), &handles::lflow_output())?;
    for table in [
        sb::METER,
        sb::DHCP_OPTIONS,
        sb::DHCPV6_OPTIONS,
        sb::DNS,
        sb::IP_MULTICAST,
        sb::IGMP_GROUP,
    ] {
        engine.connect(
            &tables::sb_node(table),
            &handles::lflow_output(),
            EdgeKind::RecomputeOnly,
        )?;
    }
    engine.connect(
        &handles::acl_ids(),
        &handles::lflow_output(),
        EdgeKind::RecomputeOnly,
    )?;

    engine.connect_with_handler(&handles::runtime_data(), &handles::pflow_output())?;
    engine.connect_with_handler(&handles::activated_ports(), &handles::pflow_output())?;
    for input in [
        handles::ct_zones(),
        handles::evpn_bindings(),
        handles::global_config(),
        handles::of_connected(),
    ] {
        engine.connect(&input, &handles::pflow_output(), EdgeKind::RecomputeOnly)?;
    }
    for table in [sb::CHASSIS, sb::ENCAP] {
        engine.connect(
            &tables::sb_node(table),
            &handles::pflow_output(),
            EdgeKind::RecomputeOnly,
        )?;
    }
    for table in [ovs::QOS, ovs::QUEUE] {
        engine.connect(
            &tables::ovs_node(table),
            &handles::pflow_output(),
            EdgeKind::RecomputeOnly,
        )?;
    }
    Ok(())
}
