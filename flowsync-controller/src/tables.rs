//! Table names of both monitored databases, the secondary indexes created
//! on them, and the node-handle naming scheme for their leaf adapters.

use flowsync_db::{IndexKey, Row, Table};
use flowsync_types::node::NodeHandle;

/// Southbound (cluster-wide logical network) tables.
pub mod sb {
    pub const CHASSIS: &str = "chassis";
    pub const CHASSIS_PRIVATE: &str = "chassis_private";
    pub const CHASSIS_TEMPLATE_VAR: &str = "chassis_template_var";
    pub const ENCAP: &str = "encap";
    pub const DATAPATH_BINDING: &str = "datapath_binding";
    pub const PORT_BINDING: &str = "port_binding";
    pub const LOGICAL_FLOW: &str = "logical_flow";
    pub const LOGICAL_DP_GROUP: &str = "logical_dp_group";
    pub const MULTICAST_GROUP: &str = "multicast_group";
    pub const MAC_BINDING: &str = "mac_binding";
    pub const FDB: &str = "fdb";
    pub const DNS: &str = "dns";
    pub const DHCP_OPTIONS: &str = "dhcp_options";
    pub const DHCPV6_OPTIONS: &str = "dhcpv6_options";
    pub const LOAD_BALANCER: &str = "load_balancer";
    pub const IP_MULTICAST: &str = "ip_multicast";
    pub const IGMP_GROUP: &str = "igmp_group";
    pub const ADDRESS_SET: &str = "address_set";
    pub const PORT_GROUP: &str = "port_group";
    pub const METER: &str = "meter";
    pub const STATIC_MAC_BINDING: &str = "static_mac_binding";
    pub const CONTROLLER_EVENT: &str = "controller_event";
    pub const HA_CHASSIS_GROUP: &str = "ha_chassis_group";
    pub const ADVERTISED_ROUTE: &str = "advertised_route";
    pub const LEARNED_ROUTE: &str = "learned_route";
    pub const ADVERTISED_MAC_BINDING: &str = "advertised_mac_binding";
    pub const ACL_ID: &str = "acl_id";
    pub const SB_GLOBAL: &str = "sb_global";

    pub const ALL: &[&str] = &[
        CHASSIS,
        CHASSIS_PRIVATE,
        CHASSIS_TEMPLATE_VAR,
        ENCAP,
        DATAPATH_BINDING,
        PORT_BINDING,
        LOGICAL_FLOW,
        LOGICAL_DP_GROUP,
        MULTICAST_GROUP,
        MAC_BINDING,
        FDB,
        DNS,
        DHCP_OPTIONS,
        DHCPV6_OPTIONS,
        LOAD_BALANCER,
        IP_MULTICAST,
        IGMP_GROUP,
        ADDRESS_SET,
        PORT_GROUP,
        METER,
        STATIC_MAC_BINDING,
        CONTROLLER_EVENT,
        HA_CHASSIS_GROUP,
        ADVERTISED_ROUTE,
        LEARNED_ROUTE,
        ADVERTISED_MAC_BINDING,
        ACL_ID,
        SB_GLOBAL,
    ];

    /// Tables the monitor-condition manager scopes to the local chassis.
    /// Everything else is monitored unconditionally.
    pub const CONDITIONAL: &[&str] = &[
        PORT_BINDING,
        LOGICAL_FLOW,
        MULTICAST_GROUP,
        MAC_BINDING,
        FDB,
        LOAD_BALANCER,
        IP_MULTICAST,
        IGMP_GROUP,
        STATIC_MAC_BINDING,
        CHASSIS_PRIVATE,
        CHASSIS_TEMPLATE_VAR,
        DNS,
        CONTROLLER_EVENT,
        ADVERTISED_ROUTE,
        LEARNED_ROUTE,
        ADVERTISED_MAC_BINDING,
    ];

    /// Tables whose absence during startup (before the chassis identity is
    /// known) would disrupt forwarding; they get permissive conditions.
    pub const STARTUP_BROAD: &[&str] = &[
        PORT_BINDING,
        ADVERTISED_ROUTE,
        CHASSIS_PRIVATE,
    ];
}

/// Virtual-switch (local integration bridge) tables.
pub mod ovs {
    pub const OPEN_VSWITCH: &str = "open_vswitch";
    pub const BRIDGE: &str = "bridge";
    pub const PORT: &str = "port";
    pub const INTERFACE: &str = "interface";
    pub const QOS: &str = "qos";
    pub const QUEUE: &str = "queue";
    pub const SSL: &str = "ssl";
    pub const FLOW_TABLE: &str = "flow_table";
    pub const FLOW_SAMPLE_COLLECTOR_SET: &str = "flow_sample_collector_set";
    pub const DATAPATH: &str = "datapath";
    pub const CT_ZONE: &str = "ct_zone";
    pub const MIRROR: &str = "mirror";

    pub const ALL: &[&str] = &[
        OPEN_VSWITCH,
        BRIDGE,
        PORT,
        INTERFACE,
        QOS,
        QUEUE,
        SSL,
        FLOW_TABLE,
        FLOW_SAMPLE_COLLECTOR_SET,
        DATAPATH,
        CT_ZONE,
        MIRROR,
    ];
}

/// Index names shared between registration and lookups.
pub mod index {
    pub const BY_NAME: &str = "by-name";
    pub const BY_DATAPATH: &str = "by-datapath";
    pub const BY_KEY_DATAPATH: &str = "by-key-datapath";
    pub const BY_LOGICAL_DATAPATH: &str = "by-logical-datapath";
    pub const BY_IFACE_ID: &str = "by-iface-id";
}

pub fn sb_node(table: &str) -> NodeHandle {
    NodeHandle::new(format!("sb-{table}"))
}

pub fn ovs_node(table: &str) -> NodeHandle {
    NodeHandle::new(format!("ovs-{table}"))
}

fn pb_by_name(row: &Row) -> Option<IndexKey> {
    row.str("logical_port").map(IndexKey::str)
}

fn by_datapath(row: &Row) -> Option<IndexKey> {
    row.uuid_col("datapath").map(IndexKey::Uuid)
}

fn pb_by_key_datapath(row: &Row) -> Option<IndexKey> {
    Some(IndexKey::IntUuid(
        row.integer("tunnel_key")?,
        row.uuid_col("datapath")?,
    ))
}

fn lflow_by_logical_datapath(row: &Row) -> Option<IndexKey> {
    row.uuid_col("logical_datapath").map(IndexKey::Uuid)
}

fn mg_by_datapath(row: &Row) -> Option<IndexKey> {
    row.uuid_col("datapath").map(IndexKey::Uuid)
}

fn iface_by_iface_id(row: &Row) -> Option<IndexKey> {
    row.smap_get("external_ids", "iface-id").map(IndexKey::str)
}

fn bridge_by_name(row: &Row) -> Option<IndexKey> {
    row.str("name").map(IndexKey::str)
}

fn chassis_by_name(row: &Row) -> Option<IndexKey> {
    row.str("name").map(IndexKey::str)
}

/// Registers the secondary indexes a table needs. Called once per table
/// when the leaf adapters are created, before the first iteration.
pub fn register_indexes(table: &mut Table) {
    match table.name() {
        sb::PORT_BINDING => {
            table.add_index(index::BY_NAME, pb_by_name);
            table.add_index(index::BY_DATAPATH, by_datapath);
            table.add_index(index::BY_KEY_DATAPATH, pb_by_key_datapath);
        }
        sb::LOGICAL_FLOW => {
            table.add_index(index::BY_LOGICAL_DATAPATH, lflow_by_logical_datapath);
        }
        sb::MULTICAST_GROUP | sb::MAC_BINDING | sb::FDB | sb::STATIC_MAC_BINDING
        | sb::IGMP_GROUP | sb::IP_MULTICAST => {
            table.add_index(index::BY_DATAPATH, mg_by_datapath);
        }
        sb::CHASSIS | sb::CHASSIS_PRIVATE => {
            table.add_index(index::BY_NAME, chassis_by_name);
        }
        ovs::INTERFACE => {
            table.add_index(index::BY_IFACE_ID, iface_by_iface_id);
        }
        ovs::BRIDGE | ovs::PORT => {
            table.add_index(index::BY_NAME, bridge_by_name);
        }
        _ => {}
    }
}
