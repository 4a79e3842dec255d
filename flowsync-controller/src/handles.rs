//! Handles of the derived nodes. Leaf adapters derive theirs from table
//! names (see `tables::sb_node` / `tables::ovs_node`).

use flowsync_types::node::NodeHandle;

macro_rules! handle_fn {
    ($name:ident, $id:expr) => {
        pub fn $name() -> NodeHandle {
            NodeHandle::new($id)
        }
    };
}

handle_fn!(global_config, "global-config");
handle_fn!(sb_ro, "sb-ro");
handle_fn!(of_connected, "ofctrl-is-connected");
handle_fn!(active_tunnels, "active-tunnels");
handle_fn!(activated_ports, "activated-ports");
handle_fn!(iface_shadow, "iface-shadow");
handle_fn!(runtime_data, "runtime-data");
handle_fn!(addr_sets, "addr-sets");
handle_fn!(port_groups, "port-groups");
handle_fn!(template_vars, "template-vars");
handle_fn!(lb_data, "lb-data");
handle_fn!(mac_cache, "mac-cache");
handle_fn!(ct_zones, "ct-zones");
handle_fn!(acl_ids, "acl-ids");
handle_fn!(lflow_output, "lflow-output");
handle_fn!(pflow_output, "pflow-output");
handle_fn!(routes, "routes");
handle_fn!(route_sync, "route-sync");
handle_fn!(routes_notify, "routes-notify");
handle_fn!(route_status, "route-status");
handle_fn!(neighbors, "neighbors");
handle_fn!(neighbor_sync, "neighbor-sync");
handle_fn!(neighbors_notify, "neighbors-notify");
handle_fn!(neighbor_status, "neighbor-status");
handle_fn!(evpn_bindings, "evpn-bindings");
