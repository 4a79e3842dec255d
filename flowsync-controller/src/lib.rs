pub mod acl_ids;
pub mod addr_sets;
pub mod bridge;
pub mod commit;
pub mod config;
pub mod controller;
pub mod ct_zones;
pub mod errors;
pub mod evpn;
pub mod global_config;
pub mod graph;
pub mod handles;
pub mod iface_shadow;
pub mod ifstatus;
pub mod inputs;
pub mod lb_data;
pub mod lflow_cache;
pub mod lflow_output;
pub mod mac_cache;
pub mod monitor;
pub mod neighbors;
pub mod netlink;
pub mod objdep;
pub mod pflow_output;
pub mod port_groups;
pub mod routes;
pub mod runtime_data;
pub mod tables;
pub mod template_vars;
pub mod translate;
pub mod transport;
pub mod unixctl;

pub use controller::{Controller, ControllerOptions, IterationStatus, OfEvent};
pub use errors::ControllerError;
