//! EVPN binding node: pairs remote VTEP endpoints (VXLAN encaps of other
//! chassis) with the learned MACs of EVPN-enabled local datapaths, for the
//! physical-flow node to turn into remote-MAC output rules.

use crate::handles;
use crate::inputs::DbTableNode;
use crate::runtime_data::RuntimeData;
use crate::tables::{self, sb};
use flowsync_engine::{Change, Context, EngineError, Node};
use flowsync_types::uuid::Uuid;
use std::any::Any;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub struct EvpnBinding {
    /// FDB row the MAC was learned from.
    pub origin: Uuid,
    pub datapath: Uuid,
    pub dp_tunnel_key: i64,
    pub mac: String,
    pub vtep_ip: String,
    pub vni: i64,
}

#[derive(Debug, Default)]
pub struct EvpnBindings {
    bindings: Vec<EvpnBinding>,
    /// chassis name -> VXLAN endpoint.
    remote_vteps: BTreeMap<String, String>,
}

impl EvpnBindings {
    pub fn bindings(&self) -> &[EvpnBinding] {
        &self.bindings
    }

    pub fn remote_vteps(&self) -> &BTreeMap<String, String> {
        &self.remote_vteps
    }
}

impl Node for EvpnBindings {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let rt = ctx.node::<RuntimeData>(&handles::runtime_data())?;
        let chassis_table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::CHASSIS))?
            .table();
        let encap_table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::ENCAP))?
            .table();
        let dp_table = ctx
            .node::<DbTableNode>(&tables::sb_node(sb::DATAPATH_BINDING))?
            .table();
        let fdb_table = ctx.node::<DbTableNode>(&tables::sb_node(sb::FDB))?.table();

        let mut remote_vteps = BTreeMap::new();
        for chassis in chassis_table.iter() {
            let Some(name) = chassis.str("name") else {
                continue;
            };
            for encap_uuid in chassis.uuid_set("encaps") {
                let Some(encap) = encap_table.get(&encap_uuid) else {
                    continue;
                };
                if encap.str("type") == Some("vxlan") {
                    if let Some(ip) = encap.str("ip") {
                        remote_vteps.insert(name.to_string(), ip.to_string());
                    }
                }
            }
        }

        // EVPN datapaths advertise their VNI in the datapath-binding
        // external-ids; only those get remote-MAC bindings.
        let mut evpn_dps: BTreeMap<i64, (Uuid, i64)> = BTreeMap::new();
        for (dp_uuid, ld) in rt.local_datapaths() {
            let Some(row) = dp_table.get(dp_uuid) else {
                continue;
            };
            if let Some(vni) = row
                .smap_get("external_ids", "evpn-vni")
                .and_then(|v| v.parse::<i64>().ok())
            {
                evpn_dps.insert(ld.tunnel_key, (*dp_uuid, vni));
            }
        }

        let mut bindings = Vec::new();
        for fdb in fdb_table.iter() {
            let Some(dp_key) = fdb.integer("dp_key") else {
                continue;
            };
            let Some((dp_uuid, vni)) = evpn_dps.get(&dp_key).copied() else {
                continue;
            };
            let Some(mac) = fdb.str("mac") else {
                continue;
            };
            // A remote MAC names its VTEP chassis in the FDB options.
            let Some(vtep_ip) = fdb
                .smap_get("options", "vtep-chassis")
                .and_then(|chassis| remote_vteps.get(chassis))
            else {
                continue;
            };
            bindings.push(EvpnBinding {
                origin: fdb.uuid(),
                datapath: dp_uuid,
                dp_tunnel_key: dp_key,
                mac: mac.to_string(),
                vtep_ip: vtep_ip.clone(),
                vni,
            });
        }
        bindings.sort_by(|a, b| (a.origin, &a.mac).cmp(&(b.origin, &b.mac)));

        let changed = bindings != self.bindings || remote_vteps != self.remote_vteps;
        self.bindings = bindings;
        self.remote_vteps = remote_vteps;
        Ok(if changed {
            Change::Updated
        } else {
            Change::Unchanged
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
