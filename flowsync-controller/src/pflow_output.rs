//! Physical-flow output node: per-port ingress classification, local and
//! remote egress delivery, tunnel encapsulation towards other chassis and
//! EVPN remote MACs. Keyed by port-binding UUID so a departing port
//! retracts exactly its own rules.

use crate::ct_zones::CtZones;
use crate::evpn::EvpnBindings;
use crate::global_config::GlobalConfig;
use crate::handles;
use crate::inputs::{DbTableNode, QueueNode};
use crate::runtime_data::{LocalPort, LportTag, RuntimeData};
use crate::tables::{self, index, sb};
use crate::translate::EVPN_TABLE;
use flowsync_db::{IndexKey, Row, Table};
use flowsync_engine::{Change, Context, EngineError, HandlerOutcome, Node};
use flowsync_ofctrl::{DesiredFlowTable, FlowKey};
use flowsync_types::node::NodeHandle;
use flowsync_types::uuid::Uuid;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};

/// Ingress classification table.
const CLASSIFY_TABLE: u8 = 0;
/// Local/remote delivery table.
const OUTPUT_TABLE: u8 = 65;

struct Inputs<'a> {
    rt: &'a RuntimeData,
    ct_zones: &'a CtZones,
    evpn: &'a EvpnBindings,
    config: &'a GlobalConfig,
    pb_table: &'a Table,
    chassis_table: &'a Table,
    encap_table: &'a Table,
}

fn gather<'a>(ctx: &Context<'a>) -> Result<Inputs<'a>, EngineError> {
    Ok(Inputs {
        rt: ctx.node::<RuntimeData>(&handles::runtime_data())?,
        ct_zones: ctx.node::<CtZones>(&handles::ct_zones())?,
        evpn: ctx.node::<EvpnBindings>(&handles::evpn_bindings())?,
        config: ctx.node::<GlobalConfig>(&handles::global_config())?,
        pb_table: ctx
            .node::<DbTableNode>(&tables::sb_node(sb::PORT_BINDING))?
            .table(),
        chassis_table: ctx
            .node::<DbTableNode>(&tables::sb_node(sb::CHASSIS))?
            .table(),
        encap_table: ctx
            .node::<DbTableNode>(&tables::sb_node(sb::ENCAP))?
            .table(),
    })
}

#[derive(Debug, Default)]
pub struct PflowOutput {
    desired: DesiredFlowTable,
    /// Ports whose deferred activation step has completed.
    activated: BTreeSet<String>,
    /// Logical port name -> rule origin, for retraction of removed ports.
    origins: BTreeMap<String, Uuid>,
}

impl PflowOutput {
    pub fn desired(&self) -> &DesiredFlowTable {
        &self.desired
    }

    pub fn is_activated(&self, lport: &str) -> bool {
        self.activated.contains(lport)
    }

    fn add_flow(&mut self, origin: Uuid, table: u8, priority: u16, match_: String, actions: String) {
        self.desired.add(
            origin,
            FlowKey {
                table,
                priority,
                match_,
            },
            actions,
        );
    }

    /// Flows for one locally bound port.
    fn add_local_port(&mut self, name: &str, port: &LocalPort, inputs: &Inputs) {
        let Some(ofport) = port.ofport else {
            return;
        };
        let Some(ld) = inputs.rt.local_datapaths().get(&port.datapath) else {
            return;
        };
        self.origins.insert(name.to_string(), port.port_binding);
        let dp_key = ld.tunnel_key;
        let port_key = port.tunnel_key;

        if port.requires_activation && !self.activated.contains(name) {
            // Until the activation step completes, only punt traffic from
            // this port to the controller.
            self.add_flow(
                port.port_binding,
                CLASSIFY_TABLE,
                120,
                format!("in_port == {ofport}"),
                "controller(activation);".to_string(),
            );
            return;
        }

        let ct = inputs
            .ct_zones
            .zone_of(name)
            .map(|zone| format!("ct(zone={zone}); "))
            .unwrap_or_default();
        self.add_flow(
            port.port_binding,
            CLASSIFY_TABLE,
            100,
            format!("in_port == {ofport}"),
            format!("{ct}reg14 = {port_key}; metadata = {dp_key}; next(8);"),
        );
        self.add_flow(
            port.port_binding,
            OUTPUT_TABLE,
            100,
            format!("metadata == {dp_key} && reg15 == {port_key}"),
            format!("{ct}output({ofport});"),
        );
    }

    /// Tunnel endpoint of a remote chassis, honoring the configured encap
    /// type with a fallback to whatever the chassis offers.
    fn remote_encap_ip(chassis_name: &str, inputs: &Inputs) -> Option<String> {
        let chassis = inputs
            .chassis_table
            .row_by_index(index::BY_NAME, &IndexKey::str(chassis_name))
            .ok()??;
        let preferred = &inputs.config.config().encap_type;
        let mut fallback = None;
        for encap_uuid in chassis.uuid_set("encaps") {
            let Some(encap) = inputs.encap_table.get(&encap_uuid) else {
                continue;
            };
            let Some(ip) = encap.str("ip") else {
                continue;
            };
            if encap.str("type") == Some(preferred.as_str()) {
                return Some(ip.to_string());
            }
            fallback.get_or_insert_with(|| ip.to_string());
        }
        fallback
    }

    /// Delivery flow towards a port bound on another chassis.
    fn add_remote_port(&mut self, pb: &Row, inputs: &Inputs) {
        let Some(name) = pb.str("logical_port") else {
            return;
        };
        let Some(dp) = pb.uuid_col("datapath") else {
            return;
        };
        let Some(ld) = inputs.rt.local_datapaths().get(&dp) else {
            return;
        };
        let Some(chassis_name) = pb.str("chassis").filter(|c| !c.is_empty()) else {
            return;
        };
        let Some(remote_ip) = Self::remote_encap_ip(chassis_name, inputs) else {
            return;
        };
        let encap_type = inputs.config.config().encap_type.clone();
        self.origins.insert(name.to_string(), pb.uuid());
        self.add_flow(
            pb.uuid(),
            OUTPUT_TABLE,
            100,
            format!(
                "metadata == {} && reg15 == {}",
                ld.tunnel_key,
                pb.integer("tunnel_key").unwrap_or(0)
            ),
            format!("encap({encap_type}, {remote_ip}); output(tunnel);"),
        );
    }

    fn add_evpn_flows(&mut self, inputs: &Inputs) {
        for binding in inputs.evpn.bindings() {
            self.add_flow(
                binding.origin,
                EVPN_TABLE,
                100,
                format!(
                    "metadata == {} && eth.dst == {}",
                    binding.dp_tunnel_key, binding.mac
                ),
                format!(
                    "encap(vxlan, {}, vni={}); output(tunnel);",
                    binding.vtep_ip, binding.vni
                ),
            );
        }
    }

    /// Rebuilds the rules of one named port, wherever it is bound now.
    fn refresh_port(&mut self, name: &str, inputs: &Inputs) -> Result<(), EngineError> {
        if let Some(origin) = self.origins.remove(name) {
            self.desired.retract(&origin);
        }
        if let Some(port) = inputs.rt.local_bindings().get(name) {
            let port = port.clone();
            self.add_local_port(name, &port, inputs);
            return Ok(());
        }
        if let Some(pb) = inputs
            .pb_table
            .row_by_index(index::BY_NAME, &IndexKey::str(name))?
        {
            let pb = pb.clone();
            self.add_remote_port(&pb, inputs);
        }
        Ok(())
    }
}

impl Node for PflowOutput {
    fn run(&mut self, ctx: &Context) -> Result<Change, EngineError> {
        let inputs = gather(ctx)?;
        self.desired.clear();
        self.origins.clear();
        self.activated
            .retain(|name| inputs.rt.local_bindings().contains_key(name));

        let bindings: Vec<(String, LocalPort)> = inputs
            .rt
            .local_bindings()
            .iter()
            .map(|(name, port)| (name.clone(), port.clone()))
            .collect();
        for (name, port) in &bindings {
            self.add_local_port(name, port, &inputs);
        }

        let related: Vec<Row> = inputs
            .rt
            .related_ports()
            .iter()
            .filter_map(|name| {
                inputs
                    .pb_table
                    .row_by_index(index::BY_NAME, &IndexKey::str(name.clone()))
                    .ok()
                    .flatten()
                    .cloned()
            })
            .collect();
        for pb in &related {
            self.add_remote_port(pb, &inputs);
        }

        self.add_evpn_flows(&inputs);
        Ok(Change::Updated)
    }

    fn handle_change(
        &mut self,
        input: &NodeHandle,
        ctx: &Context,
    ) -> Result<HandlerOutcome, EngineError> {
        let inputs = gather(ctx)?;

        if *input == handles::runtime_data() {
            let Some(tracked) = inputs.rt.tracked() else {
                return Ok(HandlerOutcome::Unhandled);
            };
            let mut changed = false;
            for dp in tracked.to_vec() {
                for lport in &dp.lports {
                    match lport.tag {
                        LportTag::Removed => {
                            if let Some(origin) = self.origins.remove(&lport.name) {
                                self.desired.retract(&origin);
                                changed = true;
                            }
                        }
                        LportTag::New | LportTag::Updated => {
                            self.refresh_port(&lport.name, &inputs)?;
                            changed = true;
                        }
                    }
                }
            }
            return Ok(if changed {
                HandlerOutcome::Updated
            } else {
                HandlerOutcome::Unchanged
            });
        }

        if *input == handles::activated_ports() {
            let names: Vec<String> = ctx
                .node::<QueueNode<String>>(&handles::activated_ports())?
                .current()
                .to_vec();
            let mut changed = false;
            for name in names {
                if self.activated.insert(name.clone()) {
                    self.refresh_port(&name, &inputs)?;
                    changed = true;
                }
            }
            return Ok(if changed {
                HandlerOutcome::Updated
            } else {
                HandlerOutcome::Unchanged
            });
        }

        Ok(HandlerOutcome::Unhandled)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
