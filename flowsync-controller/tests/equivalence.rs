//! The core property: a run that processed a sequence of deltas
//! incrementally produces the same desired flow tables as a forced
//! recompute over the final database state (handlers are refinements of
//! recompute).

mod support;

use flowsync_controller::handles;
use flowsync_controller::lflow_output::LflowOutput;
use flowsync_controller::pflow_output::PflowOutput;
use flowsync_db::Row;
use flowsync_types::serde_json::json;
use flowsync_types::uuid::Uuid;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use support::{seed_datapath, seed_iface, seed_port_binding, Harness};

#[derive(Clone, Debug)]
enum Op {
    BindPort(u8),
    UnbindPort(u8),
    AddLflow { dp: u8, variant: u8 },
    DelLflow(u8),
    SetAddrSet { set: u8, members: Vec<u8> },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::BindPort),
        (0u8..4).prop_map(Op::UnbindPort),
        (0u8..3, 0u8..3).prop_map(|(dp, variant)| Op::AddLflow { dp, variant }),
        (0u8..6).prop_map(Op::DelLflow),
        (0u8..2, proptest::collection::vec(0u8..8, 0..4))
            .prop_map(|(set, members)| Op::SetAddrSet { set, members }),
    ]
}

#[derive(Default)]
struct Model {
    datapaths: HashMap<u8, Uuid>,
    ports: HashMap<u8, (Uuid, Uuid)>,
    lflows: Vec<Uuid>,
    addr_sets: HashMap<u8, Uuid>,
}

impl Model {
    fn datapath(&mut self, h: &mut Harness, idx: u8) -> Uuid {
        *self
            .datapaths
            .entry(idx)
            .or_insert_with(|| seed_datapath(&mut h.sb, 100 + idx as i64))
    }

    fn apply(&mut self, h: &mut Harness, op: &Op) {
        match op {
            Op::BindPort(i) => {
                if self.ports.contains_key(i) {
                    return;
                }
                let dp = self.datapath(h, i % 3);
                let name = format!("lp{i}");
                let pb = seed_port_binding(&mut h.sb, &name, dp, 10 + *i as i64);
                let iface = seed_iface(&mut h.ovs, &format!("vif{i}"), &name, 20 + *i as i64);
                self.ports.insert(*i, (pb, iface));
            }
            Op::UnbindPort(i) => {
                if let Some((_pb, iface)) = self.ports.remove(i) {
                    h.ovs.delete("interface", iface);
                }
            }
            Op::AddLflow { dp, variant } => {
                let dp = self.datapath(h, *dp);
                let match_ = match variant {
                    0 => "ip".to_string(),
                    1 => "ip4.src == $set0".to_string(),
                    _ => "tcp && ip4.dst == $set1".to_string(),
                };
                let uuid = Uuid::new_v4();
                h.sb.insert(
                    "logical_flow",
                    Row::new(uuid)
                        .with("logical_datapath", dp.to_string())
                        .with("table_id", (*variant % 3) as i64)
                        .with("priority", 100 + *variant as i64)
                        .with("pipeline", "ingress")
                        .with("match", match_)
                        .with("actions", "next;"),
                );
                self.lflows.push(uuid);
            }
            Op::DelLflow(i) => {
                let idx = *i as usize;
                if idx < self.lflows.len() {
                    let uuid = self.lflows.remove(idx);
                    h.sb.delete("logical_flow", uuid);
                }
            }
            Op::SetAddrSet { set, members } => {
                let name = format!("set{set}");
                let addresses: Vec<String> = members
                    .iter()
                    .map(|m| format!("10.0.0.{m}"))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                match self.addr_sets.get(set) {
                    Some(uuid) => {
                        h.sb.update(
                            "address_set",
                            *uuid,
                            [("addresses".to_string(), json!(addresses))]
                                .into_iter()
                                .collect(),
                        );
                    }
                    None => {
                        let uuid = Uuid::new_v4();
                        h.sb.insert(
                            "address_set",
                            Row::new(uuid)
                                .with("name", name)
                                .with("addresses", json!(addresses)),
                        );
                        self.addr_sets.insert(*set, uuid);
                    }
                }
            }
        }
    }
}

type FlowImage = BTreeSet<(u8, u16, String, String)>;

fn snapshot(h: &Harness) -> (FlowImage, FlowImage) {
    let lflow = h
        .controller
        .engine
        .node::<LflowOutput>(&handles::lflow_output())
        .unwrap();
    let pflow = h
        .controller
        .engine
        .node::<PflowOutput>(&handles::pflow_output())
        .unwrap();
    let collect = |table: &flowsync_ofctrl::DesiredFlowTable| {
        table
            .iter()
            .map(|(key, flow)| {
                (
                    key.table,
                    key.priority,
                    key.match_.clone(),
                    flow.actions.clone(),
                )
            })
            .collect()
    };
    (collect(lflow.desired()), collect(pflow.desired()))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 12, .. ProptestConfig::default()
    })]

    #[test]
    fn test_incremental_matches_recompute(
        ops in proptest::collection::vec(op_strategy(), 1..12)
    ) {
        let mut h = Harness::new("hv1");
        h.settle();
        let mut model = Model::default();
        for op in &ops {
            model.apply(&mut h, op);
            h.step();
        }
        h.settle();
        let incremental = snapshot(&h);

        h.controller.engine.trigger_recompute("equivalence check");
        h.step();
        let recomputed = snapshot(&h);
        prop_assert_eq!(&incremental, &recomputed);

        // Idempotence: one more quiet run changes nothing.
        h.step();
        let quiet = snapshot(&h);
        prop_assert_eq!(&recomputed, &quiet);
    }
}
