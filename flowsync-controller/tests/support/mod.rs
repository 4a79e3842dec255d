//! In-process fakes for the three collaborators the daemon talks to: the
//! two databases (authoritative row stores that echo applied transactions
//! back as row deltas) and the OpenFlow switch (records messages, lets the
//! test acknowledge barriers).

use crossbeam::channel::{unbounded, Receiver, Sender};
use flowsync_controller::controller::OfEvent;
use flowsync_controller::lflow_cache::LflowCache;
use flowsync_controller::netlink::{
    LoopbackNetlink, NeighOp, NetlinkEvent, NetlinkPort, RouteOp,
};
use flowsync_types::errors::BoxedError;
use flowsync_controller::{graph, Controller, ControllerOptions, IterationStatus};
use flowsync_db::{
    CondRequest, Datum, DbMsg, DbSession, Replica, Row, TxnOp, TxnRequest, TxnStatus,
};
use flowsync_ofctrl::{OfConn, OfError, OfMsg};
use flowsync_controller::tables;
use flowsync_types::indexmap::IndexMap;
use flowsync_types::serde_json::json;
use flowsync_types::uuid::Uuid;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct FakeDb {
    pub store: Replica,
    msg_tx: Sender<DbMsg>,
    txn_rx: Receiver<TxnRequest>,
    cond_rx: Receiver<CondRequest>,
}

impl FakeDb {
    pub fn new(
        name: &'static str,
        tables: &[&str],
    ) -> (Self, Receiver<DbMsg>, Sender<TxnRequest>, Sender<CondRequest>) {
        let (msg_tx, msg_rx) = unbounded();
        let (txn_tx, txn_rx) = unbounded();
        let (cond_tx, cond_rx) = unbounded();
        (
            Self {
                store: Replica::new(name, tables),
                msg_tx,
                txn_rx,
                cond_rx,
            },
            msg_rx,
            txn_tx,
            cond_tx,
        )
    }

    pub fn insert(&mut self, table: &str, row: Row) {
        self.store.table_mut(table).unwrap().apply_insert(row.clone()).unwrap();
        self.msg_tx
            .send(DbMsg::Insert {
                table: table.to_string(),
                row,
            })
            .unwrap();
    }

    pub fn update(&mut self, table: &str, uuid: Uuid, columns: IndexMap<String, Datum>) {
        self.store
            .table_mut(table)
            .unwrap()
            .apply_update(uuid, columns.clone())
            .unwrap();
        self.msg_tx
            .send(DbMsg::Update {
                table: table.to_string(),
                uuid,
                columns,
            })
            .unwrap();
    }

    pub fn delete(&mut self, table: &str, uuid: Uuid) {
        self.store.table_mut(table).unwrap().apply_delete(uuid).unwrap();
        self.msg_tx
            .send(DbMsg::Delete {
                table: table.to_string(),
                uuid,
            })
            .unwrap();
    }

    pub fn set_writable(&self, writable: bool) {
        self.msg_tx.send(DbMsg::Writable(writable)).unwrap();
    }

    pub fn row(&self, table: &str, uuid: &Uuid) -> Option<Row> {
        self.store.table(table).unwrap().get(uuid).cloned()
    }

    pub fn find_by(&self, table: &str, column: &str, value: &str) -> Option<Row> {
        self.store
            .table(table)
            .unwrap()
            .iter()
            .find(|row| row.str(column) == Some(value))
            .cloned()
    }

    /// Applies queued client transactions and condition changes,
    /// echoing the results back the way a real server would.
    pub fn step(&mut self) {
        while let Ok(request) = self.txn_rx.try_recv() {
            for op in request.ops {
                self.apply_op(op);
            }
            self.msg_tx
                .send(DbMsg::TxnReply {
                    id: request.id,
                    status: TxnStatus::Success,
                })
                .unwrap();
        }
        let mut acked = None;
        while let Ok(cond) = self.cond_rx.try_recv() {
            acked = Some(cond.seqno.max(acked.unwrap_or(0)));
        }
        if let Some(seqno) = acked {
            self.msg_tx.send(DbMsg::CondAck { seqno }).unwrap();
        }
    }

    /// Fails queued transactions instead of applying them.
    pub fn reject_txns(&mut self) {
        while let Ok(request) = self.txn_rx.try_recv() {
            self.msg_tx
                .send(DbMsg::TxnReply {
                    id: request.id,
                    status: TxnStatus::TryAgain,
                })
                .unwrap();
        }
    }

    fn apply_op(&mut self, op: TxnOp) {
        match op {
            TxnOp::Insert { table, row } => self.insert(&table, row),
            TxnOp::Update {
                table,
                uuid,
                columns,
            } => self.update(&table, uuid, columns),
            TxnOp::SetKey {
                table,
                uuid,
                column,
                key,
                value,
            } => {
                let mut map = self
                    .row(&table, &uuid)
                    .and_then(|row| row.get(&column).cloned())
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default();
                map.insert(key, json!(value));
                self.update(
                    &table,
                    uuid,
                    [(column, Datum::Object(map))].into_iter().collect(),
                );
            }
            TxnOp::DeleteKey {
                table,
                uuid,
                column,
                key,
            } => {
                let mut map = self
                    .row(&table, &uuid)
                    .and_then(|row| row.get(&column).cloned())
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default();
                map.remove(&key);
                self.update(
                    &table,
                    uuid,
                    [(column, Datum::Object(map))].into_iter().collect(),
                );
            }
            TxnOp::Delete { table, uuid } => self.delete(&table, uuid),
        }
    }
}

/// Netlink port whose applied state stays visible to the test.
#[derive(Clone, Debug, Default)]
pub struct SharedNetlink {
    pub inner: Arc<Mutex<LoopbackNetlink>>,
}

impl NetlinkPort for SharedNetlink {
    fn apply_routes(&mut self, ops: &[RouteOp]) -> Result<u64, BoxedError> {
        self.inner.lock().unwrap().apply_routes(ops)
    }

    fn apply_neighs(&mut self, ops: &[NeighOp]) -> Result<u64, BoxedError> {
        self.inner.lock().unwrap().apply_neighs(ops)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SwitchState {
    pub msgs: Arc<Mutex<Vec<OfMsg>>>,
    pub connected: Arc<AtomicBool>,
    pub backlog: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct FakeSwitchConn {
    state: SwitchState,
}

impl OfConn for FakeSwitchConn {
    fn connected(&self) -> bool {
        self.state.connected.load(Ordering::Relaxed)
    }

    fn backlog(&self) -> usize {
        self.state.backlog.load(Ordering::Relaxed)
    }

    fn send(&mut self, msg: OfMsg) -> Result<(), OfError> {
        self.state.msgs.lock().unwrap().push(msg);
        Ok(())
    }
}

pub struct Harness {
    pub controller: Controller,
    pub sb: FakeDb,
    pub ovs: FakeDb,
    pub switch: SwitchState,
    pub of_tx: Sender<OfEvent>,
    pub netlink_tx: Sender<NetlinkEvent>,
    pub netlink: SharedNetlink,
    acked_barriers: Vec<u64>,
    _sysconfdir: tempfile::TempDir,
}

impl Harness {
    pub fn new(chassis: &str) -> Self {
        let (mut ovs, ovs_inbox, ovs_txn_tx, ovs_cond_tx) =
            FakeDb::new("vswitch", tables::ovs::ALL);
        let (sb, sb_inbox, sb_txn_tx, sb_cond_tx) =
            FakeDb::new("southbound", tables::sb::ALL);

        // The open-vswitch row exists on any host with a running switch.
        ovs.insert(
            "open_vswitch",
            Row::new(Uuid::new_v4()).with(
                "external_ids",
                json!({"system-id": chassis, "ovn-encap-ip": "192.0.2.10"}),
            ),
        );

        let engine = graph::build(String::new(), LflowCache::new(Default::default())).unwrap();
        let sb_session = DbSession::new("southbound", sb_inbox, sb_txn_tx, sb_cond_tx);
        let ovs_session = DbSession::new("vswitch", ovs_inbox, ovs_txn_tx, ovs_cond_tx);

        let switch = SwitchState::default();
        switch.connected.store(true, Ordering::Relaxed);
        let (of_tx, of_rx) = unbounded();
        let (netlink_tx, netlink_rx) = unbounded();

        let sysconfdir = tempfile::tempdir().unwrap();
        let netlink = SharedNetlink::default();
        let controller = Controller::new(
            engine,
            sb_session,
            ovs_session,
            Box::new(FakeSwitchConn {
                state: switch.clone(),
            }),
            of_rx,
            Box::new(netlink.clone()),
            netlink_rx,
            ControllerOptions {
                chassis: None,
                sysconfdir: sysconfdir.path().to_path_buf(),
                unixctl: None,
            },
        );

        Self {
            controller,
            sb,
            ovs,
            switch,
            of_tx,
            netlink_tx,
            netlink,
            acked_barriers: Vec::new(),
            _sysconfdir: sysconfdir,
        }
    }

    /// One daemon iteration plus the fakes' server side: apply
    /// transactions, acknowledge conditions and barriers.
    pub fn step(&mut self) -> IterationStatus {
        let status = self.controller.run_once().unwrap();
        self.sb.step();
        self.ovs.step();
        self.ack_barriers();
        status
    }

    /// Runs enough iterations for write-echo-read cycles to settle.
    pub fn settle(&mut self) {
        for _ in 0..6 {
            self.step();
        }
    }

    pub fn ack_barriers(&mut self) {
        let barriers: Vec<u64> = self
            .switch
            .msgs
            .lock()
            .unwrap()
            .iter()
            .filter_map(|msg| match msg {
                OfMsg::Barrier { xid } => Some(*xid),
                _ => None,
            })
            .collect();
        for xid in barriers {
            if !self.acked_barriers.contains(&xid) {
                self.acked_barriers.push(xid);
                self.of_tx.send(OfEvent::BarrierAck(xid)).unwrap();
            }
        }
    }

    pub fn sent_msgs(&self) -> Vec<OfMsg> {
        self.switch.msgs.lock().unwrap().clone()
    }
}

/// Seeds a southbound datapath binding; returns its row UUID.
pub fn seed_datapath(sb: &mut FakeDb, tunnel_key: i64) -> Uuid {
    let uuid = Uuid::new_v4();
    sb.insert(
        "datapath_binding",
        Row::new(uuid)
            .with("tunnel_key", tunnel_key)
            .with("external_ids", json!({})),
    );
    uuid
}

/// Seeds a port binding on `datapath`; returns its row UUID.
pub fn seed_port_binding(sb: &mut FakeDb, name: &str, datapath: Uuid, tunnel_key: i64) -> Uuid {
    let uuid = Uuid::new_v4();
    sb.insert(
        "port_binding",
        Row::new(uuid)
            .with("logical_port", name)
            .with("datapath", datapath.to_string())
            .with("tunnel_key", tunnel_key)
            .with("type", "")
            .with("chassis", "")
            .with("options", json!({})),
    );
    uuid
}

/// Seeds a vswitch interface advertising `iface_id`; returns its row UUID.
pub fn seed_iface(ovs: &mut FakeDb, name: &str, iface_id: &str, ofport: i64) -> Uuid {
    let uuid = Uuid::new_v4();
    ovs.insert(
        "interface",
        Row::new(uuid)
            .with("name", name)
            .with("ofport", ofport)
            .with("external_ids", json!({"iface-id": iface_id})),
    );
    uuid
}
