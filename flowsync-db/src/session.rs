use crate::conditions::Condition;
use crate::errors::DbError;
use crate::row::{Datum, Row};
use crate::table::TableSink;
use crate::txn::{Txn, TxnOp, TxnStatus};
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use flowsync_types::indexmap::IndexMap;
use flowsync_types::log::{debug, info, warn};
use flowsync_types::uuid::Uuid;
use serde::{Deserialize, Serialize};

/// One message from the database server to this client. The transport that
/// produces these (JSON-RPC in production, the fake server in tests) is a
/// collaborator; the engine only consumes the drained result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DbMsg {
    /// Full row set for one table; replaces current contents.
    Snapshot { table: String, rows: Vec<Row> },
    Insert {
        table: String,
        row: Row,
    },
    Update {
        table: String,
        uuid: Uuid,
        columns: IndexMap<String, Datum>,
    },
    Delete {
        table: String,
        uuid: Uuid,
    },
    /// Server acknowledged monitor conditions up to `seqno`.
    CondAck { seqno: u64 },
    TxnReply { id: u64, status: TxnStatus },
    Writable(bool),
    /// Connection dropped and re-established; snapshots follow.
    Reconnected,
}

/// A transaction as handed to the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxnRequest {
    pub id: u64,
    pub ops: Vec<TxnOp>,
}

/// A monitor-condition change as handed to the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CondRequest {
    pub seqno: u64,
    pub table: String,
    pub condition: Condition,
}

/// What one drain of the inbox amounted to, summarized for the main loop.
#[derive(Debug, Default)]
pub struct SessionEvents {
    pub reconnected: bool,
    pub writable_changed: bool,
    pub cond_acked: bool,
    pub rows_changed: bool,
    pub txn_replies: Vec<(u64, TxnStatus)>,
}

impl SessionEvents {
    pub fn any(&self) -> bool {
        self.reconnected
            || self.writable_changed
            || self.cond_acked
            || self.rows_changed
            || !self.txn_replies.is_empty()
    }
}

/// Client session for one database: connection state plus the channel pair
/// the transport feeds. Messages are drained at the top of an engine
/// iteration, never inside one; row changes are routed into the caller's
/// [`TableSink`].
#[derive(Debug)]
pub struct DbSession {
    name: String,
    inbox: Receiver<DbMsg>,
    txn_outbox: Sender<TxnRequest>,
    cond_outbox: Sender<CondRequest>,
    writable: bool,
    conditions: IndexMap<String, Condition>,
    expected_cond_seqno: u64,
    acked_cond_seqno: u64,
    next_txn_id: u64,
    in_flight: Option<u64>,
}

impl DbSession {
    pub fn new(
        name: impl Into<String>,
        inbox: Receiver<DbMsg>,
        txn_outbox: Sender<TxnRequest>,
        cond_outbox: Sender<CondRequest>,
    ) -> Self {
        Self {
            name: name.into(),
            inbox,
            txn_outbox,
            cond_outbox,
            writable: true,
            conditions: IndexMap::new(),
            expected_cond_seqno: 0,
            acked_cond_seqno: 0,
            next_txn_id: 1,
            in_flight: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw inbox, for the main loop's poll-block over all inputs.
    pub fn inbox(&self) -> &Receiver<DbMsg> {
        &self.inbox
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn txn_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// A writable iteration requires a writable server and no transaction
    /// already in flight.
    pub fn can_write(&self) -> bool {
        self.writable && self.in_flight.is_none()
    }

    /// Drains every pending message without blocking and applies row
    /// changes to `tables`. Returns a summary the main loop folds into
    /// engine inputs.
    pub fn run(&mut self, tables: &mut dyn TableSink) -> Result<SessionEvents, DbError> {
        let mut events = SessionEvents::default();
        loop {
            let msg = match self.inbox.try_recv() {
                Ok(msg) => msg,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(DbError::ChannelDisconnected),
            };
            match msg {
                DbMsg::Snapshot { table, rows } => {
                    tables.sink_table_mut(&table)?.reset(rows);
                    events.rows_changed = true;
                }
                DbMsg::Insert { table, row } => {
                    tables.sink_table_mut(&table)?.apply_insert(row)?;
                    events.rows_changed = true;
                }
                DbMsg::Update {
                    table,
                    uuid,
                    columns,
                } => {
                    tables.sink_table_mut(&table)?.apply_update(uuid, columns)?;
                    events.rows_changed = true;
                }
                DbMsg::Delete { table, uuid } => {
                    tables.sink_table_mut(&table)?.apply_delete(uuid)?;
                    events.rows_changed = true;
                }
                DbMsg::CondAck { seqno } => {
                    if seqno > self.acked_cond_seqno {
                        self.acked_cond_seqno = seqno;
                    }
                    events.cond_acked = true;
                }
                DbMsg::TxnReply { id, status } => {
                    if self.in_flight == Some(id) {
                        self.in_flight = None;
                        events.txn_replies.push((id, status));
                    } else {
                        warn!("{}: reply for unknown transaction {id} ({status:?})", self.name);
                    }
                }
                DbMsg::Writable(writable) => {
                    if self.writable != writable {
                        info!(
                            "{}: database became {}",
                            self.name,
                            if writable { "writable" } else { "read-only" }
                        );
                        self.writable = writable;
                        events.writable_changed = true;
                    }
                }
                DbMsg::Reconnected => {
                    info!("{}: connection re-established", self.name);
                    if let Some(id) = self.in_flight.take() {
                        events.txn_replies.push((id, TxnStatus::TryAgain));
                    }
                    events.reconnected = true;
                }
            }
        }
        Ok(events)
    }

    /// Hands a finished transaction to the transport. At most one may be in
    /// flight; callers retry next iteration on `TxnInFlight`.
    pub fn send_txn(&mut self, txn: Txn) -> Result<u64, DbError> {
        if !self.writable {
            return Err(DbError::NotWritable);
        }
        if self.in_flight.is_some() {
            return Err(DbError::TxnInFlight);
        }
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.txn_outbox
            .send(TxnRequest {
                id,
                ops: txn.into_ops(),
            })
            .map_err(|_| DbError::ChannelDisconnected)?;
        self.in_flight = Some(id);
        Ok(id)
    }

    /// Submits the monitor condition asked of the server for `table`.
    /// A no-op when nothing changed; otherwise the expected seqno advances
    /// and the new condition goes to the transport.
    pub fn set_condition(&mut self, table: &str, condition: Condition) -> Result<u64, DbError> {
        if self.conditions.get(table) == Some(&condition) {
            return Ok(self.expected_cond_seqno);
        }
        debug!("{}: monitor condition for {table} -> {condition:?}", self.name);
        self.conditions.insert(table.to_string(), condition.clone());
        self.expected_cond_seqno += 1;
        self.cond_outbox
            .send(CondRequest {
                seqno: self.expected_cond_seqno,
                table: table.to_string(),
                condition,
            })
            .map_err(|_| DbError::ChannelDisconnected)?;
        Ok(self.expected_cond_seqno)
    }

    pub fn condition(&self, table: &str) -> Option<&Condition> {
        self.conditions.get(table)
    }

    pub fn expected_cond_seqno(&self) -> u64 {
        self.expected_cond_seqno
    }

    pub fn acked_cond_seqno(&self) -> u64 {
        self.acked_cond_seqno
    }

    /// All submitted conditions have been acknowledged; rows implied by the
    /// current local scope have arrived and `nb_cfg` may advance.
    pub fn conditions_acked(&self) -> bool {
        self.acked_cond_seqno >= self.expected_cond_seqno
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{Clause, ConditionBuilder};
    use crate::replica::Replica;
    use crossbeam::channel::unbounded;
    use flowsync_types::serde_json::json;

    fn session() -> (
        DbSession,
        Replica,
        Sender<DbMsg>,
        Receiver<TxnRequest>,
        Receiver<CondRequest>,
    ) {
        let (msg_tx, msg_rx) = unbounded();
        let (txn_tx, txn_rx) = unbounded();
        let (cond_tx, cond_rx) = unbounded();
        let replica = Replica::new("southbound", &["port_binding"]);
        (
            DbSession::new("southbound", msg_rx, txn_tx, cond_tx),
            replica,
            msg_tx,
            txn_rx,
            cond_rx,
        )
    }

    #[test]
    fn test_drain_applies_in_order() {
        let (mut session, mut replica, tx, _txn_rx, _cond_rx) = session();
        let uuid = Uuid::new_v4();
        tx.send(DbMsg::Insert {
            table: "port_binding".into(),
            row: Row::new(uuid).with("name", "lp1"),
        })
        .unwrap();
        tx.send(DbMsg::Update {
            table: "port_binding".into(),
            uuid,
            columns: [("chassis".to_string(), json!("hv1"))].into_iter().collect(),
        })
        .unwrap();

        let events = session.run(&mut replica).unwrap();
        assert!(events.rows_changed);
        let table = replica.table("port_binding").unwrap();
        assert_eq!(table.get(&uuid).unwrap().str("chassis"), Some("hv1"));
        assert_eq!(table.tracked().len(), 2);
    }

    #[test]
    fn test_reconnect_fails_in_flight_txn() {
        let (mut session, mut replica, tx, txn_rx, _cond_rx) = session();
        let mut txn = Txn::new();
        txn.update_column("port_binding", Uuid::new_v4(), "chassis", "hv1");
        let id = session.send_txn(txn).unwrap();
        assert_eq!(txn_rx.try_recv().unwrap().id, id);
        assert!(session.txn_in_flight());

        tx.send(DbMsg::Reconnected).unwrap();
        let events = session.run(&mut replica).unwrap();
        assert!(events.reconnected);
        assert_eq!(events.txn_replies, vec![(id, TxnStatus::TryAgain)]);
        assert!(!session.txn_in_flight());
    }

    #[test]
    fn test_single_txn_in_flight() {
        let (mut session, _replica, _tx, _txn_rx, _cond_rx) = session();
        session.send_txn(Txn::new()).unwrap();
        assert!(matches!(
            session.send_txn(Txn::new()),
            Err(DbError::TxnInFlight)
        ));
    }

    #[test]
    fn test_condition_seqno_bumps_only_on_change() {
        let (mut session, _replica, _tx, _txn_rx, _cond_rx) = session();
        let mut b = ConditionBuilder::new();
        b.clause(Clause::eq("chassis", "hv1"));
        let cond = b.build();

        let s1 = session.set_condition("port_binding", cond.clone()).unwrap();
        assert_eq!(s1, 1);
        let s2 = session.set_condition("port_binding", cond).unwrap();
        assert_eq!(s2, 1);
        assert!(!session.conditions_acked());
        session.acked_cond_seqno = 1;
        assert!(session.conditions_acked());
    }
}
