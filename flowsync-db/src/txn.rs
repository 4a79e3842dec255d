use crate::row::{Datum, Row};
use flowsync_types::indexmap::IndexMap;
use flowsync_types::uuid::Uuid;
use serde::{Deserialize, Serialize};

/// Outcome of a committed transaction, mirrored back by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    /// Built but not handed to the session yet.
    Unsent,
    /// Sent; reply not seen yet.
    InProgress,
    Success,
    /// Commit raced with another client; safe to rebuild and resend.
    TryAgain,
    Aborted,
}

/// One mutation inside a transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TxnOp {
    Insert {
        table: String,
        row: Row,
    },
    Update {
        table: String,
        uuid: Uuid,
        columns: IndexMap<String, Datum>,
    },
    /// Point write into a map-valued column (`external_ids` style).
    SetKey {
        table: String,
        uuid: Uuid,
        column: String,
        key: String,
        value: String,
    },
    DeleteKey {
        table: String,
        uuid: Uuid,
        column: String,
        key: String,
    },
    Delete {
        table: String,
        uuid: Uuid,
    },
}

/// A write transaction under construction. Writer nodes append operations
/// during the iteration; the commit coordinator hands the finished set to
/// the session in one shot.
#[derive(Debug, Default)]
pub struct Txn {
    ops: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<TxnOp> {
        self.ops
    }

    pub fn insert(&mut self, table: impl Into<String>, row: Row) {
        self.ops.push(TxnOp::Insert {
            table: table.into(),
            row,
        });
    }

    pub fn update(
        &mut self,
        table: impl Into<String>,
        uuid: Uuid,
        columns: IndexMap<String, Datum>,
    ) {
        self.ops.push(TxnOp::Update {
            table: table.into(),
            uuid,
            columns,
        });
    }

    pub fn update_column(
        &mut self,
        table: impl Into<String>,
        uuid: Uuid,
        column: impl Into<String>,
        value: impl Into<Datum>,
    ) {
        self.update(
            table,
            uuid,
            [(column.into(), value.into())].into_iter().collect(),
        );
    }

    pub fn set_key(
        &mut self,
        table: impl Into<String>,
        uuid: Uuid,
        column: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.ops.push(TxnOp::SetKey {
            table: table.into(),
            uuid,
            column: column.into(),
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete_key(
        &mut self,
        table: impl Into<String>,
        uuid: Uuid,
        column: impl Into<String>,
        key: impl Into<String>,
    ) {
        self.ops.push(TxnOp::DeleteKey {
            table: table.into(),
            uuid,
            column: column.into(),
            key: key.into(),
        });
    }

    pub fn delete(&mut self, table: impl Into<String>, uuid: Uuid) {
        self.ops.push(TxnOp::Delete {
            table: table.into(),
            uuid,
        });
    }
}
