use flowsync_types::thiserror::{self, Error};
use flowsync_types::uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),
    #[error("Unknown index {index} on table {table}")]
    UnknownIndex { table: String, index: String },
    #[error("Index {index} already exists on table {table}")]
    DuplicateIndex { table: String, index: String },
    #[error("Row {0} not found")]
    RowNotFound(Uuid),
    #[error("Row {0} already exists")]
    RowAlreadyExists(Uuid),
    #[error("Column {column} of row {uuid} is not a map")]
    NotAMap { uuid: Uuid, column: String },
    #[error("A transaction is already in flight")]
    TxnInFlight,
    #[error("The database is read-only")]
    NotWritable,
    #[error("Session channel disconnected")]
    ChannelDisconnected,
}
