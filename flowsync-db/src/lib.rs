pub mod conditions;
pub mod errors;
pub mod index;
pub mod replica;
pub mod row;
pub mod session;
pub mod table;
pub mod txn;

pub use conditions::{Clause, Condition, ConditionBuilder};
pub use errors::DbError;
pub use index::{Index, IndexKey, IndexKeyFn};
pub use replica::Replica;
pub use row::{uuid_datum, Datum, Row};
pub use session::{CondRequest, DbMsg, DbSession, SessionEvents, TxnRequest};
pub use table::{RowChange, Table, TableSink, TrackedRow};
pub use txn::{Txn, TxnOp, TxnStatus};
