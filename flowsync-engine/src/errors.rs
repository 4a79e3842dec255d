use flowsync_db::DbError;
use flowsync_types::errors::BoxedError;
use flowsync_types::node::NodeHandle;
use flowsync_types::thiserror::{self, Error};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Adding this edge would have created a cycle")]
    WouldCycle,
    #[error("Invalid node handle: {0}")]
    InvalidNodeHandle(NodeHandle),
    #[error("Node {0} is not of the requested payload type")]
    NodeTypeMismatch(NodeHandle),
    #[error("Node {0} cannot be read while it is being run")]
    NodeUnavailable(NodeHandle),
    #[error("Engine has not been initialized")]
    NotInitialized,

    // Error forwarders
    #[error(transparent)]
    Database(#[from] DbError),
    #[error(transparent)]
    Internal(#[from] BoxedError),
}

impl EngineError {
    /// Wraps a collaborator error that has no dedicated variant.
    pub fn internal(err: impl Into<BoxedError>) -> Self {
        EngineError::Internal(err.into())
    }
}
