use std::error::Error;

/// Opaque error escape hatch for collaborator interfaces (database rpc,
/// OpenFlow channel, netlink) whose concrete error types we do not own.
pub type BoxedError = Box<dyn Error + Send + Sync + 'static>;

pub fn internal_err<T>(msg: impl Into<String>) -> Result<T, BoxedError> {
    Err(msg.into().into())
}
