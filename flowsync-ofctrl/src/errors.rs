use flowsync_types::errors::BoxedError;
use flowsync_types::thiserror::{self, Error};

#[derive(Error, Debug)]
pub enum OfError {
    #[error("OpenFlow channel is disconnected")]
    Disconnected,
    #[error("Extend table {kind} ids exhausted")]
    IdsExhausted { kind: &'static str },

    #[error(transparent)]
    Channel(#[from] BoxedError),
}
