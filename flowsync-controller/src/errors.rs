use flowsync_db::DbError;
use flowsync_engine::EngineError;
use flowsync_ofctrl::OfError;
use flowsync_types::errors::BoxedError;
use flowsync_types::thiserror::{self, Error};

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Chassis identity is not configured (no --chassis, override file or system-id)")]
    NoChassisId,
    #[error("Cannot bind unixctl socket {path}: {source}")]
    UnixctlBind {
        path: String,
        source: std::io::Error,
    },
    #[error("Integration bridge {0} cannot be created: open-vswitch row missing")]
    NoOpenVswitchRow(String),

    // Error forwarders
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error(transparent)]
    OpenFlow(#[from] OfError),
    #[error(transparent)]
    Internal(#[from] BoxedError),
}
