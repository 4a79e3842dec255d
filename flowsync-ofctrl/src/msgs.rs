use crate::errors::OfError;
use flowsync_types::ids::FlowCookie;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowModCommand {
    Add,
    Modify,
    Delete,
}

/// Message to the switch. The encoding to actual OpenFlow wire format is a
/// collaborator; the engine's contract ends at this enum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OfMsg {
    FlowMod {
        command: FlowModCommand,
        table: u8,
        priority: u16,
        match_: String,
        actions: String,
        cookie: FlowCookie,
    },
    GroupMod {
        add: bool,
        id: u32,
        definition: String,
    },
    MeterMod {
        add: bool,
        id: u32,
        definition: String,
    },
    /// Barrier used by the sequence-number subsystem to learn when earlier
    /// messages have been processed by the switch.
    Barrier { xid: u64 },
}

/// The control channel to the local switch.
pub trait OfConn: Debug {
    fn connected(&self) -> bool;
    /// Bytes (messages, in this model) queued but not yet taken by the
    /// switch. `put()` holds off while a backlog is present.
    fn backlog(&self) -> usize;
    fn send(&mut self, msg: OfMsg) -> Result<(), OfError>;
}
