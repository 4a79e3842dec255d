pub mod errors;
pub mod extend;
pub mod flow;
pub mod msgs;
pub mod put;
pub mod seqno;

pub use errors::OfError;
pub use extend::{ExtendTable, ExtendedId};
pub use flow::{DesiredFlow, DesiredFlowTable, FlowKey, InstalledFlowTable};
pub use msgs::{FlowModCommand, OfConn, OfMsg};
pub use put::{put, PutResult};
pub use seqno::{SeqnoSubsys, SeqnoType};
