use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Compact per-datapath identifier shipped by the southbound database.
/// Survives reconnects and re-snapshots, unlike row pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TunnelKey(pub u32);

impl Display for TunnelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 16-bit connection-tracking zone id assigned per logical port (and per
/// SNAT context) on this chassis.
pub type ZoneId = u16;

/// OpenFlow cookie recording the originating logical-flow row, so installed
/// rules can be retracted when their source is withdrawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowCookie(pub u64);

impl FlowCookie {
    /// Derives the cookie from a logical-flow row UUID. Only the leading
    /// 64 bits participate; retraction goes through the full UUID map.
    pub fn from_uuid(uuid: &Uuid) -> Self {
        let bytes = uuid.as_bytes();
        Self(u64::from_be_bytes(bytes[..8].try_into().unwrap()))
    }
}

impl Display for FlowCookie {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
