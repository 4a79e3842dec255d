pub mod errors;
pub mod ids;
pub mod node;
pub mod ratelimit;

#[macro_use]
pub mod macros;

// Re-exports
pub use chrono;
pub use indexmap;
pub use log;
pub use parking_lot;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tracing;
pub use uuid;
