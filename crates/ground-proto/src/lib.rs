pub mod link;
pub mod telemetry;

pub use link::{ConnectionState, DisconnectReason};
pub use telemetry::{HistoryRecord, TelemetrySample};
