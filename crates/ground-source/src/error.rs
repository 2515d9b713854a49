use std::time::Duration;
use thiserror::Error;

/// Why a source could not be brought up.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Transport or driver is missing for this endpoint.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Port or socket could not be opened.
    #[error("failed to open {endpoint}: {source}")]
    IoFailure {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Handshake or first health report did not arrive in time.
    #[error("no health report within {0:?}")]
    Timeout(Duration),
}

/// The transport closed underneath a running stream.
#[derive(Debug, Error)]
#[error("link lost: {0}")]
pub struct LinkLost(pub String);
