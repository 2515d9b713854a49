use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Nothing has been started yet.
    Idle,
    /// Caller asked for the link to stop.
    Stopped,
    /// Link watchdog expired without a sample.
    Timeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DisconnectReason::Idle => "idle",
            DisconnectReason::Stopped => "stopped",
            DisconnectReason::Timeout => "timeout",
        })
    }
}

/// Link state owned by the reconnection supervisor. Exactly one is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected(DisconnectReason),
    Connecting { attempt: u32 },
    Connected { source: String },
    Error { reason: String, attempts: u32, terminal: bool },
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected(DisconnectReason::Idle)
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Error { terminal: true, .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({})", reason),
            ConnectionState::Connecting { attempt } => write!(f, "connecting (attempt {})", attempt),
            ConnectionState::Connected { source } => write!(f, "connected ({})", source),
            ConnectionState::Error { reason, attempts, terminal } => {
                if *terminal {
                    write!(f, "failed after {} attempts: {}", attempts, reason)
                } else {
                    write!(f, "error (attempt {}): {}", attempts, reason)
                }
            }
        }
    }
}
