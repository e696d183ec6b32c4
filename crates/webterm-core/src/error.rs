//! Broker error taxonomy.
//!
//! Every failure a caller can observe maps to one of five kinds. Transports
//! surface errors as a short message prefixed with the kind tag so clients
//! can match on it without parsing prose.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::protocol::TerminalId;

/// Stable error kind tags for transport responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Allocation,
    Spawn,
    NotFound,
    Io,
    Parse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Allocation => write!(f, "ALLOCATION"),
            ErrorKind::Spawn => write!(f, "SPAWN"),
            ErrorKind::NotFound => write!(f, "NOT_FOUND"),
            ErrorKind::Io => write!(f, "IO"),
            ErrorKind::Parse => write!(f, "PARSE"),
        }
    }
}

/// Errors produced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The kernel refused to hand out a PTY pair, or wiring up the master
    /// handles failed.
    #[error("failed to allocate pty: {0}")]
    Allocation(String),

    /// The shell executable could not be spawned on the slave side.
    #[error("failed to start shell '{shell}': {reason}")]
    Spawn { shell: String, reason: String },

    /// No live session with this id. Closed sessions report the same kind;
    /// closure and eviction are indistinguishable to callers.
    #[error("terminal {0} not found")]
    NotFound(TerminalId),

    /// A read or write against the master handle failed.
    #[error("terminal i/o failed: {0}")]
    Io(String),

    /// The caller supplied a session id that is not a decimal integer.
    #[error("invalid terminal id '{0}'")]
    Parse(String),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Allocation(_) => ErrorKind::Allocation,
            BrokerError::Spawn { .. } => ErrorKind::Spawn,
            BrokerError::NotFound(_) => ErrorKind::NotFound,
            BrokerError::Io(_) => ErrorKind::Io,
            BrokerError::Parse(_) => ErrorKind::Parse,
        }
    }

    /// The `[KIND] message` form used in transport error bodies.
    pub fn tagged(&self) -> String {
        format!("[{}] {}", self.kind(), self)
    }

    pub fn spawn(shell: impl Into<String>, reason: impl fmt::Display) -> Self {
        BrokerError::Spawn {
            shell: shell.into(),
            reason: reason.to_string(),
        }
    }
}

/// Parse a decimal terminal id from a request path segment.
pub fn parse_terminal_id(raw: &str) -> Result<TerminalId, BrokerError> {
    raw.parse::<TerminalId>()
        .map_err(|_| BrokerError::Parse(raw.to_string()))
}
