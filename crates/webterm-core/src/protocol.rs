//! Wire types shared between the broker and its transports.

use serde::{Deserialize, Serialize};

/// Unique identifier for a terminal session.
///
/// Assigned in strictly increasing order starting at 1 and never reused
/// within a broker process.
pub type TerminalId = u64;

/// Response body for a successful open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenedResponse {
    pub terminal_id: TerminalId,
}
