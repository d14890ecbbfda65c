use serde::{Deserialize, Serialize};

use crate::models::{FailureReason, ReceivedFile, SessionHandle, SessionState};

/// Events published by the coordinator to the UI/CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    /// A session moved to a new state.
    StateChanged {
        session: SessionHandle,
        state: SessionState,
    },

    /// Bytes moved so far. `total_bytes` is known on the sending side only.
    Progress {
        session: SessionHandle,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
    },

    /// Emitted once, right after the `Failed` state change.
    Error {
        session: SessionHandle,
        reason: FailureReason,
    },

    /// The receiver authenticated and committed the output file.
    FileReceived {
        session: SessionHandle,
        file: ReceivedFile,
    },

    /// The discovered peer list changed (display names, insertion order).
    EndpointsChanged { endpoints: Vec<String> },
}

impl SessionEvent {
    /// Returns the session this event is scoped to.
    /// `EndpointsChanged` belongs to discovery, not to a session.
    pub fn session(&self) -> Option<SessionHandle> {
        match self {
            Self::StateChanged { session, .. }
            | Self::Progress { session, .. }
            | Self::Error { session, .. }
            | Self::FileReceived { session, .. } => Some(*session),
            Self::EndpointsChanged { .. } => None,
        }
    }
}
