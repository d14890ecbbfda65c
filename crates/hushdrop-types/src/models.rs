use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque transport handle for a discovered or connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer as seen through discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub display_name: String,
}

/// The only plaintext sent before the encrypted frame.
///
/// On the wire this is just the UTF-8 bytes of the file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub file_name: String,
}

impl TransferMetadata {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        self.file_name.as_bytes().to_vec()
    }

    /// Invalid UTF-8 is replaced rather than rejected; the name is only a hint
    /// for the output file.
    pub fn from_wire(bytes: &[u8]) -> Self {
        Self {
            file_name: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Caller-facing reference to one transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: Uuid,
    pub role: Role,
}

impl SessionHandle {
    pub fn new(role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
        }
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The peer rejected the connection or the transport could not connect.
    ConnectionRejected,
    /// The transport dropped the connection.
    Disconnected,
    /// The frame was shorter than nonce + tag, or arrived out of order.
    MalformedStream,
    /// GCM tag mismatch: wrong password or tampered data.
    AuthenticationFailure,
    Cancelled,
    /// No connection within the configured timeout.
    TimedOut,
    /// Storage or transport I/O failure.
    Io { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRejected => f.write_str("connection rejected"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::MalformedStream => f.write_str("malformed stream"),
            Self::AuthenticationFailure => f.write_str("wrong password"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Io { message } => write!(f, "I/O error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Discovering,
    AwaitingCredential,
    Connecting,
    Connected,
    ExchangingMetadata,
    Transferring,
    Completed,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Discovering => f.write_str("discovering"),
            Self::AwaitingCredential => f.write_str("awaiting credential"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::ExchangingMetadata => f.write_str("exchanging metadata"),
            Self::Transferring => f.write_str("transferring"),
            Self::Completed => f.write_str("completed"),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// The file a completed receive produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
}
