//! The peer-to-peer transport seam.
//!
//! Commands are non-blocking; everything the transport observes comes back
//! as a [`TransportEvent`] on the channel handed to the implementation at
//! construction, and is consumed by exactly one dispatch loop.

pub mod lan;
pub mod memory;
pub mod pipe;

use std::fmt;
use std::io::{self, Read};

use bytes::Bytes;

use hushdrop_types::EndpointId;

/// Bulk payload source. Read on a blocking thread.
pub type PayloadStream = Box<dyn Read + Send>;

pub enum Payload {
    /// A small control message, delivered whole.
    Bytes(Bytes),
    /// A byte stream. Reading it yields an error if the stream was cut.
    Stream(PayloadStream),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(data) => write!(f, "Bytes({} bytes)", data.len()),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    EndpointFound {
        endpoint: EndpointId,
        name: String,
    },
    EndpointLost {
        endpoint: EndpointId,
    },
    /// A connection is pending on both sides; each must accept or reject it.
    /// `incoming` is true on the side that did not call `request_connection`.
    ConnectionInitiated {
        endpoint: EndpointId,
        remote_name: String,
        incoming: bool,
    },
    ConnectionResult {
        endpoint: EndpointId,
        accepted: bool,
    },
    /// The remote side went away or the link dropped. Not raised for a
    /// local `disconnect`.
    Disconnected {
        endpoint: EndpointId,
    },
    PayloadReceived {
        endpoint: EndpointId,
        payload: Payload,
    },
    /// Bytes of an outgoing stream handed to the link so far.
    TransferProgress {
        endpoint: EndpointId,
        bytes: u64,
    },
    /// An outgoing stream reached its end and all of it, end marker
    /// included, left this process. Exactly one of this or `TransferFailed`
    /// ends every outgoing stream.
    TransferComplete {
        endpoint: EndpointId,
    },
    TransferFailed {
        endpoint: EndpointId,
        error: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(EndpointId),

    #[error("not connected to {0}")]
    NotConnected(EndpointId),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A discovery + connection + payload transport.
///
/// Every method returns immediately. Outcomes are reported as events.
pub trait Transport: Send + Sync {
    fn start_advertising(&self, local_name: &str) -> Result<(), TransportError>;
    fn stop_advertising(&self);

    fn start_discovery(&self) -> Result<(), TransportError>;
    fn stop_discovery(&self);

    fn request_connection(
        &self,
        local_name: &str,
        endpoint: &EndpointId,
    ) -> Result<(), TransportError>;
    fn accept_connection(&self, endpoint: &EndpointId) -> Result<(), TransportError>;
    fn reject_connection(&self, endpoint: &EndpointId) -> Result<(), TransportError>;

    /// Control message. Ordered with respect to streams on the same link.
    fn send_bytes(&self, endpoint: &EndpointId, data: Bytes) -> Result<(), TransportError>;
    fn send_stream(&self, endpoint: &EndpointId, stream: PayloadStream)
    -> Result<(), TransportError>;

    /// Close the link. Only the remote side is notified. No-op when not connected.
    fn disconnect(&self, endpoint: &EndpointId);
}
