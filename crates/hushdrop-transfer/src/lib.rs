//! Discovery, pairing and encrypted single-file transfer between two peers.
//!
//! The [`TransferCoordinator`] owns at most one session per role and is driven
//! by a single stream of [`TransportEvent`]s. Bulk encryption and decryption
//! run on blocking workers connected to the transport through bounded pipes.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod registry;
pub mod session;
pub mod stats;
pub mod storage;
pub mod transport;
mod worker;

pub use config::CoordinatorConfig;
pub use coordinator::TransferCoordinator;
pub use error::CoordinatorError;
pub use registry::EndpointRegistry;
pub use session::{InvalidTransition, TransferSession};
pub use stats::{ProgressSnapshot, SessionStats};
pub use storage::{StagedFile, Storage, StorageError, mime_type_for};
pub use transport::{Payload, PayloadStream, Transport, TransportError, TransportEvent};
