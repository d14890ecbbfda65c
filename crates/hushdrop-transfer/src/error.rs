use hushdrop_types::Role;

use crate::session::InvalidTransition;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Synchronous errors returned by coordinator calls. None of these create or
/// touch a session; session failures are reported through events instead.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("password must not be empty")]
    EmptyPassword,

    #[error("no file selected")]
    EmptyFileSelection,

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("a {0} session is already active")]
    SessionBusy(Role),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] InvalidTransition),
}
