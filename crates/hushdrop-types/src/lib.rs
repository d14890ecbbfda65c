pub mod events;
pub mod models;

pub use events::SessionEvent;
pub use models::{
    Endpoint, EndpointId, FailureReason, ReceivedFile, Role, SessionHandle, SessionState,
    TransferMetadata,
};
