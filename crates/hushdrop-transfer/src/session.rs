use hushdrop_crypto::{Credential, SymmetricKey};
use hushdrop_types::{
    EndpointId, FailureReason, Role, SessionHandle, SessionState, TransferMetadata,
};

/// A transition was requested from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} while {state}")]
pub struct InvalidTransition {
    pub action: &'static str,
    pub state: SessionState,
}

/// Per-peer state machine for one transfer.
///
/// Owns the endpoint reference, credential and derived key until it reaches a
/// terminal state, at which point they are dropped (the key and credential
/// zeroize themselves). A terminal session never leaves that state.
#[derive(Debug)]
pub struct TransferSession {
    handle: SessionHandle,
    state: SessionState,
    endpoint: Option<EndpointId>,
    credential: Option<Credential>,
    key: Option<SymmetricKey>,
    metadata: Option<TransferMetadata>,
    bytes_transferred: u64,
}

impl TransferSession {
    pub fn new(role: Role) -> Self {
        Self {
            handle: SessionHandle::new(role),
            state: SessionState::Idle,
            endpoint: None,
            credential: None,
            key: None,
            metadata: None,
            bytes_transferred: 0,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn role(&self) -> Role {
        self.handle.role
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn endpoint(&self) -> Option<&EndpointId> {
        self.endpoint.as_ref()
    }

    pub fn key(&self) -> Option<&SymmetricKey> {
        self.key.as_ref()
    }

    pub fn metadata(&self) -> Option<&TransferMetadata> {
        self.metadata.as_ref()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn start_discovery(&mut self) -> Result<(), InvalidTransition> {
        self.require(SessionState::Idle, "start discovery")?;
        self.state = SessionState::Discovering;
        Ok(())
    }

    pub fn select_endpoint(&mut self, endpoint: EndpointId) -> Result<(), InvalidTransition> {
        self.require(SessionState::Discovering, "select an endpoint")?;
        self.endpoint = Some(endpoint);
        self.state = SessionState::AwaitingCredential;
        Ok(())
    }

    /// Derives the session key from the credential.
    pub fn supply_credential(&mut self, credential: Credential) -> Result<(), InvalidTransition> {
        self.require(SessionState::AwaitingCredential, "supply a credential")?;
        self.key = Some(credential.derive_key());
        self.credential = Some(credential);
        self.state = SessionState::Connecting;
        Ok(())
    }

    pub fn connection_established(&mut self) -> Result<(), InvalidTransition> {
        self.require(SessionState::Connecting, "establish a connection")?;
        self.state = SessionState::Connected;
        Ok(())
    }

    pub fn connection_failed(&mut self) -> Result<(), InvalidTransition> {
        self.require(SessionState::Connecting, "fail a connection")?;
        self.fail(FailureReason::ConnectionRejected);
        Ok(())
    }

    /// Sender: metadata was transmitted. Receiver: metadata arrived.
    pub fn begin_metadata(&mut self, metadata: TransferMetadata) -> Result<(), InvalidTransition> {
        self.require(SessionState::Connected, "exchange metadata")?;
        self.metadata = Some(metadata);
        self.state = SessionState::ExchangingMetadata;
        Ok(())
    }

    pub fn begin_transfer(&mut self) -> Result<(), InvalidTransition> {
        self.require(SessionState::ExchangingMetadata, "begin the transfer")?;
        self.state = SessionState::Transferring;
        Ok(())
    }

    pub fn record_progress(&mut self, bytes: u64) -> Result<(), InvalidTransition> {
        self.require(SessionState::Transferring, "record progress")?;
        self.bytes_transferred = bytes;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), InvalidTransition> {
        self.require(SessionState::Transferring, "complete")?;
        self.state = SessionState::Completed;
        self.release();
        Ok(())
    }

    /// Moves any non-terminal session to `Failed`. Returns false (and changes
    /// nothing) if the session had already ended.
    pub fn fail(&mut self, reason: FailureReason) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Failed(reason);
        self.release();
        true
    }

    fn require(&self, expected: SessionState, action: &'static str) -> Result<(), InvalidTransition> {
        if self.state == expected {
            Ok(())
        } else {
            Err(InvalidTransition {
                action,
                state: self.state.clone(),
            })
        }
    }

    fn release(&mut self) {
        self.endpoint = None;
        self.credential = None;
        self.key = None;
    }
}
