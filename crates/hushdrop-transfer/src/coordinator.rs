use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use hushdrop_crypto::Credential;
use hushdrop_types::{
    EndpointId, FailureReason, Role, SessionEvent, SessionHandle, SessionState,
    TransferMetadata,
};

use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::registry::EndpointRegistry;
use crate::session::{InvalidTransition, TransferSession};
use crate::stats::{ProgressSnapshot, SessionStats};
use crate::storage::Storage;
use crate::transport::pipe::pipe;
use crate::transport::{Payload, PayloadStream, Transport, TransportEvent};
use crate::worker::{self, WorkerObserver, WorkerOutcome, WorkerResult};

/// Capacity of the caller-facing event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Writes buffered between the encrypt worker and the transport.
const OUTGOING_PIPE_DEPTH: usize = 32;

/// Owns the sessions (at most one per role) and the endpoint registry, and is
/// the single consumer of transport events.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    transport: Arc<dyn Transport>,
    config: CoordinatorConfig,
    storage: Storage,

    /// Caller-facing events: every subscriber sees every event.
    events_tx: broadcast::Sender<SessionEvent>,

    /// Discovered senders. Written only by the dispatch loop.
    registry: RwLock<EndpointRegistry>,

    /// Never held across a worker join.
    slots: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    sender: Option<ActiveSession>,
    receiver: Option<ActiveSession>,
}

impl Slots {
    fn slot(&mut self, role: Role) -> &mut Option<ActiveSession> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    /// A slot is free when empty or when its session has ended.
    fn is_busy(&self, role: Role) -> bool {
        let slot = match role {
            Role::Sender => &self.sender,
            Role::Receiver => &self.receiver,
        };
        slot.as_ref()
            .is_some_and(|active| !active.session.state().is_terminal())
    }

    fn by_id(&mut self, id: Uuid) -> Option<&mut ActiveSession> {
        [self.sender.as_mut(), self.receiver.as_mut()]
            .into_iter()
            .flatten()
            .find(|active| active.session.handle().id == id)
    }

    /// Live session bound to `endpoint`. Ended sessions have released theirs.
    fn by_endpoint(&mut self, endpoint: &EndpointId) -> Option<&mut ActiveSession> {
        [self.sender.as_mut(), self.receiver.as_mut()]
            .into_iter()
            .flatten()
            .find(|active| active.session.endpoint() == Some(endpoint))
    }
}

struct ActiveSession {
    session: TransferSession,
    cancel: CancellationToken,
    stats: Arc<SessionStats>,
    worker: Option<JoinHandle<()>>,
    /// Sender: the file to stream and its metadata.
    outgoing: Option<(PathBuf, TransferMetadata)>,
    /// Sender: the password, held until a receiver connects.
    pending_credential: Option<Credential>,
    /// The link dropped while the data path was still deciding the outcome.
    peer_gone: bool,
}

impl ActiveSession {
    fn new(session: TransferSession) -> Self {
        Self {
            session,
            cancel: CancellationToken::new(),
            stats: Arc::new(SessionStats::new()),
            worker: None,
            outgoing: None,
            pending_credential: None,
            peer_gone: false,
        }
    }

    fn handle(&self) -> SessionHandle {
        self.session.handle()
    }
}

impl TransferCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: CoordinatorConfig,
    ) -> Result<Self, CoordinatorError> {
        let storage = Storage::new(&config.download_dir)?;
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                transport,
                config,
                storage,
                events_tx,
                registry: RwLock::new(EndpointRegistry::new()),
                slots: Mutex::new(Slots::default()),
            }),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Subscribe to session and discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Consume transport events until the transport's channel closes.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event).await;
        }
        info!("Transport event stream closed");
    }

    // ---- Discovery ----

    /// Start looking for senders. The registry starts out empty.
    pub async fn start_discovery(&self) -> Result<(), CoordinatorError> {
        self.inner.registry.write().await.clear();
        self.inner.transport.start_discovery()?;
        self.publish(SessionEvent::EndpointsChanged {
            endpoints: Vec::new(),
        });
        info!("Discovery started");
        Ok(())
    }

    pub async fn stop_discovery(&self) {
        self.inner.transport.stop_discovery();
        self.inner.registry.write().await.clear();
        self.publish(SessionEvent::EndpointsChanged {
            endpoints: Vec::new(),
        });
        info!("Discovery stopped");
    }

    /// Display names of discovered senders, in discovery order.
    pub async fn endpoints(&self) -> Vec<String> {
        self.inner.registry.read().await.list()
    }

    // ---- Sessions ----

    /// Advertise under `display_name` and send `file_path` to the first
    /// receiver that connects.
    pub async fn start_send(
        &self,
        file_path: impl AsRef<Path>,
        display_name: &str,
        password: &str,
    ) -> Result<SessionHandle, CoordinatorError> {
        let credential = Credential::new(password).map_err(|_| CoordinatorError::EmptyPassword)?;
        let path = file_path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or(CoordinatorError::EmptyFileSelection)?
            .to_string();
        let file_len = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(CoordinatorError::EmptyFileSelection),
        };
        let display_name = match display_name.trim() {
            "" => self.inner.config.device_name.as_str(),
            name => name,
        };

        let mut slots = self.inner.slots.lock().await;
        if slots.is_busy(Role::Sender) {
            return Err(CoordinatorError::SessionBusy(Role::Sender));
        }

        let mut session = TransferSession::new(Role::Sender);
        session.start_discovery()?;
        self.inner.transport.start_advertising(display_name)?;

        let mut active = ActiveSession::new(session);
        active.stats.set_total(file_len);
        active.outgoing = Some((path.to_path_buf(), TransferMetadata::new(file_name)));
        active.pending_credential = Some(credential);

        let handle = active.handle();
        info!(
            session = %handle.id,
            name = display_name,
            file = %path.display(),
            bytes = file_len,
            "Send session started"
        );
        self.publish_state(&active);
        *slots.slot(Role::Sender) = Some(active);
        Ok(handle)
    }

    /// Connect to the discovered sender named `sender_name` and receive its file.
    pub async fn start_receive(
        &self,
        sender_name: &str,
        password: &str,
    ) -> Result<SessionHandle, CoordinatorError> {
        let credential = Credential::new(password).map_err(|_| CoordinatorError::EmptyPassword)?;
        let endpoint = self
            .inner
            .registry
            .read()
            .await
            .lookup(sender_name)
            .map(|e| e.id.clone())
            .ok_or_else(|| CoordinatorError::UnknownEndpoint(sender_name.to_string()))?;

        let mut slots = self.inner.slots.lock().await;
        if slots.is_busy(Role::Receiver) {
            return Err(CoordinatorError::SessionBusy(Role::Receiver));
        }

        let mut session = TransferSession::new(Role::Receiver);
        session.start_discovery()?;
        session.select_endpoint(endpoint.clone())?;
        session.supply_credential(credential)?;
        self.inner
            .transport
            .request_connection(&self.inner.config.device_name, &endpoint)?;

        let active = ActiveSession::new(session);
        let handle = active.handle();
        info!(session = %handle.id, endpoint = %endpoint, sender = sender_name, "Receive session started");
        self.publish_state(&active);
        *slots.slot(Role::Receiver) = Some(active);
        drop(slots);

        self.arm_connect_timeout(handle);
        Ok(handle)
    }

    /// Stop a session from any state. Returns once its worker has exited, so
    /// any partial output is gone. No-op for unknown or finished sessions.
    pub async fn cancel(&self, handle: SessionHandle) {
        let worker = {
            let mut slots = self.inner.slots.lock().await;
            let Some(active) = slots.by_id(handle.id) else {
                debug!(session = %handle.id, "Cancel for unknown session");
                return;
            };
            if active.session.state().is_terminal() {
                return;
            }
            info!(session = %handle.id, role = ?handle.role, "Cancelling session");
            self.fail(active, FailureReason::Cancelled);
            active.worker.take()
        };

        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(session = %handle.id, "Worker task ended abnormally: {}", e);
            }
        }
    }

    pub async fn state(&self, handle: SessionHandle) -> Option<SessionState> {
        let mut slots = self.inner.slots.lock().await;
        slots.by_id(handle.id).map(|a| a.session.state().clone())
    }

    pub async fn progress(&self, handle: SessionHandle) -> Option<ProgressSnapshot> {
        let mut slots = self.inner.slots.lock().await;
        slots.by_id(handle.id).map(|a| a.stats.snapshot())
    }

    // ---- Transport events ----

    async fn dispatch(&self, event: TransportEvent) {
        match event {
            TransportEvent::EndpointFound { endpoint, name } => {
                let changed = self
                    .inner
                    .registry
                    .write()
                    .await
                    .on_endpoint_found(endpoint.clone(), name.clone());
                if changed {
                    debug!(endpoint = %endpoint, name = %name, "Endpoint found");
                    self.publish_endpoints().await;
                } else {
                    debug!(endpoint = %endpoint, name = %name, "Ignoring duplicate endpoint");
                }
            }
            TransportEvent::EndpointLost { endpoint } => {
                let removed = self.inner.registry.write().await.on_endpoint_lost(&endpoint);
                if let Some(lost) = removed {
                    debug!(endpoint = %endpoint, name = %lost.display_name, "Endpoint lost");
                    self.publish_endpoints().await;
                }
            }
            TransportEvent::ConnectionInitiated {
                endpoint,
                remote_name,
                incoming,
            } => {
                self.on_connection_initiated(endpoint, remote_name, incoming)
                    .await;
            }
            TransportEvent::ConnectionResult { endpoint, accepted } => {
                self.on_connection_result(endpoint, accepted).await;
            }
            TransportEvent::Disconnected { endpoint } => {
                self.on_disconnected(endpoint).await;
            }
            TransportEvent::PayloadReceived { endpoint, payload } => {
                self.on_payload(endpoint, payload).await;
            }
            TransportEvent::TransferProgress { endpoint, bytes } => {
                trace!(endpoint = %endpoint, bytes, "Outgoing stream progress");
            }
            TransportEvent::TransferComplete { endpoint } => {
                self.on_transfer_complete(endpoint).await;
            }
            TransportEvent::TransferFailed { endpoint, error } => {
                let mut slots = self.inner.slots.lock().await;
                if let Some(active) = slots.by_endpoint(&endpoint) {
                    warn!(session = %active.handle().id, endpoint = %endpoint, "Outgoing stream failed: {}", error);
                    let reason = if active.peer_gone {
                        FailureReason::Disconnected
                    } else {
                        FailureReason::Io { message: error }
                    };
                    self.fail(active, reason);
                }
            }
        }
    }

    async fn on_connection_initiated(&self, endpoint: EndpointId, remote_name: String, incoming: bool) {
        let mut slots = self.inner.slots.lock().await;

        if !incoming {
            // Our own request: accept our side of it.
            match slots.by_endpoint(&endpoint) {
                Some(active)
                    if active.session.role() == Role::Receiver
                        && *active.session.state() == SessionState::Connecting =>
                {
                    debug!(session = %active.handle().id, endpoint = %endpoint, "Accepting outgoing connection");
                    if let Err(e) = self.inner.transport.accept_connection(&endpoint) {
                        warn!(endpoint = %endpoint, "Accept failed: {}", e);
                        self.fail(active, FailureReason::ConnectionRejected);
                    }
                }
                _ => {
                    warn!(endpoint = %endpoint, "No session waiting on this connection, rejecting");
                    let _ = self.inner.transport.reject_connection(&endpoint);
                }
            }
            return;
        }

        let waiting = slots
            .sender
            .as_mut()
            .filter(|active| *active.session.state() == SessionState::Discovering);
        let Some(active) = waiting else {
            warn!(endpoint = %endpoint, remote = %remote_name, "Unexpected incoming connection, rejecting");
            let _ = self.inner.transport.reject_connection(&endpoint);
            return;
        };
        let Some(credential) = active.pending_credential.take() else {
            let _ = self.inner.transport.reject_connection(&endpoint);
            return;
        };

        info!(session = %active.handle().id, endpoint = %endpoint, remote = %remote_name, "Receiver connecting");
        if !self.advance(active, |s| s.select_endpoint(endpoint.clone()))
            || !self.advance(active, |s| s.supply_credential(credential))
        {
            return;
        }
        if let Err(e) = self.inner.transport.accept_connection(&endpoint) {
            warn!(endpoint = %endpoint, "Accept failed: {}", e);
            self.fail(active, FailureReason::ConnectionRejected);
            return;
        }
        let handle = active.handle();
        drop(slots);
        self.arm_connect_timeout(handle);
    }

    async fn on_connection_result(&self, endpoint: EndpointId, accepted: bool) {
        let mut slots = self.inner.slots.lock().await;
        let Some(active) = slots.by_endpoint(&endpoint) else {
            debug!(endpoint = %endpoint, accepted, "Connection result for no session");
            return;
        };
        if *active.session.state() != SessionState::Connecting {
            debug!(session = %active.handle().id, "Ignoring late connection result");
            return;
        }

        if !accepted {
            if active.session.connection_failed().is_ok() {
                self.after_failure(active, Some(endpoint));
            }
            return;
        }

        if !self.advance(active, TransferSession::connection_established) {
            return;
        }
        info!(session = %active.handle().id, endpoint = %endpoint, "Connected");

        if active.session.role() == Role::Sender {
            self.inner.transport.stop_advertising();
            self.start_outgoing(active, &endpoint);
        }
    }

    /// Sender side after connecting: metadata first, then the encrypted stream.
    fn start_outgoing(&self, active: &mut ActiveSession, endpoint: &EndpointId) {
        let Some((path, metadata)) = active.outgoing.clone() else {
            self.fail(active, FailureReason::Io {
                message: "no file to send".to_string(),
            });
            return;
        };
        let Some(key) = active.session.key().cloned() else {
            self.fail(active, FailureReason::ConnectionRejected);
            return;
        };

        let wire = Bytes::from(metadata.to_wire());
        if let Err(e) = self.inner.transport.send_bytes(endpoint, wire) {
            self.fail(active, FailureReason::Io { message: e.to_string() });
            return;
        }
        debug!(session = %active.handle().id, file = %metadata.file_name, "Metadata sent");
        if !self.advance(active, |s| s.begin_metadata(metadata)) {
            return;
        }

        let (writer, reader) = pipe(OUTGOING_PIPE_DEPTH);
        if let Err(e) = self.inner.transport.send_stream(endpoint, Box::new(reader)) {
            self.fail(active, FailureReason::Io { message: e.to_string() });
            return;
        }
        if !self.advance(active, TransferSession::begin_transfer) {
            return;
        }

        let worker = self.spawn_worker(active, move |observer| {
            worker::encrypt_file(&path, writer, &key, observer)
        });
        active.worker = Some(worker);
    }

    async fn on_payload(&self, endpoint: EndpointId, payload: Payload) {
        let mut slots = self.inner.slots.lock().await;
        let Some(active) = slots.by_endpoint(&endpoint) else {
            warn!(endpoint = %endpoint, ?payload, "Payload from unknown endpoint, dropping");
            return;
        };
        if active.session.role() != Role::Receiver {
            warn!(session = %active.handle().id, ?payload, "Sender ignores inbound payloads");
            return;
        }

        match payload {
            Payload::Bytes(data) => {
                if *active.session.state() != SessionState::Connected {
                    warn!(session = %active.handle().id, state = %active.session.state(), "Unexpected control message");
                    return;
                }
                let metadata = TransferMetadata::from_wire(&data);
                info!(session = %active.handle().id, file = %metadata.file_name, "Metadata received");
                self.advance(active, |s| s.begin_metadata(metadata));
            }
            Payload::Stream(stream) => self.start_incoming(active, stream),
        }
    }

    /// Receiver side: decrypt the frame into a staged file.
    fn start_incoming(&self, active: &mut ActiveSession, stream: PayloadStream) {
        if let Err(e) = active.session.begin_transfer() {
            warn!(session = %active.handle().id, "Stream out of order: {}", e);
            self.fail(active, FailureReason::MalformedStream);
            return;
        }
        self.publish_state(active);

        let (Some(key), Some(metadata)) = (
            active.session.key().cloned(),
            active.session.metadata().cloned(),
        ) else {
            self.fail(active, FailureReason::MalformedStream);
            return;
        };
        let storage = self.inner.storage.clone();

        let worker = self.spawn_worker(active, move |observer| {
            worker::decrypt_to_storage(&storage, &metadata.file_name, stream, &key, observer)
        });
        active.worker = Some(worker);
    }

    async fn on_disconnected(&self, endpoint: EndpointId) {
        let mut slots = self.inner.slots.lock().await;
        let Some(active) = slots.by_endpoint(&endpoint) else {
            debug!(endpoint = %endpoint, "Disconnect for no session");
            return;
        };
        if *active.session.state() == SessionState::Transferring {
            // Receiver: a cut stream aborts the worker's input and a complete
            // one is judged by its tag. Sender: the transport still reports
            // whether the stream got out, and a receiver that committed
            // hangs up right after reading the end.
            debug!(session = %active.handle().id, role = ?active.session.role(), "Peer disconnected mid-transfer, letting the stream decide");
            active.peer_gone = true;
            return;
        }
        info!(session = %active.handle().id, endpoint = %endpoint, "Peer disconnected");
        self.fail(active, FailureReason::Disconnected);
    }

    async fn on_transfer_complete(&self, endpoint: EndpointId) {
        let mut slots = self.inner.slots.lock().await;
        let Some(active) = slots.by_endpoint(&endpoint) else {
            return;
        };
        if active.session.role() != Role::Sender
            || *active.session.state() != SessionState::Transferring
        {
            return;
        }

        let snapshot = active.stats.snapshot();
        let sent = snapshot.total_bytes.unwrap_or(snapshot.bytes_transferred);
        if let Err(e) = active.session.record_progress(sent) {
            warn!(session = %active.handle().id, "{}", e);
        }
        self.publish(SessionEvent::Progress {
            session: active.handle(),
            bytes_transferred: sent,
            total_bytes: snapshot.total_bytes,
        });
        if self.advance(active, TransferSession::complete) {
            info!(session = %active.handle().id, bytes = sent, "Send complete");
        }
    }

    // ---- Workers ----

    fn spawn_worker<F>(&self, active: &ActiveSession, job: F) -> JoinHandle<()>
    where
        F: FnOnce(&WorkerObserver) -> WorkerResult + Send + 'static,
    {
        let handle = active.handle();
        let observer = WorkerObserver::new(
            handle,
            active.cancel.clone(),
            active.stats.clone(),
            self.inner.events_tx.clone(),
            self.inner.config.progress_interval,
        );
        let this = self.clone();
        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || job(&observer)).await {
                Ok(result) => result,
                Err(e) => Err(FailureReason::Io {
                    message: format!("worker panicked: {}", e),
                }),
            };
            this.on_worker_finished(handle, result).await;
        })
    }

    async fn on_worker_finished(&self, handle: SessionHandle, result: WorkerResult) {
        let mut slots = self.inner.slots.lock().await;
        let Some(active) = slots.by_id(handle.id) else {
            return;
        };
        active.worker = None;
        if active.session.state().is_terminal() {
            // Already failed or cancelled; a staged file in `result` is dropped here.
            debug!(session = %handle.id, "Worker finished after session ended");
            return;
        }

        match result {
            Err(reason) => self.fail(active, reason),
            Ok(WorkerOutcome::Sent(bytes)) => {
                debug!(session = %handle.id, bytes, "Waiting for transport to flush");
            }
            Ok(WorkerOutcome::Received(staged)) => {
                let endpoint = active.session.endpoint().cloned();
                let file = match staged.commit() {
                    Ok(file) => file,
                    Err(e) => {
                        self.fail(active, FailureReason::Io { message: e.to_string() });
                        return;
                    }
                };
                if let Err(e) = active.session.record_progress(file.size) {
                    warn!(session = %handle.id, "{}", e);
                }
                self.publish(SessionEvent::Progress {
                    session: handle,
                    bytes_transferred: file.size,
                    total_bytes: None,
                });
                info!(session = %handle.id, path = %file.path.display(), mime = %file.mime_type, "File received");
                self.publish(SessionEvent::FileReceived {
                    session: handle,
                    file,
                });
                self.advance(active, TransferSession::complete);
                if let Some(endpoint) = endpoint {
                    self.inner.transport.disconnect(&endpoint);
                }
            }
        }
    }

    // ---- Timeouts ----

    fn arm_connect_timeout(&self, handle: SessionHandle) {
        let Some(timeout) = self.inner.config.connect_timeout else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut slots = this.inner.slots.lock().await;
            if let Some(active) = slots.by_id(handle.id) {
                if *active.session.state() == SessionState::Connecting {
                    warn!(session = %handle.id, ?timeout, "Connection timed out");
                    this.fail(active, FailureReason::TimedOut);
                }
            }
        });
    }

    // ---- State changes ----

    /// Apply a transition and publish the new state. On a refused transition
    /// logs and returns false without touching the session.
    fn advance<F>(&self, active: &mut ActiveSession, step: F) -> bool
    where
        F: FnOnce(&mut TransferSession) -> Result<(), InvalidTransition>,
    {
        match step(&mut active.session) {
            Ok(()) => {
                debug!(session = %active.handle().id, state = %active.session.state(), "State changed");
                self.publish_state(active);
                true
            }
            Err(e) => {
                warn!(session = %active.handle().id, "{}", e);
                false
            }
        }
    }

    /// Fail a live session: stop its worker, close its link, publish.
    fn fail(&self, active: &mut ActiveSession, reason: FailureReason) {
        let endpoint = active.session.endpoint().cloned();
        if active.session.fail(reason) {
            self.after_failure(active, endpoint);
        }
    }

    fn after_failure(&self, active: &mut ActiveSession, endpoint: Option<EndpointId>) {
        active.cancel.cancel();
        active.pending_credential = None;
        if active.session.role() == Role::Sender {
            self.inner.transport.stop_advertising();
        }
        if let Some(endpoint) = endpoint {
            self.inner.transport.disconnect(&endpoint);
        }

        let SessionState::Failed(reason) = active.session.state().clone() else {
            return;
        };
        warn!(session = %active.handle().id, role = ?active.session.role(), %reason, "Session failed");
        self.publish_state(active);
        self.publish(SessionEvent::Error {
            session: active.handle(),
            reason,
        });
    }

    fn publish_state(&self, active: &ActiveSession) {
        self.publish(SessionEvent::StateChanged {
            session: active.handle(),
            state: active.session.state().clone(),
        });
    }

    async fn publish_endpoints(&self) {
        let endpoints = self.inner.registry.read().await.list();
        self.publish(SessionEvent::EndpointsChanged { endpoints });
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events_tx.send(event);
    }
}
