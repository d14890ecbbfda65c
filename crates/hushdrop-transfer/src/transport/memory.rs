//! In-process transport.
//!
//! Peers join a shared [`MemoryNetwork`] under a fixed id and see each other
//! through advertising/discovery exactly as they would over the air: both
//! sides are told about a pending connection and both must accept it,
//! `disconnect` only notifies the remote side, and streams are piped with
//! backpressure. [`MemoryNetwork::sever`] drops a link as if the radio went
//! away.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use hushdrop_types::EndpointId;

use super::pipe::{PipeAbort, PipeWriter, pipe};
use super::{Payload, PayloadStream, Transport, TransportError, TransportEvent};

/// Unread writes buffered per stream.
const STREAM_PIPE_DEPTH: usize = 16;

const PUMP_CHUNK_SIZE: usize = 16 * 1024;

/// The shared medium. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    peers: HashMap<EndpointId, Peer>,
    links: HashMap<LinkKey, Link>,
}

struct Peer {
    events: mpsc::UnboundedSender<TransportEvent>,
    advertising: Option<String>,
    discovering: bool,
}

/// Unordered endpoint pair.
#[derive(Clone, PartialEq, Eq, Hash)]
struct LinkKey(EndpointId, EndpointId);

impl LinkKey {
    fn new(a: &EndpointId, b: &EndpointId) -> Self {
        if a.as_str() <= b.as_str() {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }
}

struct Link {
    accepted: Vec<EndpointId>,
    connected: bool,
    open: Arc<AtomicBool>,
    streams: Vec<PipeAbort>,
}

impl Link {
    fn close(&self) {
        self.open.store(false, Ordering::Release);
        for stream in &self.streams {
            stream.abort();
        }
    }
}

impl NetworkState {
    fn notify(&self, id: &EndpointId, event: TransportEvent) {
        if let Some(peer) = self.peers.get(id) {
            let _ = peer.events.send(event);
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Events for it arrive on `events`.
    pub fn join(
        &self,
        id: impl Into<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> MemoryTransport {
        let id = EndpointId::new(id);
        self.lock().peers.insert(
            id.clone(),
            Peer {
                events,
                advertising: None,
                discovering: false,
            },
        );
        MemoryTransport {
            id,
            network: self.clone(),
        }
    }

    /// Drop the link between `a` and `b`; both sides see `Disconnected`.
    pub fn sever(&self, a: &EndpointId, b: &EndpointId) {
        let mut state = self.lock();
        if let Some(link) = state.links.remove(&LinkKey::new(a, b)) {
            debug!(a = %a, b = %b, "Link severed");
            // Queue the disconnects ahead of any stream failure the close causes.
            state.notify(a, TransportEvent::Disconnected { endpoint: b.clone() });
            state.notify(b, TransportEvent::Disconnected { endpoint: a.clone() });
            link.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One peer's view of a [`MemoryNetwork`].
///
/// `send_stream` spawns a blocking pump and must be called from within a
/// tokio runtime.
pub struct MemoryTransport {
    id: EndpointId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// The id other peers know this one by.
    pub fn id(&self) -> &EndpointId {
        &self.id
    }
}

impl Transport for MemoryTransport {
    fn start_advertising(&self, local_name: &str) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let me = state
            .peers
            .get_mut(&self.id)
            .ok_or_else(|| TransportError::UnknownEndpoint(self.id.clone()))?;
        me.advertising = Some(local_name.to_string());

        for (id, peer) in &state.peers {
            if *id != self.id && peer.discovering {
                let _ = peer.events.send(TransportEvent::EndpointFound {
                    endpoint: self.id.clone(),
                    name: local_name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn stop_advertising(&self) {
        let mut state = self.network.lock();
        let was_advertising = state
            .peers
            .get_mut(&self.id)
            .and_then(|me| me.advertising.take())
            .is_some();
        if !was_advertising {
            return;
        }
        for (id, peer) in &state.peers {
            if *id != self.id && peer.discovering {
                let _ = peer.events.send(TransportEvent::EndpointLost {
                    endpoint: self.id.clone(),
                });
            }
        }
    }

    fn start_discovery(&self) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let me = state
            .peers
            .get_mut(&self.id)
            .ok_or_else(|| TransportError::UnknownEndpoint(self.id.clone()))?;
        me.discovering = true;

        let visible: Vec<(EndpointId, String)> = state
            .peers
            .iter()
            .filter(|(id, _)| **id != self.id)
            .filter_map(|(id, peer)| peer.advertising.clone().map(|name| (id.clone(), name)))
            .collect();
        for (endpoint, name) in visible {
            state.notify(&self.id, TransportEvent::EndpointFound { endpoint, name });
        }
        Ok(())
    }

    fn stop_discovery(&self) {
        if let Some(me) = self.network.lock().peers.get_mut(&self.id) {
            me.discovering = false;
        }
    }

    fn request_connection(
        &self,
        local_name: &str,
        endpoint: &EndpointId,
    ) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let remote_name = state
            .peers
            .get(endpoint)
            .and_then(|peer| peer.advertising.clone())
            .ok_or_else(|| TransportError::UnknownEndpoint(endpoint.clone()))?;

        let key = LinkKey::new(&self.id, endpoint);
        if state.links.contains_key(&key) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "connection already pending",
            )));
        }
        state.links.insert(
            key,
            Link {
                accepted: Vec::new(),
                connected: false,
                open: Arc::new(AtomicBool::new(true)),
                streams: Vec::new(),
            },
        );

        debug!(from = %self.id, to = %endpoint, "Connection requested");
        state.notify(
            &self.id,
            TransportEvent::ConnectionInitiated {
                endpoint: endpoint.clone(),
                remote_name,
                incoming: false,
            },
        );
        state.notify(
            endpoint,
            TransportEvent::ConnectionInitiated {
                endpoint: self.id.clone(),
                remote_name: local_name.to_string(),
                incoming: true,
            },
        );
        Ok(())
    }

    fn accept_connection(&self, endpoint: &EndpointId) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let link = state
            .links
            .get_mut(&LinkKey::new(&self.id, endpoint))
            .ok_or_else(|| TransportError::NotConnected(endpoint.clone()))?;
        if !link.accepted.contains(&self.id) {
            link.accepted.push(self.id.clone());
        }
        if link.accepted.len() < 2 || link.connected {
            return Ok(());
        }
        link.connected = true;

        debug!(a = %self.id, b = %endpoint, "Link established");
        state.notify(
            &self.id,
            TransportEvent::ConnectionResult {
                endpoint: endpoint.clone(),
                accepted: true,
            },
        );
        state.notify(
            endpoint,
            TransportEvent::ConnectionResult {
                endpoint: self.id.clone(),
                accepted: true,
            },
        );
        Ok(())
    }

    fn reject_connection(&self, endpoint: &EndpointId) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let link = state
            .links
            .remove(&LinkKey::new(&self.id, endpoint))
            .ok_or_else(|| TransportError::NotConnected(endpoint.clone()))?;
        link.close();

        state.notify(
            &self.id,
            TransportEvent::ConnectionResult {
                endpoint: endpoint.clone(),
                accepted: false,
            },
        );
        state.notify(
            endpoint,
            TransportEvent::ConnectionResult {
                endpoint: self.id.clone(),
                accepted: false,
            },
        );
        Ok(())
    }

    fn send_bytes(&self, endpoint: &EndpointId, data: Bytes) -> Result<(), TransportError> {
        let state = self.network.lock();
        match state.links.get(&LinkKey::new(&self.id, endpoint)) {
            Some(link) if link.connected => {
                state.notify(
                    endpoint,
                    TransportEvent::PayloadReceived {
                        endpoint: self.id.clone(),
                        payload: Payload::Bytes(data),
                    },
                );
                Ok(())
            }
            _ => Err(TransportError::NotConnected(endpoint.clone())),
        }
    }

    fn send_stream(
        &self,
        endpoint: &EndpointId,
        stream: PayloadStream,
    ) -> Result<(), TransportError> {
        let mut state = self.network.lock();
        let events = state
            .peers
            .get(&self.id)
            .map(|me| me.events.clone())
            .ok_or_else(|| TransportError::UnknownEndpoint(self.id.clone()))?;
        let link = match state.links.get_mut(&LinkKey::new(&self.id, endpoint)) {
            Some(link) if link.connected => link,
            _ => return Err(TransportError::NotConnected(endpoint.clone())),
        };

        let (writer, reader) = pipe(STREAM_PIPE_DEPTH);
        link.streams.push(writer.abort_handle());
        let open = link.open.clone();

        state.notify(
            endpoint,
            TransportEvent::PayloadReceived {
                endpoint: self.id.clone(),
                payload: Payload::Stream(Box::new(reader)),
            },
        );

        let endpoint = endpoint.clone();
        tokio::task::spawn_blocking(move || pump(stream, writer, open, events, endpoint));
        Ok(())
    }

    fn disconnect(&self, endpoint: &EndpointId) {
        let mut state = self.network.lock();
        if let Some(link) = state.links.remove(&LinkKey::new(&self.id, endpoint)) {
            debug!(from = %self.id, to = %endpoint, "Disconnecting");
            state.notify(
                endpoint,
                TransportEvent::Disconnected {
                    endpoint: self.id.clone(),
                },
            );
            link.close();
        }
    }
}

/// Copy an outgoing stream into the remote side's pipe, reporting to the
/// local side. Dropping `sink` unfinished aborts the remote read.
fn pump(
    mut source: PayloadStream,
    mut sink: PipeWriter,
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
    endpoint: EndpointId,
) {
    let fail = |error: String| {
        let _ = events.send(TransportEvent::TransferFailed {
            endpoint: endpoint.clone(),
            error,
        });
    };

    let mut buf = vec![0u8; PUMP_CHUNK_SIZE];
    let mut sent: u64 = 0;
    loop {
        let n = match source.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return fail(e.to_string()),
        };
        if !open.load(Ordering::Acquire) {
            return fail("link closed".to_string());
        }
        if n == 0 {
            trace!(endpoint = %endpoint, bytes = sent, "Outgoing stream complete");
            sink.finish();
            let _ = events.send(TransportEvent::TransferComplete {
                endpoint: endpoint.clone(),
            });
            return;
        }
        if let Err(e) = sink.write_all(&buf[..n]) {
            return fail(e.to_string());
        }
        sent += n as u64;
        let _ = events.send(TransportEvent::TransferProgress {
            endpoint: endpoint.clone(),
            bytes: sent,
        });
    }
}
