//! LAN transport: UDP broadcast beacons for discovery, TCP for links.
//!
//! Beacon (UDP broadcast to `discovery_port`):
//!   [magic "HDRP"][version u8][tcp_port u16 BE][instance 16 bytes][name UTF-8]
//!
//! Link frames (TCP, both directions):
//!   [kind u8][len u32 BE][payload]
//!
//! The dialing side sends HELLO with its name first. Each side then sends
//! ACCEPT or REJECT; the link is up once both accepted. A stream is a run of
//! STREAM_CHUNK frames closed by STREAM_END (or STREAM_ABORT). The sending
//! side reports the stream complete only after STREAM_END has been flushed
//! to the socket.
//!
//! A discovered endpoint's id is the `ip:tcp_port` it can be dialed at; an
//! incoming link's id is the remote socket address.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use hushdrop_types::EndpointId;

use super::pipe::{PipeAbort, PipeWriter, pipe};
use super::{Payload, PayloadStream, Transport, TransportError, TransportEvent};

const BEACON_MAGIC: &[u8; 4] = b"HDRP";
const BEACON_VERSION: u8 = 1;
const BEACON_HEADER_LEN: usize = 4 + 1 + 2 + 16;
const MAX_NAME_LEN: usize = 200;

// Frame types
const FRAME_HELLO: u8 = 0x01;
const FRAME_ACCEPT: u8 = 0x02;
const FRAME_REJECT: u8 = 0x03;
const FRAME_BYTES: u8 = 0x10;
const FRAME_STREAM_CHUNK: u8 = 0x11;
const FRAME_STREAM_END: u8 = 0x12;
const FRAME_STREAM_ABORT: u8 = 0x13;

/// Maximum frame payload (1 MB; stream chunks are 64 KB).
const MAX_FRAME_LEN: usize = 1024 * 1024;

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Capacity of the per-link outbound frame channel.
const LINK_CHANNEL_CAPACITY: usize = 64;

/// Unread chunks buffered per incoming stream.
const INBOUND_PIPE_DEPTH: usize = 32;

/// 1 MB socket buffers.
const SOCKET_BUF_SIZE: usize = 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct LanConfig {
    /// UDP port beacons are broadcast to and listened for on.
    pub discovery_port: u16,
    /// Where beacons are sent. Loopback keeps discovery on one host.
    pub beacon_target: Ipv4Addr,
    pub beacon_interval: Duration,
    /// An endpoint with no beacon for this long is reported lost.
    pub lost_after: Duration,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            discovery_port: 48613,
            beacon_target: Ipv4Addr::BROADCAST,
            beacon_interval: Duration::from_secs(1),
            lost_after: Duration::from_secs(5),
        }
    }
}

/// Transport over the local network. Dropping it stops every task it started.
pub struct LanTransport {
    inner: Arc<LanInner>,
    accept_task: JoinHandle<()>,
}

struct LanInner {
    config: LanConfig,
    instance: Uuid,
    tcp_port: u16,
    runtime: Handle,
    events: mpsc::UnboundedSender<TransportEvent>,
    links: Mutex<HashMap<EndpointId, LanLink>>,
    /// Names learned from beacons, keyed by dialable endpoint id.
    known: Mutex<HashMap<EndpointId, String>>,
    advertiser: Mutex<Option<JoinHandle<()>>>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

struct LanLink {
    frames: mpsc::Sender<Outgoing>,
    local_accepted: bool,
    remote_accepted: bool,
    connected: bool,
    open: Arc<AtomicBool>,
    /// The incoming stream being fed by the reader task, if any.
    inbound: Option<PipeAbort>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl LanLink {
    fn close(self) {
        self.open.store(false, Ordering::Release);
        // Wakes a reader task blocked on a full pipe.
        if let Some(inbound) = self.inbound {
            inbound.abort();
        }
        if let Some(task) = self.reader_task {
            task.abort();
        }
        if let Some(task) = self.writer_task {
            task.abort();
        }
    }
}

impl LanTransport {
    /// Bind the TCP listener on an ephemeral port and start accepting links.
    pub async fn bind(
        config: LanConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(map_io)?;
        let tcp_port = listener.local_addr().map_err(map_io)?.port();
        info!("LAN transport listening on TCP port {}", tcp_port);

        let inner = Arc::new(LanInner {
            config,
            instance: Uuid::new_v4(),
            tcp_port,
            runtime: Handle::current(),
            events,
            links: Mutex::new(HashMap::new()),
            known: Mutex::new(HashMap::new()),
            advertiser: Mutex::new(None),
            discovery: Mutex::new(None),
        });
        let accept_task = tokio::spawn(inner.clone().accept_loop(listener));

        Ok(Self { inner, accept_task })
    }

    pub fn tcp_port(&self) -> u16 {
        self.inner.tcp_port
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
        stop_task(&self.inner.advertiser);
        stop_task(&self.inner.discovery);
        let links: Vec<LanLink> = lock(&self.inner.links).drain().map(|(_, l)| l).collect();
        for link in links {
            link.close();
        }
    }
}

impl LanInner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("LAN: incoming connection from {}", addr);
                    let inner = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.handle_incoming(stream, addr).await {
                            warn!("LAN: handshake with {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("LAN: accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn handle_incoming(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        configure_socket(&stream)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no hello"))??;
        let Frame::Hello(remote_name) = hello else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "expected hello"));
        };

        let endpoint = EndpointId::new(addr.to_string());
        self.register_link(endpoint.clone(), reader, write_half);
        info!("LAN: {} ({}) wants to connect", remote_name, endpoint);
        self.emit(TransportEvent::ConnectionInitiated {
            endpoint,
            remote_name,
            incoming: true,
        });
        Ok(())
    }

    async fn dial(self: Arc<Self>, addr: SocketAddr, endpoint: EndpointId, local_name: String) -> io::Result<()> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        configure_socket(&stream)?;
        let (read_half, write_half) = stream.into_split();

        let frames = self.register_link(endpoint.clone(), BufReader::new(read_half), write_half);
        frames
            .send(Frame::Hello(local_name).into())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link closed"))?;

        let remote_name = lock(&self.known)
            .get(&endpoint)
            .cloned()
            .unwrap_or_else(|| endpoint.to_string());
        self.emit(TransportEvent::ConnectionInitiated {
            endpoint,
            remote_name,
            incoming: false,
        });
        Ok(())
    }

    /// Insert the link before its tasks can look it up.
    fn register_link(
        self: &Arc<Self>,
        endpoint: EndpointId,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> mpsc::Sender<Outgoing> {
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let mut links = lock(&self.links);
        let reader_task = tokio::spawn(self.clone().read_loop(endpoint.clone(), reader));
        let writer_task = tokio::spawn(write_loop(writer, rx));
        let previous = links.insert(
            endpoint,
            LanLink {
                frames: tx.clone(),
                local_accepted: false,
                remote_accepted: false,
                connected: false,
                open: Arc::new(AtomicBool::new(true)),
                inbound: None,
                reader_task: Some(reader_task),
                writer_task: Some(writer_task),
            },
        );
        drop(links);
        if let Some(previous) = previous {
            previous.close();
        }
        tx
    }

    /// Inbound frames for one link. Ends when the socket closes or the
    /// task is aborted by a local disconnect.
    async fn read_loop(self: Arc<Self>, endpoint: EndpointId, mut reader: BufReader<OwnedReadHalf>) {
        let mut inbound: Option<PipeWriter> = None;
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        debug!("LAN: read from {} failed: {}", endpoint, e);
                    }
                    break;
                }
            };

            match frame {
                Frame::Hello(_) => warn!("LAN: duplicate hello from {}", endpoint),
                Frame::Accept => self.on_remote_accept(&endpoint),
                Frame::Reject => {
                    if let Some(link) = lock(&self.links).remove(&endpoint) {
                        link.open.store(false, Ordering::Release);
                    }
                    self.emit(TransportEvent::ConnectionResult {
                        endpoint,
                        accepted: false,
                    });
                    return;
                }
                Frame::Bytes(data) => self.emit(TransportEvent::PayloadReceived {
                    endpoint: endpoint.clone(),
                    payload: Payload::Bytes(data),
                }),
                Frame::StreamChunk(data) => {
                    let writer = match inbound.take() {
                        Some(writer) => writer,
                        None => self.open_inbound(&endpoint),
                    };
                    // Blocks while the receiver is behind.
                    let handed_off = tokio::task::spawn_blocking(move || {
                        let sent = writer.send(data);
                        (writer, sent)
                    })
                    .await;
                    let (writer, sent) = match handed_off {
                        Ok(handed_off) => handed_off,
                        Err(e) => {
                            warn!("LAN: stream hand-off for {} failed: {}", endpoint, e);
                            break;
                        }
                    };
                    // A receiver that gave up on the stream drops the rest.
                    if sent.is_err() {
                        trace!("LAN: discarding stream data from {}", endpoint);
                    }
                    inbound = Some(writer);
                }
                Frame::StreamEnd => {
                    let writer = match inbound.take() {
                        Some(writer) => writer,
                        None => self.open_inbound(&endpoint),
                    };
                    writer.finish();
                    self.clear_inbound(&endpoint);
                }
                Frame::StreamAbort => {
                    debug!("LAN: {} aborted its stream", endpoint);
                    inbound = None;
                    self.clear_inbound(&endpoint);
                }
            }
        }

        drop(inbound);
        let link = lock(&self.links).remove(&endpoint);
        if let Some(link) = link {
            info!("LAN: {} disconnected", endpoint);
            // Ahead of the stream failure that stopping the writer causes.
            self.emit(TransportEvent::Disconnected { endpoint });
            link.open.store(false, Ordering::Release);
            if let Some(task) = link.writer_task {
                task.abort();
            }
        }
    }

    fn open_inbound(&self, endpoint: &EndpointId) -> PipeWriter {
        let (writer, reader) = pipe(INBOUND_PIPE_DEPTH);
        if let Some(link) = lock(&self.links).get_mut(endpoint) {
            link.inbound = Some(writer.abort_handle());
        }
        self.emit(TransportEvent::PayloadReceived {
            endpoint: endpoint.clone(),
            payload: Payload::Stream(Box::new(reader)),
        });
        writer
    }

    /// A finished stream must not be cut by a later close.
    fn clear_inbound(&self, endpoint: &EndpointId) {
        if let Some(link) = lock(&self.links).get_mut(endpoint) {
            link.inbound = None;
        }
    }

    fn on_remote_accept(&self, endpoint: &EndpointId) {
        let mut links = lock(&self.links);
        let Some(link) = links.get_mut(endpoint) else {
            return;
        };
        link.remote_accepted = true;
        if link.local_accepted && !link.connected {
            link.connected = true;
            drop(links);
            self.emit(TransportEvent::ConnectionResult {
                endpoint: endpoint.clone(),
                accepted: true,
            });
        }
    }

    async fn advertise_loop(self: Arc<Self>, socket: UdpSocket, name: String) {
        let beacon = Beacon {
            tcp_port: self.tcp_port,
            instance: self.instance,
            name,
        }
        .encode();
        let target = SocketAddrV4::new(self.config.beacon_target, self.config.discovery_port);
        let mut ticker = tokio::time::interval(self.config.beacon_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = socket.send_to(&beacon, target).await {
                warn!("LAN: beacon send failed: {}", e);
            }
        }
    }

    async fn discovery_loop(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = [0u8; 512];
        let mut seen: HashMap<EndpointId, Instant> = HashMap::new();
        let mut sweep = tokio::time::interval(self.config.beacon_interval);
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("LAN: discovery receive failed: {}", e);
                            continue;
                        }
                    };
                    let Some(beacon) = Beacon::decode(&buf[..n]) else {
                        trace!("LAN: ignoring datagram from {}", from);
                        continue;
                    };
                    if beacon.instance == self.instance {
                        continue;
                    }
                    let endpoint = EndpointId::new(SocketAddr::new(from.ip(), beacon.tcp_port).to_string());
                    if seen.insert(endpoint.clone(), Instant::now()).is_none() {
                        debug!("LAN: found {} at {}", beacon.name, endpoint);
                        lock(&self.known).insert(endpoint.clone(), beacon.name.clone());
                        self.emit(TransportEvent::EndpointFound { endpoint, name: beacon.name });
                    }
                }
                _ = sweep.tick() => {
                    let lost_after = self.config.lost_after;
                    seen.retain(|endpoint, last| {
                        if last.elapsed() < lost_after {
                            return true;
                        }
                        debug!("LAN: lost {}", endpoint);
                        self.emit(TransportEvent::EndpointLost { endpoint: endpoint.clone() });
                        false
                    });
                }
            }
        }
    }

    fn with_link<T>(
        &self,
        endpoint: &EndpointId,
        f: impl FnOnce(&mut LanLink) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut links = lock(&self.links);
        let link = links
            .get_mut(endpoint)
            .ok_or_else(|| TransportError::NotConnected(endpoint.clone()))?;
        f(link)
    }
}

impl Transport for LanTransport {
    fn start_advertising(&self, local_name: &str) -> Result<(), TransportError> {
        let _guard = self.inner.runtime.enter();
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(map_io)?;
        socket.set_broadcast(true).map_err(map_io)?;
        socket.set_nonblocking(true).map_err(map_io)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
            .map_err(map_io)?;
        let socket = UdpSocket::from_std(socket.into()).map_err(map_io)?;

        let task = self
            .inner
            .runtime
            .spawn(self.inner.clone().advertise_loop(socket, local_name.to_string()));
        replace_task(&self.inner.advertiser, task);
        info!("LAN: advertising as {}", local_name);
        Ok(())
    }

    fn stop_advertising(&self) {
        if stop_task(&self.inner.advertiser) {
            info!("LAN: stopped advertising");
        }
    }

    fn start_discovery(&self) -> Result<(), TransportError> {
        let _guard = self.inner.runtime.enter();
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(map_io)?;
        socket.set_reuse_address(true).map_err(map_io)?;
        socket.set_nonblocking(true).map_err(map_io)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.inner.config.discovery_port).into())
            .map_err(map_io)?;
        let socket = UdpSocket::from_std(socket.into()).map_err(map_io)?;

        let task = self
            .inner
            .runtime
            .spawn(self.inner.clone().discovery_loop(socket));
        replace_task(&self.inner.discovery, task);
        info!(
            "LAN: discovering on UDP port {}",
            self.inner.config.discovery_port
        );
        Ok(())
    }

    fn stop_discovery(&self) {
        if stop_task(&self.inner.discovery) {
            info!("LAN: stopped discovery");
        }
    }

    fn request_connection(
        &self,
        local_name: &str,
        endpoint: &EndpointId,
    ) -> Result<(), TransportError> {
        let addr: SocketAddr = endpoint
            .as_str()
            .parse()
            .map_err(|_| TransportError::UnknownEndpoint(endpoint.clone()))?;
        let inner = self.inner.clone();
        let endpoint = endpoint.clone();
        let local_name = local_name.to_string();
        self.inner.runtime.spawn(async move {
            if let Err(e) = inner.clone().dial(addr, endpoint.clone(), local_name).await {
                warn!("LAN: connecting to {} failed: {}", endpoint, e);
                if let Some(link) = lock(&inner.links).remove(&endpoint) {
                    link.close();
                }
                inner.emit(TransportEvent::ConnectionResult {
                    endpoint,
                    accepted: false,
                });
            }
        });
        Ok(())
    }

    fn accept_connection(&self, endpoint: &EndpointId) -> Result<(), TransportError> {
        let now_connected = self.inner.with_link(endpoint, |link| {
            link.frames.try_send(Frame::Accept.into()).map_err(|_| link_busy())?;
            link.local_accepted = true;
            let now_connected = link.remote_accepted && !link.connected;
            if now_connected {
                link.connected = true;
            }
            Ok(now_connected)
        })?;
        if now_connected {
            self.inner.emit(TransportEvent::ConnectionResult {
                endpoint: endpoint.clone(),
                accepted: true,
            });
        }
        Ok(())
    }

    fn reject_connection(&self, endpoint: &EndpointId) -> Result<(), TransportError> {
        let link = lock(&self.inner.links)
            .remove(endpoint)
            .ok_or_else(|| TransportError::NotConnected(endpoint.clone()))?;
        let _ = link.frames.try_send(Frame::Reject.into());
        // Let the writer flush the reject; it exits once the channel closes.
        link.open.store(false, Ordering::Release);
        if let Some(task) = link.reader_task {
            task.abort();
        }
        self.inner.emit(TransportEvent::ConnectionResult {
            endpoint: endpoint.clone(),
            accepted: false,
        });
        Ok(())
    }

    fn send_bytes(&self, endpoint: &EndpointId, data: Bytes) -> Result<(), TransportError> {
        self.inner.with_link(endpoint, |link| {
            if !link.connected {
                return Err(TransportError::NotConnected(endpoint.clone()));
            }
            link.frames
                .try_send(Frame::Bytes(data).into())
                .map_err(|_| link_busy())
        })
    }

    fn send_stream(
        &self,
        endpoint: &EndpointId,
        stream: PayloadStream,
    ) -> Result<(), TransportError> {
        let (frames, open) = self.inner.with_link(endpoint, |link| {
            if !link.connected {
                return Err(TransportError::NotConnected(endpoint.clone()));
            }
            Ok((link.frames.clone(), link.open.clone()))
        })?;
        let events = self.inner.events.clone();
        let endpoint = endpoint.clone();
        self.inner
            .runtime
            .spawn_blocking(move || pump(stream, frames, open, events, endpoint));
        Ok(())
    }

    fn disconnect(&self, endpoint: &EndpointId) {
        let link = lock(&self.inner.links).remove(endpoint);
        if let Some(link) = link {
            info!("LAN: disconnecting from {}", endpoint);
            link.close();
        }
    }
}

/// Frame an outgoing stream onto the link. Blocks on link backpressure.
fn pump(
    mut source: PayloadStream,
    frames: mpsc::Sender<Outgoing>,
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
    endpoint: EndpointId,
) {
    let fail = |error: String| {
        let _ = frames.blocking_send(Frame::StreamAbort.into());
        let _ = events.send(TransportEvent::TransferFailed {
            endpoint: endpoint.clone(),
            error,
        });
    };

    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
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
            let (flushed_tx, flushed_rx) = oneshot::channel();
            if frames.blocking_send(Frame::StreamEnd.into()).is_err()
                || frames.blocking_send(Outgoing::Flushed(flushed_tx)).is_err()
            {
                return fail("link closed".to_string());
            }
            // The writer drops the marker unanswered if the socket dies first.
            if flushed_rx.blocking_recv().is_err() {
                return fail("link closed before the stream was flushed".to_string());
            }
            trace!("LAN: stream to {} flushed ({} bytes)", endpoint, sent);
            let _ = events.send(TransportEvent::TransferComplete {
                endpoint: endpoint.clone(),
            });
            return;
        }
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if frames.blocking_send(Frame::StreamChunk(chunk).into()).is_err() {
            return fail("link closed".to_string());
        }
        sent += n as u64;
        let _ = events.send(TransportEvent::TransferProgress {
            endpoint: endpoint.clone(),
            bytes: sent,
        });
    }
}

/// Drains the link's queue onto the socket, flushing after each batch.
/// Flush markers are answered only once everything queued before them is
/// out of the process.
async fn write_loop(writer: OwnedWriteHalf, mut outgoing: mpsc::Receiver<Outgoing>) {
    let mut writer = BufWriter::new(writer);
    let result: io::Result<()> = async {
        let mut flushed = Vec::new();
        while let Some(first) = outgoing.recv().await {
            let mut next = Some(first);
            while let Some(item) = next {
                match item {
                    Outgoing::Frame(frame) => frame.write_to(&mut writer).await?,
                    Outgoing::Flushed(done) => flushed.push(done),
                }
                next = outgoing.try_recv().ok();
            }
            writer.flush().await?;
            for done in flushed.drain(..) {
                let _ = done.send(());
            }
        }
        writer.shutdown().await
    }
    .await;
    if let Err(e) = result {
        debug!("LAN: link writer stopped: {}", e);
    }
}

fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    let sock_ref = SockRef::from(stream);
    sock_ref.set_nodelay(true)?;
    sock_ref.set_send_buffer_size(SOCKET_BUF_SIZE)?;
    sock_ref.set_recv_buffer_size(SOCKET_BUF_SIZE)?;
    Ok(())
}

fn map_io(err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        TransportError::PermissionDenied(err.to_string())
    } else {
        TransportError::Io(err)
    }
}

fn link_busy() -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::WouldBlock, "link busy"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, task: JoinHandle<()>) {
    if let Some(old) = lock(slot).replace(task) {
        old.abort();
    }
}

/// Returns true if a task was running.
fn stop_task(slot: &Mutex<Option<JoinHandle<()>>>) -> bool {
    match lock(slot).take() {
        Some(task) => {
            task.abort();
            true
        }
        None => false,
    }
}

// ---- Wire formats ----

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Hello(String),
    Accept,
    Reject,
    Bytes(Bytes),
    StreamChunk(Bytes),
    StreamEnd,
    StreamAbort,
}

/// An entry in a link's outbound queue.
enum Outgoing {
    Frame(Frame),
    /// Answered by the writer after the frames queued before it are flushed.
    Flushed(oneshot::Sender<()>),
}

impl From<Frame> for Outgoing {
    fn from(frame: Frame) -> Self {
        Self::Frame(frame)
    }
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Self::Hello(_) => FRAME_HELLO,
            Self::Accept => FRAME_ACCEPT,
            Self::Reject => FRAME_REJECT,
            Self::Bytes(_) => FRAME_BYTES,
            Self::StreamChunk(_) => FRAME_STREAM_CHUNK,
            Self::StreamEnd => FRAME_STREAM_END,
            Self::StreamAbort => FRAME_STREAM_ABORT,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Hello(name) => name.as_bytes(),
            Self::Bytes(data) | Self::StreamChunk(data) => &data[..],
            Self::Accept | Self::Reject | Self::StreamEnd | Self::StreamAbort => &[],
        }
    }

    async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let payload = self.payload();
        let mut header = [0u8; 5];
        header[0] = self.kind();
        header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        writer.write_all(&header).await?;
        writer.write_all(payload).await
    }

    fn decode(kind: u8, payload: Bytes) -> io::Result<Self> {
        let frame = match kind {
            FRAME_HELLO => Self::Hello(String::from_utf8_lossy(&payload).into_owned()),
            FRAME_ACCEPT => Self::Accept,
            FRAME_REJECT => Self::Reject,
            FRAME_BYTES => Self::Bytes(payload),
            FRAME_STREAM_CHUNK => Self::StreamChunk(payload),
            FRAME_STREAM_END => Self::StreamEnd,
            FRAME_STREAM_ABORT => Self::StreamAbort,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown frame type 0x{:02x}", other),
                ));
            }
        };
        Ok(frame)
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let kind = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Frame::decode(kind, Bytes::from(payload))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Beacon {
    tcp_port: u16,
    instance: Uuid,
    name: String,
}

impl Beacon {
    fn encode(&self) -> Vec<u8> {
        let mut name_len = self.name.len().min(MAX_NAME_LEN);
        while !self.name.is_char_boundary(name_len) {
            name_len -= 1;
        }
        let mut out = Vec::with_capacity(BEACON_HEADER_LEN + name_len);
        out.extend_from_slice(BEACON_MAGIC);
        out.push(BEACON_VERSION);
        out.extend_from_slice(&self.tcp_port.to_be_bytes());
        out.extend_from_slice(self.instance.as_bytes());
        out.extend_from_slice(&self.name.as_bytes()[..name_len]);
        out
    }

    fn decode(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < BEACON_HEADER_LEN
            || &datagram[..4] != BEACON_MAGIC
            || datagram[4] != BEACON_VERSION
        {
            return None;
        }
        let tcp_port = u16::from_be_bytes([datagram[5], datagram[6]]);
        let instance = Uuid::from_slice(&datagram[7..23]).ok()?;
        let name = std::str::from_utf8(&datagram[BEACON_HEADER_LEN..]).ok()?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            tcp_port,
            instance,
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Events = mpsc::UnboundedReceiver<TransportEvent>;

    async fn next(events: &mut Events) -> TransportEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if !matches!(event, TransportEvent::TransferProgress { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn frames_survive_the_wire() {
        let frames = vec![
            Frame::Hello("Alice's laptop".into()),
            Frame::Accept,
            Frame::Bytes(Bytes::from_static(b"hello.txt")),
            Frame::StreamChunk(Bytes::from(vec![9u8; 70_000])),
            Frame::StreamEnd,
        ];
        let mut wire = Vec::new();
        for frame in &frames {
            frame.write_to(&mut wire).await.unwrap();
        }
        assert_eq!(&wire[..5], &[FRAME_HELLO, 0, 0, 0, 14]);

        let mut reader = &wire[..];
        for expected in &frames {
            assert_eq!(&read_frame(&mut reader).await.unwrap(), expected);
        }
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn oversized_and_unknown_frames_are_rejected() {
        let mut too_long = vec![FRAME_BYTES];
        too_long.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        let err = read_frame(&mut &too_long[..]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let unknown = [0x7f, 0, 0, 0, 0];
        let err = read_frame(&mut &unknown[..]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn beacon_layout() {
        let beacon = Beacon {
            tcp_port: 40_000,
            instance: Uuid::new_v4(),
            name: "Alice's laptop".into(),
        };
        let bytes = beacon.encode();
        assert_eq!(&bytes[..4], b"HDRP");
        assert_eq!(&bytes[5..7], &40_000u16.to_be_bytes());
        assert_eq!(Beacon::decode(&bytes), Some(beacon));

        assert!(Beacon::decode(b"HDRX").is_none());
        let mut wrong_magic = bytes.clone();
        wrong_magic[0] = b'X';
        assert!(Beacon::decode(&wrong_magic).is_none());
    }

    #[test]
    fn long_names_are_cut_on_a_char_boundary() {
        let beacon = Beacon {
            tcp_port: 1,
            instance: Uuid::new_v4(),
            name: "é".repeat(150),
        };
        let decoded = Beacon::decode(&beacon.encode()).unwrap();
        assert_eq!(decoded.name.chars().count(), MAX_NAME_LEN / 2);
    }

    struct Pair {
        alice: LanTransport,
        alice_events: Events,
        /// Alice as Bob dialed her.
        alice_id: EndpointId,
        bob: LanTransport,
        bob_events: Events,
        /// Bob as Alice sees him.
        bob_id: EndpointId,
    }

    async fn connected_pair() -> Pair {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let alice = LanTransport::bind(LanConfig::default(), a_tx).await.unwrap();
        let bob = LanTransport::bind(LanConfig::default(), b_tx).await.unwrap();

        let alice_id = EndpointId::new(format!("127.0.0.1:{}", alice.tcp_port()));
        bob.request_connection("Bob's phone", &alice_id).unwrap();

        assert!(matches!(
            next(&mut b_rx).await,
            TransportEvent::ConnectionInitiated { incoming: false, .. }
        ));
        let bob_id = match next(&mut a_rx).await {
            TransportEvent::ConnectionInitiated {
                endpoint,
                remote_name,
                incoming: true,
            } => {
                assert_eq!(remote_name, "Bob's phone");
                endpoint
            }
            other => panic!("unexpected {:?}", other),
        };

        alice.accept_connection(&bob_id).unwrap();
        bob.accept_connection(&alice_id).unwrap();
        assert!(matches!(
            next(&mut a_rx).await,
            TransportEvent::ConnectionResult { accepted: true, .. }
        ));
        assert!(matches!(
            next(&mut b_rx).await,
            TransportEvent::ConnectionResult { accepted: true, .. }
        ));

        Pair {
            alice,
            alice_events: a_rx,
            alice_id,
            bob,
            bob_events: b_rx,
            bob_id,
        }
    }

    async fn next_stream(events: &mut Events) -> PayloadStream {
        match next(events).await {
            TransportEvent::PayloadReceived {
                payload: Payload::Stream(stream),
                ..
            } => stream,
            other => panic!("expected a stream, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn loopback_link_carries_bytes_and_streams() {
        let Pair {
            alice,
            alice_events: mut a_rx,
            alice_id,
            bob,
            bob_events: mut b_rx,
            bob_id,
        } = connected_pair().await;

        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        alice
            .send_bytes(&bob_id, Bytes::from_static(b"hello.txt"))
            .unwrap();
        alice
            .send_stream(&bob_id, Box::new(io::Cursor::new(data.clone())))
            .unwrap();

        match next(&mut b_rx).await {
            TransportEvent::PayloadReceived {
                payload: Payload::Bytes(name),
                ..
            } => assert_eq!(&name[..], b"hello.txt"),
            other => panic!("unexpected {:?}", other),
        }
        let mut stream = next_stream(&mut b_rx).await;
        let received = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            stream.read_to_end(&mut out).map(|_| out)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(received, data);
        assert!(matches!(
            next(&mut a_rx).await,
            TransportEvent::TransferComplete { .. }
        ));

        bob.disconnect(&alice_id);
        assert!(matches!(
            next(&mut a_rx).await,
            TransportEvent::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn stream_is_delivered_after_sender_shuts_down_on_complete() {
        let Pair {
            alice,
            alice_events: mut a_rx,
            bob: _bob,
            bob_events: mut b_rx,
            bob_id,
            ..
        } = connected_pair().await;

        // Larger than the socket buffers and the inbound pipe together.
        let data: Vec<u8> = (0..6_000_000u32).map(|i| (i % 253) as u8).collect();
        alice
            .send_stream(&bob_id, Box::new(io::Cursor::new(data.clone())))
            .unwrap();

        let mut stream = next_stream(&mut b_rx).await;
        let reader = tokio::task::spawn_blocking(move || {
            std::thread::sleep(Duration::from_millis(300));
            let mut out = Vec::new();
            stream.read_to_end(&mut out).map(|_| out)
        });

        assert!(matches!(
            next(&mut a_rx).await,
            TransportEvent::TransferComplete { .. }
        ));
        // What a sending process does once told it is done.
        drop(alice);

        let received = reader.await.unwrap().expect("stream cut short");
        assert_eq!(received.len(), data.len());
        assert!(received == data);
    }

    #[tokio::test]
    async fn disconnect_unblocks_a_stalled_inbound_stream() {
        let Pair {
            alice,
            bob,
            alice_id,
            bob_events: mut b_rx,
            bob_id,
            ..
        } = connected_pair().await;

        // Nobody reads, so Bob's reader task ends up parked on the full pipe.
        let data = vec![7u8; 4_000_000];
        alice
            .send_stream(&bob_id, Box::new(io::Cursor::new(data)))
            .unwrap();
        let mut stream = next_stream(&mut b_rx).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        bob.disconnect(&alice_id);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::task::spawn_blocking(move || {
                let mut out = Vec::new();
                stream.read_to_end(&mut out)
            }),
        )
        .await
        .expect("reader stayed blocked")
        .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
        drop(alice);
    }

    #[tokio::test]
    async fn dialing_nothing_reports_rejection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = LanTransport::bind(LanConfig::default(), tx).await.unwrap();

        // Bind and drop a listener to get a port nobody is on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = EndpointId::new(format!("127.0.0.1:{}", port));
        transport.request_connection("me", &target).unwrap();

        assert!(matches!(
            next(&mut rx).await,
            TransportEvent::ConnectionResult { accepted: false, .. }
        ));
        assert!(matches!(
            transport.request_connection("me", &EndpointId::new("not-an-address")),
            Err(TransportError::UnknownEndpoint(_))
        ));
    }
}
