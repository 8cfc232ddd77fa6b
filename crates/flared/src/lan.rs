//! LAN realization of the transport adapter: UDP multicast beacons stand
//! in for radio advertising/discovery, and each connected peer gets a
//! dedicated TCP link carrying length-prefixed frames.
//!
//! Adapter contract: operations return immediately, connection setup
//! surfaces `ConnectionInitiated` on both sides and completes only after
//! `accept_connection`, and `stop_discovery` completes asynchronously
//! with `DiscoveryStopped`.

use crate::transport::{EventSender, Transport, TransportError, TransportEvent};
use flare_common::EndpointId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 70, 70);
const BEACON_INTERVAL: Duration = Duration::from_secs(2);
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(8);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME_LEN: usize = 64 * 1024;
const LINK_QUEUE: usize = 64;

/// Multicast beacon announcing a discoverable node.
#[derive(Debug, Serialize, Deserialize)]
struct Beacon {
    service_id: String,
    endpoint: EndpointId,
    name: String,
    port: u16,
}

/// First frame exchanged on a fresh TCP link.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    endpoint: EndpointId,
    name: String,
}

struct DiscoveredPeer {
    addr: SocketAddr,
    name: String,
    last_seen: Instant,
}

struct Link {
    tx: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    discovered: HashMap<EndpointId, DiscoveredPeer>,
    pending: HashMap<EndpointId, oneshot::Sender<()>>,
    links: HashMap<EndpointId, Link>,
}

fn lock(inner: &Arc<Mutex<Shared>>) -> MutexGuard<'_, Shared> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport over a local network segment.
pub struct LanTransport {
    local_endpoint: EndpointId,
    discovery_port: u16,
    listen_port: u16,
    events: EventSender,
    inner: Arc<Mutex<Shared>>,
    accept_task: JoinHandle<()>,
    beacon_task: Option<JoinHandle<()>>,
    discovery_task: Option<JoinHandle<()>>,
}

impl LanTransport {
    /// Binds the TCP link listener and starts accepting inbound peers.
    ///
    /// `transport_port` 0 picks an ephemeral port; beacons advertise the
    /// actual one. Discovery and advertising stay off until the engine
    /// starts them.
    ///
    /// # Errors
    ///
    /// Returns an error if the link listener cannot be bound.
    pub async fn bind(
        discovery_port: u16,
        transport_port: u16,
        events: EventSender,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", transport_port)).await?;
        let listen_port = listener.local_addr()?.port();
        let inner = Arc::new(Mutex::new(Shared::default()));
        let local_endpoint: EndpointId = uuid::Uuid::new_v4().to_string();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            local_endpoint.clone(),
            inner.clone(),
            events.clone(),
        ));
        Ok(Self {
            local_endpoint,
            discovery_port,
            listen_port,
            events,
            inner,
            accept_task,
            beacon_task: None,
            discovery_task: None,
        })
    }

    /// Port the link listener is bound to.
    #[must_use]
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Endpoint id this node advertises.
    #[must_use]
    pub fn local_endpoint(&self) -> &str {
        &self.local_endpoint
    }
}

impl Transport for LanTransport {
    fn start_advertising(
        &mut self,
        service_id: &str,
        local_name: &str,
    ) -> Result<(), TransportError> {
        if self.beacon_task.is_some() {
            return Err(TransportError::AlreadyAdvertising);
        }
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_nonblocking(true)?;
        let beacon = Beacon {
            service_id: service_id.to_owned(),
            endpoint: self.local_endpoint.clone(),
            name: local_name.to_owned(),
            port: self.listen_port,
        };
        let dest = SocketAddr::from((MULTICAST_GROUP, self.discovery_port));
        self.beacon_task = Some(tokio::spawn(beacon_loop(socket, beacon, dest)));
        Ok(())
    }

    fn stop_advertising(&mut self) {
        if let Some(task) = self.beacon_task.take() {
            task.abort();
        }
    }

    fn start_discovery(&mut self, service_id: &str) -> Result<(), TransportError> {
        if self.discovery_task.is_some() {
            return Err(TransportError::AlreadyDiscovering);
        }
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.discovery_port))?;
        socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_nonblocking(true)?;
        self.discovery_task = Some(tokio::spawn(discovery_loop(
            socket,
            service_id.to_owned(),
            self.local_endpoint.clone(),
            self.inner.clone(),
            self.events.clone(),
        )));
        Ok(())
    }

    fn stop_discovery(&mut self) {
        if let Some(task) = self.discovery_task.take() {
            task.abort();
            let _ = self.events.send(TransportEvent::DiscoveryStopped);
        }
    }

    fn request_connection(
        &mut self,
        local_name: &str,
        endpoint: &str,
    ) -> Result<(), TransportError> {
        let (addr, remote_name) = {
            let shared = lock(&self.inner);
            match shared.discovered.get(endpoint) {
                Some(peer) => (peer.addr, peer.name.clone()),
                None => return Err(TransportError::UnknownEndpoint(endpoint.to_owned())),
            }
        };
        let hello = Hello {
            endpoint: self.local_endpoint.clone(),
            name: local_name.to_owned(),
        };
        let target = endpoint.to_owned();
        let inner = self.inner.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            dial(addr, target, remote_name, hello, inner, events).await;
        });
        Ok(())
    }

    fn accept_connection(&mut self, endpoint: &str) -> Result<(), TransportError> {
        match lock(&self.inner).pending.remove(endpoint) {
            Some(accept_tx) => {
                let _ = accept_tx.send(());
                Ok(())
            }
            None => Err(TransportError::UnknownEndpoint(endpoint.to_owned())),
        }
    }

    fn send_payload(&mut self, endpoint: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "payload exceeds frame limit",
            )));
        }
        let shared = lock(&self.inner);
        let Some(link) = shared.links.get(endpoint) else {
            return Err(TransportError::NotConnected(endpoint.to_owned()));
        };
        link.tx.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "link queue full",
            )),
            TrySendError::Closed(_) => TransportError::NotConnected(endpoint.to_owned()),
        })
    }

    fn stop_all_endpoints(&mut self) {
        let mut shared = lock(&self.inner);
        for (_, link) in shared.links.drain() {
            link.reader.abort();
            link.writer.abort();
        }
        shared.pending.clear();
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.stop_advertising();
        if let Some(task) = self.discovery_task.take() {
            task.abort();
        }
        self.stop_all_endpoints();
    }
}

async fn beacon_loop(socket: std::net::UdpSocket, beacon: Beacon, dest: SocketAddr) {
    let socket = match UdpSocket::from_std(socket) {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "beacon socket setup failed");
            return;
        }
    };
    let frame = match serde_json::to_vec(&beacon) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "beacon encoding failed");
            return;
        }
    };
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn discovery_loop(
    socket: std::net::UdpSocket,
    service_id: String,
    local_endpoint: EndpointId,
    inner: Arc<Mutex<Shared>>,
    events: EventSender,
) {
    let socket = match UdpSocket::from_std(socket) {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "discovery socket setup failed");
            return;
        }
    };
    let mut buf = vec![0u8; 2048];
    let mut sweep = tokio::time::interval(BEACON_INTERVAL);
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "beacon receive failed");
                        continue;
                    }
                };
                let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..n]) else {
                    continue;
                };
                if beacon.service_id != service_id || beacon.endpoint == local_endpoint {
                    continue;
                }
                let addr = SocketAddr::new(from.ip(), beacon.port);
                let newly_found = {
                    let mut shared = lock(&inner);
                    let known = shared.discovered.contains_key(&beacon.endpoint);
                    shared.discovered.insert(
                        beacon.endpoint.clone(),
                        DiscoveredPeer {
                            addr,
                            name: beacon.name.clone(),
                            last_seen: Instant::now(),
                        },
                    );
                    !known
                };
                if newly_found {
                    debug!(endpoint = %beacon.endpoint, %addr, "beacon from new endpoint");
                    let _ = events.send(TransportEvent::EndpointFound {
                        endpoint: beacon.endpoint,
                        name: beacon.name,
                        service_id: beacon.service_id,
                    });
                }
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                let silent: Vec<EndpointId> = {
                    let mut shared = lock(&inner);
                    let gone: Vec<EndpointId> = shared
                        .discovered
                        .iter()
                        .filter(|(_, peer)| now.duration_since(peer.last_seen) >= ENDPOINT_TIMEOUT)
                        .map(|(endpoint, _)| endpoint.clone())
                        .collect();
                    for endpoint in &gone {
                        shared.discovered.remove(endpoint);
                    }
                    gone
                };
                for endpoint in silent {
                    let _ = events.send(TransportEvent::EndpointLost { endpoint });
                }
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_endpoint: EndpointId,
    inner: Arc<Mutex<Shared>>,
    events: EventSender,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "inbound link");
                let local_endpoint = local_endpoint.clone();
                let inner = inner.clone();
                let events = events.clone();
                tokio::spawn(handle_inbound(stream, local_endpoint, inner, events));
            }
            Err(e) => {
                warn!(error = %e, "failed to accept link");
            }
        }
    }
}

async fn handle_inbound(
    mut stream: TcpStream,
    local_endpoint: EndpointId,
    inner: Arc<Mutex<Shared>>,
    events: EventSender,
) {
    let hello_bytes = match timeout(ACCEPT_TIMEOUT, read_frame(&mut stream)).await {
        Ok(Ok(bytes)) => bytes,
        _ => return,
    };
    let Ok(hello) = serde_json::from_slice::<Hello>(&hello_bytes) else {
        debug!("dropping link with malformed hello");
        return;
    };
    await_accept(
        Role::Responder,
        local_endpoint,
        hello.endpoint,
        hello.name,
        stream,
        inner,
        events,
    )
    .await;
}

async fn dial(
    addr: SocketAddr,
    endpoint: EndpointId,
    remote_name: String,
    hello: Hello,
    inner: Arc<Mutex<Shared>>,
    events: EventSender,
) {
    let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        _ => {
            debug!(endpoint = %endpoint, %addr, "dial failed");
            let _ = events.send(TransportEvent::ConnectionResult {
                endpoint,
                success: false,
            });
            return;
        }
    };
    let hello_bytes = match serde_json::to_vec(&hello) {
        Ok(bytes) => bytes,
        Err(_) => return,
    };
    if write_frame(&mut stream, &hello_bytes).await.is_err() {
        let _ = events.send(TransportEvent::ConnectionResult {
            endpoint,
            success: false,
        });
        return;
    }
    await_accept(
        Role::Dialer,
        hello.endpoint,
        endpoint,
        remote_name,
        stream,
        inner,
        events,
    )
    .await;
}

#[derive(Clone, Copy)]
enum Role {
    Dialer,
    Responder,
}

/// Parks a half-open link until the local engine accepts it, then
/// completes the handshake and promotes the stream to a full link.
async fn await_accept(
    role: Role,
    local_endpoint: EndpointId,
    endpoint: EndpointId,
    name: String,
    mut stream: TcpStream,
    inner: Arc<Mutex<Shared>>,
    events: EventSender,
) {
    let (accept_tx, accept_rx) = oneshot::channel();
    {
        let mut shared = lock(&inner);
        if shared.links.contains_key(&endpoint) {
            debug!(endpoint = %endpoint, "dropping duplicate link");
            return;
        }
        if shared.pending.contains_key(&endpoint) {
            // Both nodes dialed each other at once. The lower endpoint id
            // keeps its outbound leg; the higher one yields to the inbound.
            let keep_inbound = matches!(role, Role::Responder) && endpoint < local_endpoint;
            if keep_inbound {
                // Dropping the parked sender fails the outbound leg.
                shared.pending.remove(&endpoint);
            } else {
                debug!(endpoint = %endpoint, "dropping duplicate link");
                return;
            }
        }
        shared.pending.insert(endpoint.clone(), accept_tx);
    }
    let _ = events.send(TransportEvent::ConnectionInitiated {
        endpoint: endpoint.clone(),
        name,
    });

    let outcome = timeout(ACCEPT_TIMEOUT, accept_rx).await;
    if outcome.is_err() {
        // Timed out: the entry is still ours to clean up. A cancelled
        // sender means another leg replaced this one; leave the map alone.
        lock(&inner).pending.remove(&endpoint);
    }
    let accepted = matches!(outcome, Ok(Ok(())));
    if !accepted {
        debug!(endpoint = %endpoint, "link was not accepted locally");
        let _ = events.send(TransportEvent::ConnectionResult {
            endpoint,
            success: false,
        });
        return;
    }

    // The responder confirms with an empty frame once its engine accepts;
    // the dialer waits for that confirmation.
    let established = match role {
        Role::Responder => write_frame(&mut stream, b"").await.is_ok(),
        Role::Dialer => matches!(
            timeout(ACCEPT_TIMEOUT, read_frame(&mut stream)).await,
            Ok(Ok(_))
        ),
    };
    if !established {
        let _ = events.send(TransportEvent::ConnectionResult {
            endpoint,
            success: false,
        });
        return;
    }

    spawn_link(endpoint.clone(), stream, &inner, &events);
    let _ = events.send(TransportEvent::ConnectionResult {
        endpoint,
        success: true,
    });
}

fn spawn_link(
    endpoint: EndpointId,
    stream: TcpStream,
    inner: &Arc<Mutex<Shared>>,
    events: &EventSender,
) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Vec<u8>>(LINK_QUEUE);
    let writer = tokio::spawn(write_loop(write_half, rx));
    let reader = tokio::spawn(read_loop(
        endpoint.clone(),
        read_half,
        inner.clone(),
        events.clone(),
    ));
    lock(inner).links.insert(endpoint, Link { tx, reader, writer });
}

async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if write_frame(&mut half, &bytes).await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    endpoint: EndpointId,
    mut half: OwnedReadHalf,
    inner: Arc<Mutex<Shared>>,
    events: EventSender,
) {
    loop {
        match read_frame(&mut half).await {
            Ok(bytes) => {
                let _ = events.send(TransportEvent::PayloadReceived {
                    endpoint: endpoint.clone(),
                    bytes,
                });
            }
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "link closed");
                break;
            }
        }
    }
    if let Some(link) = lock(&inner).links.remove(&endpoint) {
        link.writer.abort();
        let _ = events.send(TransportEvent::Disconnected { endpoint });
    }
}

async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "frame too large",
        ));
    }
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
