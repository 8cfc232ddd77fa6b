//! Mesh relay engine: the single task that owns all peer, dedup, and
//! radio-lifecycle state.
//!
//! Transport callbacks, host commands, and timer ticks arrive as tagged
//! messages on one queue and are processed strictly one at a time, so no
//! mutation of the peer table, seen set, or lifecycle flags ever races.
//! Delayed work is a spawned sleep that posts a tick back onto the queue.

use crate::config::TimingConfig;
use crate::peers::{PeerState, PeerTable};
use crate::seen::SeenSet;
use crate::transport::{Transport, TransportError, TransportEvent};
use flare_common::{Alert, EndpointId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Engine parameters supplied by the host.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Service identity advertised and scanned for.
    pub service_id: String,
    /// Display name shown to peers.
    pub local_name: String,
    /// Capacity of the duplicate-suppression set.
    pub seen_capacity: usize,
    /// Timing parameters for retries and periodic work.
    pub timing: TimingConfig,
}

/// Event emitted by the engine for the host to consume.
///
/// Delivery is ordered and best-effort. Hosts may drop or coalesce
/// `Status` events; `AlertReceived` events must each be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A newly seen alert that should be displayed.
    AlertReceived {
        /// Unique alert identifier.
        id: String,
        /// Alert text.
        text: String,
        /// Origination time in milliseconds since the Unix epoch.
        timestamp: i64,
        /// Hop budget the alert arrived with.
        ttl: u32,
    },
    /// Informational status line. The literal form
    /// `Status: <N> peers connected` carries the connection count.
    Status {
        /// Status text.
        message: String,
    },
}

/// Errors returned to the host by [`EngineHandle`] calls.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The alert text was empty.
    #[error("alert text is empty")]
    EmptyAlert,
    /// The engine has been shut down or its task is gone.
    #[error("engine is not running")]
    NotRunning,
    /// The radio transport reported a terminal failure.
    #[error("radio transport unavailable")]
    TransportUnavailable,
}

enum Command {
    Start {
        ack: oneshot::Sender<Result<(), EngineError>>,
    },
    SendAlert {
        text: String,
        ack: oneshot::Sender<Result<(), EngineError>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum Tick {
    StartAdvertising,
    StartDiscovery,
    DiscoveryMaintenance,
    StatusCheck,
    ReconnectProbe(EndpointId),
    RetryConnect(EndpointId),
}

enum EngineMsg {
    Command(Command),
    Tick(Tick),
}

/// Discovery lifecycle. The transport allows a single discovery instance
/// and its stop is not instantaneous, so a start requested while stopping
/// is parked until the stop completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discovery {
    Off,
    On,
    Stopping { pending_start: bool },
}

/// Host-facing handle to a spawned relay engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineMsg>,
}

impl EngineHandle {
    /// Begins advertising and schedules discovery plus periodic tasks.
    ///
    /// Idempotent. Resolves once the engine has accepted the request, not
    /// once peers are connected.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] if the engine task is gone, or
    /// [`EngineError::TransportUnavailable`] after a terminal radio
    /// failure.
    pub async fn start(&self) -> Result<(), EngineError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Command(Command::Start { ack }))
            .map_err(|_| EngineError::NotRunning)?;
        rx.await.map_err(|_| EngineError::NotRunning)?
    }

    /// Originates an alert and floods it to all connected peers.
    ///
    /// Resolves after local encoding and dispatch; delivery is
    /// best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::EmptyAlert`] when `text` is empty or
    /// whitespace, [`EngineError::NotRunning`] if the engine task is gone,
    /// or [`EngineError::TransportUnavailable`] after a terminal radio
    /// failure.
    pub async fn send_alert(&self, text: &str) -> Result<(), EngineError> {
        if text.trim().is_empty() {
            return Err(EngineError::EmptyAlert);
        }
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Command(Command::SendAlert {
                text: text.to_owned(),
                ack,
            }))
            .map_err(|_| EngineError::NotRunning)?;
        rx.await.map_err(|_| EngineError::NotRunning)?
    }

    /// Tears the engine down: stops advertising, discovery, and every
    /// link, and clears all state. Further transport callbacks are
    /// ignored.
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self
            .tx
            .send(EngineMsg::Command(Command::Shutdown { ack }))
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Spawns a relay engine driving `transport`.
///
/// `transport_rx` is the receiving half of the channel the transport was
/// given for its callbacks. Returns the host handle and the event stream.
pub fn spawn<T: Transport>(
    config: EngineConfig,
    transport: T,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
) -> (EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let engine = RelayEngine {
        seen: SeenSet::new(config.seen_capacity),
        config,
        transport,
        peers: PeerTable::new(),
        advertising: false,
        discovery: Discovery::Off,
        running: false,
        failed: false,
        events: event_tx,
        msg_tx: msg_tx.clone(),
    };
    tokio::spawn(engine.run(msg_rx, transport_rx));

    (EngineHandle { tx: msg_tx }, event_rx)
}

struct RelayEngine<T: Transport> {
    config: EngineConfig,
    transport: T,
    peers: PeerTable,
    seen: SeenSet,
    advertising: bool,
    discovery: Discovery,
    running: bool,
    failed: bool,
    events: mpsc::UnboundedSender<EngineEvent>,
    msg_tx: mpsc::UnboundedSender<EngineMsg>,
}

impl<T: Transport> RelayEngine<T> {
    async fn run(
        mut self,
        mut msg_rx: mpsc::UnboundedReceiver<EngineMsg>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let msg = tokio::select! {
                Some(msg) = msg_rx.recv() => msg,
                Some(event) = transport_rx.recv() => {
                    if self.running && !self.failed {
                        self.handle_transport(event);
                    }
                    continue;
                }
                else => break,
            };
            match msg {
                EngineMsg::Command(Command::Shutdown { ack }) => {
                    self.shutdown();
                    let _ = ack.send(());
                    break;
                }
                EngineMsg::Command(command) => self.handle_command(command),
                EngineMsg::Tick(tick) => {
                    if self.running && !self.failed {
                        self.handle_tick(tick);
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { ack } => {
                let result = if self.failed {
                    Err(EngineError::TransportUnavailable)
                } else {
                    if !self.running {
                        self.running = true;
                        self.begin();
                    }
                    Ok(())
                };
                let _ = ack.send(result);
            }
            Command::SendAlert { text, ack } => {
                let result = if self.failed {
                    Err(EngineError::TransportUnavailable)
                } else {
                    self.originate(&text);
                    Ok(())
                };
                let _ = ack.send(result);
            }
            Command::Shutdown { .. } => unreachable!("shutdown is handled in the run loop"),
        }
    }

    fn begin(&mut self) {
        info!(name = %self.config.local_name, "starting mesh relay");
        self.start_advertising_now();
        self.schedule(
            Tick::StartDiscovery,
            self.config.timing.discovery_start_delay(),
        );
        self.schedule(
            Tick::DiscoveryMaintenance,
            self.config.timing.maintenance_interval(),
        );
        self.schedule(Tick::StatusCheck, self.config.timing.status_interval());
    }

    fn shutdown(&mut self) {
        self.running = false;
        self.transport.stop_advertising();
        self.transport.stop_discovery();
        self.transport.stop_all_endpoints();
        self.peers.clear();
        self.seen.clear();
        self.advertising = false;
        self.discovery = Discovery::Off;
        info!("engine stopped");
    }

    fn handle_tick(&mut self, tick: Tick) {
        match tick {
            Tick::StartAdvertising => self.start_advertising_now(),
            Tick::StartDiscovery => self.start_discovery(),
            Tick::DiscoveryMaintenance => {
                let window = self.config.timing.lost_window();
                for endpoint in self.peers.evict_lost(window, Instant::now()) {
                    debug!(endpoint = %endpoint, "dropping lost peer after reconnect window");
                }
                if self.should_discover() && self.discovery == Discovery::Off {
                    self.start_discovery();
                }
                self.schedule(
                    Tick::DiscoveryMaintenance,
                    self.config.timing.maintenance_interval(),
                );
            }
            Tick::StatusCheck => {
                if !self.advertising {
                    self.start_advertising_now();
                }
                if self.discovery == Discovery::Off && self.should_discover() {
                    self.start_discovery();
                }
                self.emit_peer_count();
                self.schedule(Tick::StatusCheck, self.config.timing.status_interval());
            }
            Tick::ReconnectProbe(endpoint) => {
                if !self.peers.is_connected(&endpoint) {
                    debug!(endpoint = %endpoint, "peer still absent after disconnect, nudging discovery");
                    self.start_discovery();
                }
            }
            Tick::RetryConnect(endpoint) => {
                if matches!(self.peers.state(&endpoint), Some(PeerState::Lost { .. })) {
                    self.connect_to(&endpoint);
                }
            }
        }
    }

    /// Discovery is wanted whenever a peer is waiting to come back or no
    /// peer is connected at all.
    fn should_discover(&self) -> bool {
        self.peers.has_lost() || self.peers.connected_count() == 0
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::EndpointFound {
                endpoint,
                name,
                service_id,
            } => self.on_endpoint_found(&endpoint, &name, &service_id),
            TransportEvent::EndpointLost { endpoint } => self.on_endpoint_lost(&endpoint),
            TransportEvent::ConnectionInitiated { endpoint, name } => {
                self.on_connection_initiated(&endpoint, &name);
            }
            TransportEvent::ConnectionResult { endpoint, success } => {
                self.on_connection_result(&endpoint, success);
            }
            TransportEvent::Disconnected { endpoint } => self.on_disconnected(&endpoint),
            TransportEvent::PayloadReceived { endpoint, bytes } => {
                self.on_payload(&endpoint, &bytes);
            }
            TransportEvent::DiscoveryStopped => self.on_discovery_stopped(),
        }
    }

    fn on_endpoint_found(&mut self, endpoint: &str, name: &str, service_id: &str) {
        if service_id != self.config.service_id {
            debug!(endpoint = %endpoint, service_id = %service_id, "ignoring foreign service");
            return;
        }
        match self.peers.state(endpoint) {
            Some(PeerState::Connected) => {
                debug!(endpoint = %endpoint, "found endpoint is already connected");
            }
            Some(PeerState::Connecting) => {}
            Some(PeerState::Lost { since })
                if since.elapsed() <= self.config.timing.lost_window() =>
            {
                info!(endpoint = %endpoint, name = %name, "lost peer reappeared");
                self.emit_status(format!("Reconnecting to {name}"));
                self.connect_to(endpoint);
            }
            _ => {
                info!(endpoint = %endpoint, name = %name, "endpoint found");
                self.connect_to(endpoint);
            }
        }
    }

    fn on_endpoint_lost(&mut self, endpoint: &str) {
        match self.peers.state(endpoint) {
            Some(PeerState::Connected) => {
                warn!(endpoint = %endpoint, "connected endpoint went out of range");
                self.peers.mark_lost(endpoint, Instant::now());
                self.emit_peer_count();
                self.start_discovery();
            }
            Some(_) => self.peers.remove(endpoint),
            None => {}
        }
    }

    fn on_connection_initiated(&mut self, endpoint: &str, name: &str) {
        if self.peers.is_connected(endpoint) {
            debug!(endpoint = %endpoint, "ignoring connection from already-connected endpoint");
            return;
        }
        debug!(endpoint = %endpoint, name = %name, "accepting connection");
        match self.transport.accept_connection(endpoint) {
            Ok(()) => self.peers.set_connecting(endpoint),
            Err(e) if e.is_fatal() => self.enter_failed(&e),
            Err(e) => warn!(endpoint = %endpoint, error = %e, "accept failed"),
        }
    }

    fn on_connection_result(&mut self, endpoint: &str, success: bool) {
        if success {
            self.peers.mark_connected(endpoint);
            info!(endpoint = %endpoint, peers = self.peers.connected_count(), "peer connected");
            self.emit_peer_count();
            // The radio dislikes discovering while linked; maintenance
            // restarts discovery whenever a peer needs to be found again.
            if !self.peers.has_lost() {
                self.stop_discovery();
            }
        } else if !self.peers.is_connected(endpoint) {
            warn!(endpoint = %endpoint, "connection attempt failed");
            self.peers.mark_lost(endpoint, Instant::now());
        }
    }

    fn on_disconnected(&mut self, endpoint: &str) {
        match self.peers.state(endpoint) {
            Some(PeerState::Connected | PeerState::Connecting) => {
                warn!(endpoint = %endpoint, "peer disconnected");
                self.peers.mark_lost(endpoint, Instant::now());
                self.emit_peer_count();
                self.start_discovery();
                self.schedule(
                    Tick::ReconnectProbe(endpoint.to_owned()),
                    self.config.timing.reconnect_probe_delay(),
                );
            }
            _ => {}
        }
    }

    fn on_payload(&mut self, endpoint: &str, bytes: &[u8]) {
        let alert = match Alert::decode(bytes) {
            Ok(alert) => alert,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "dropping malformed payload");
                return;
            }
        };
        if !self.seen.insert(&alert.id) {
            trace!(id = %alert.id, "duplicate alert dropped");
            return;
        }
        info!(id = %alert.id, ttl = alert.ttl, "alert received");
        self.emit(EngineEvent::AlertReceived {
            id: alert.id.clone(),
            text: alert.text.clone(),
            timestamp: alert.timestamp,
            ttl: alert.ttl,
        });
        if alert.ttl > 1 {
            let forward = alert.forwarded();
            self.broadcast(&forward.encode(), Some(endpoint));
        } else {
            trace!(id = %alert.id, "hop budget exhausted, not forwarding");
        }
    }

    fn on_discovery_stopped(&mut self) {
        let pending = match self.discovery {
            Discovery::Stopping { pending_start } => pending_start,
            // Unsolicited stop; resync and let the periodic checks restart.
            _ => false,
        };
        self.discovery = Discovery::Off;
        debug!(pending_start = pending, "discovery stopped");
        if pending {
            self.schedule(Tick::StartDiscovery, self.config.timing.settle_delay());
        }
    }

    fn originate(&mut self, text: &str) {
        let alert = Alert::new(text);
        // Remember our own id so a flood that loops back through the mesh
        // is not re-displayed here; the local UI shows outbound alerts.
        self.seen.insert(&alert.id);
        info!(id = %alert.id, "originating alert");
        self.broadcast(&alert.encode(), None);
    }

    fn broadcast(&mut self, bytes: &[u8], exclude: Option<&str>) {
        let recipients: Vec<EndpointId> = self
            .peers
            .connected()
            .into_iter()
            .filter(|endpoint| exclude != Some(endpoint.as_str()))
            .collect();
        for endpoint in &recipients {
            match self.transport.send_payload(endpoint, bytes.to_vec()) {
                Ok(()) => trace!(endpoint = %endpoint, len = bytes.len(), "payload sent"),
                Err(e) if e.is_fatal() => {
                    self.enter_failed(&e);
                    return;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "send failed");
                    self.emit_status(format!("Send to {endpoint} failed: {e}"));
                }
            }
        }
        self.emit_peer_count();
    }

    fn connect_to(&mut self, endpoint: &str) {
        self.peers.set_discovered(endpoint);
        match self
            .transport
            .request_connection(&self.config.local_name, endpoint)
        {
            Ok(()) => self.peers.set_connecting(endpoint),
            Err(e) if e.is_fatal() => self.enter_failed(&e),
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "connection request failed");
                self.peers.mark_lost(endpoint, Instant::now());
                self.schedule(
                    Tick::RetryConnect(endpoint.to_owned()),
                    self.config.timing.connect_retry_delay(),
                );
            }
        }
    }

    fn start_advertising_now(&mut self) {
        if self.advertising {
            return;
        }
        match self
            .transport
            .start_advertising(&self.config.service_id, &self.config.local_name)
        {
            Ok(()) => {
                self.advertising = true;
                info!(name = %self.config.local_name, "advertising started");
            }
            Err(TransportError::AlreadyAdvertising) => {
                self.advertising = true;
            }
            Err(e) if e.is_fatal() => self.enter_failed(&e),
            Err(e) => {
                warn!(error = %e, "advertising failed, will retry");
                self.schedule(
                    Tick::StartAdvertising,
                    self.config.timing.transport_retry_delay(),
                );
            }
        }
    }

    fn start_discovery(&mut self) {
        match self.discovery {
            Discovery::On => {}
            Discovery::Stopping { .. } => {
                self.discovery = Discovery::Stopping {
                    pending_start: true,
                };
            }
            Discovery::Off => match self.transport.start_discovery(&self.config.service_id) {
                Ok(()) => {
                    self.discovery = Discovery::On;
                    debug!("discovery started");
                }
                Err(TransportError::AlreadyDiscovering) => {
                    self.discovery = Discovery::On;
                }
                Err(e) if e.is_fatal() => self.enter_failed(&e),
                Err(e) => {
                    warn!(error = %e, "discovery failed, will retry");
                    self.schedule(
                        Tick::StartDiscovery,
                        self.config.timing.transport_retry_delay(),
                    );
                }
            },
        }
    }

    fn stop_discovery(&mut self) {
        if self.discovery != Discovery::On {
            return;
        }
        self.discovery = Discovery::Stopping {
            pending_start: false,
        };
        self.transport.stop_discovery();
    }

    fn enter_failed(&mut self, error: &TransportError) {
        error!(error = %error, "transport failure is terminal");
        self.failed = true;
        self.emit_status(format!("Radio unavailable: {error}"));
    }

    fn emit_peer_count(&self) {
        let count = self.peers.connected_count();
        self.emit_status(format!("Status: {count} peers connected"));
    }

    fn emit_status(&self, message: String) {
        self.emit(EngineEvent::Status { message });
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            trace!("event dropped: host is gone");
        }
    }

    fn schedule(&self, tick: Tick, delay: Duration) {
        let tx = self.msg_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineMsg::Tick(tick));
        });
    }
}
