#![allow(dead_code)]

use flared::config::TimingConfig;
use flared::engine::{self, EngineConfig, EngineEvent, EngineHandle};
use flared::transport::{Transport, TransportError, TransportEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(5);

/// Record of a single adapter call made by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartAdvertising { service_id: String, local_name: String },
    StopAdvertising,
    StartDiscovery { service_id: String },
    StopDiscovery,
    RequestConnection { endpoint: String },
    AcceptConnection { endpoint: String },
    SendPayload { endpoint: String, bytes: Vec<u8> },
    StopAllEndpoints,
}

impl TransportCall {
    pub fn is_send(&self) -> bool {
        matches!(self, TransportCall::SendPayload { .. })
    }
}

/// Scripted failures, consumed one entry per matching call; an empty
/// queue means the call succeeds.
#[derive(Debug, Default)]
pub struct Script {
    pub advertising: VecDeque<TransportError>,
    pub discovery: VecDeque<TransportError>,
    pub connect: VecDeque<TransportError>,
    pub send: VecDeque<TransportError>,
}

/// In-memory transport that records every adapter call and lets tests
/// inject callback events through the engine's event channel.
pub struct ScriptedTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    script: Arc<Mutex<Script>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    auto_complete_stop: Arc<AtomicBool>,
}

impl Transport for ScriptedTransport {
    fn start_advertising(
        &mut self,
        service_id: &str,
        local_name: &str,
    ) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(TransportCall::StartAdvertising {
                service_id: service_id.to_owned(),
                local_name: local_name.to_owned(),
            });
        match self.script.lock().unwrap().advertising.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop_advertising(&mut self) {
        self.calls.lock().unwrap().push(TransportCall::StopAdvertising);
    }

    fn start_discovery(&mut self, service_id: &str) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(TransportCall::StartDiscovery {
                service_id: service_id.to_owned(),
            });
        match self.script.lock().unwrap().discovery.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop_discovery(&mut self) {
        self.calls.lock().unwrap().push(TransportCall::StopDiscovery);
        if self.auto_complete_stop.load(Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::DiscoveryStopped);
        }
    }

    fn request_connection(
        &mut self,
        _local_name: &str,
        endpoint: &str,
    ) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(TransportCall::RequestConnection {
                endpoint: endpoint.to_owned(),
            });
        match self.script.lock().unwrap().connect.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn accept_connection(&mut self, endpoint: &str) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(TransportCall::AcceptConnection {
                endpoint: endpoint.to_owned(),
            });
        Ok(())
    }

    fn send_payload(&mut self, endpoint: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(TransportCall::SendPayload {
            endpoint: endpoint.to_owned(),
            bytes,
        });
        match self.script.lock().unwrap().send.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop_all_endpoints(&mut self) {
        self.calls
            .lock()
            .unwrap()
            .push(TransportCall::StopAllEndpoints);
    }
}

/// One engine under test, wired to a scripted transport.
pub struct TestNode {
    pub engine: EngineHandle,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub transport: mpsc::UnboundedSender<TransportEvent>,
    pub calls: Arc<Mutex<Vec<TransportCall>>>,
    pub script: Arc<Mutex<Script>>,
    pub auto_complete_stop: Arc<AtomicBool>,
}

/// Millisecond-scale timings so scenario tests finish quickly.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        discovery_start_delay_ms: 25,
        maintenance_interval_ms: 60,
        status_interval_ms: 80,
        reconnect_probe_delay_ms: 30,
        connect_retry_delay_ms: 40,
        transport_retry_delay_ms: 40,
        settle_delay_ms: 25,
        lost_window_ms: 150,
    }
}

pub fn spawn_node() -> TestNode {
    spawn_node_with(fast_timing())
}

pub fn spawn_node_with(timing: TimingConfig) -> TestNode {
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let script = Arc::new(Mutex::new(Script::default()));
    let auto_complete_stop = Arc::new(AtomicBool::new(true));
    let transport = ScriptedTransport {
        calls: calls.clone(),
        script: script.clone(),
        events: transport_tx.clone(),
        auto_complete_stop: auto_complete_stop.clone(),
    };
    let config = EngineConfig {
        service_id: flare_common::SERVICE_ID.to_string(),
        local_name: "test-node".to_string(),
        seen_capacity: 4096,
        timing,
    };
    let (engine, events) = engine::spawn(config, transport, transport_rx);
    TestNode {
        engine,
        events,
        transport: transport_tx,
        calls,
        script,
        auto_complete_stop,
    }
}

impl TestNode {
    pub fn endpoint_found(&self, endpoint: &str, name: &str) {
        let _ = self.transport.send(TransportEvent::EndpointFound {
            endpoint: endpoint.to_owned(),
            name: name.to_owned(),
            service_id: flare_common::SERVICE_ID.to_string(),
        });
    }

    pub fn endpoint_found_for_service(&self, endpoint: &str, service_id: &str) {
        let _ = self.transport.send(TransportEvent::EndpointFound {
            endpoint: endpoint.to_owned(),
            name: endpoint.to_owned(),
            service_id: service_id.to_owned(),
        });
    }

    pub fn connection_initiated(&self, endpoint: &str, name: &str) {
        let _ = self.transport.send(TransportEvent::ConnectionInitiated {
            endpoint: endpoint.to_owned(),
            name: name.to_owned(),
        });
    }

    pub fn connection_result(&self, endpoint: &str, success: bool) {
        let _ = self.transport.send(TransportEvent::ConnectionResult {
            endpoint: endpoint.to_owned(),
            success,
        });
    }

    pub fn disconnected(&self, endpoint: &str) {
        let _ = self.transport.send(TransportEvent::Disconnected {
            endpoint: endpoint.to_owned(),
        });
    }

    pub fn discovery_stopped(&self) {
        let _ = self.transport.send(TransportEvent::DiscoveryStopped);
    }

    pub fn payload_from(&self, endpoint: &str, bytes: Vec<u8>) {
        let _ = self.transport.send(TransportEvent::PayloadReceived {
            endpoint: endpoint.to_owned(),
            bytes,
        });
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn sends(&self) -> Vec<(String, Vec<u8>)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                TransportCall::SendPayload { endpoint, bytes } => {
                    Some((endpoint.clone(), bytes.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Waits until at least `n` recorded calls match `pred`.
    pub async fn wait_for_calls(&self, n: usize, pred: impl Fn(&TransportCall) -> bool) {
        let result = timeout(WAIT, async {
            loop {
                if self.count_calls(&pred) >= n {
                    return;
                }
                tokio::time::sleep(POLL).await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "timed out waiting for {n} matching transport calls; saw {:?}",
            self.calls()
        );
    }

    /// Next `AlertReceived` event, skipping statuses.
    pub async fn next_alert(&mut self) -> (String, String, i64, u32) {
        let result = timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Some(EngineEvent::AlertReceived {
                        id,
                        text,
                        timestamp,
                        ttl,
                    }) => return (id, text, timestamp, ttl),
                    Some(EngineEvent::Status { .. }) => {}
                    None => panic!("event channel closed while waiting for an alert"),
                }
            }
        })
        .await;
        result.expect("timed out waiting for an alert event")
    }

    /// Next status whose message contains `needle`, skipping other events.
    pub async fn wait_for_status_containing(&mut self, needle: &str) -> String {
        let result = timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Some(EngineEvent::Status { message }) if message.contains(needle) => {
                        return message;
                    }
                    Some(_) => {}
                    None => panic!("event channel closed while waiting for a status"),
                }
            }
        })
        .await;
        result.unwrap_or_else(|_| panic!("timed out waiting for a status containing {needle:?}"))
    }

    /// Asserts no `AlertReceived` event arrives within `dur`.
    pub async fn assert_no_alert(&mut self, dur: Duration) {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            match timeout(remaining, self.events.recv()).await {
                Ok(Some(EngineEvent::AlertReceived { id, .. })) => {
                    panic!("unexpected alert {id} emitted");
                }
                Ok(Some(EngineEvent::Status { .. })) => {}
                Ok(None) | Err(_) => return,
            }
        }
    }

    /// Discards every queued event.
    pub fn drain_events(&mut self) {
        while self.events.try_recv().is_ok() {}
    }

    /// Drives `endpoint` to the connected state and waits until the engine
    /// reports `expected_count` connected peers.
    pub async fn connect_peer(&mut self, endpoint: &str, expected_count: usize) {
        self.endpoint_found(endpoint, endpoint);
        self.wait_for_calls(1, |c| {
            matches!(c, TransportCall::RequestConnection { endpoint: e } if e == endpoint)
        })
        .await;
        self.connection_result(endpoint, true);
        self.wait_for_status_containing(&format!("Status: {expected_count} peers connected"))
            .await;
    }
}
