//! Transport adapter seam between the relay engine and the radio layer.
//!
//! Operations are non-blocking: long-running work happens on the
//! transport's own tasks and completes through [`TransportEvent`]s
//! delivered on the channel handed to the transport at construction.

use flare_common::EndpointId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Asynchronous callback delivered by a transport to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A nearby endpoint advertising `service_id` was discovered.
    EndpointFound {
        /// Transport-assigned endpoint identifier.
        endpoint: EndpointId,
        /// Display name the peer advertises.
        name: String,
        /// Service the peer advertises under.
        service_id: String,
    },
    /// A previously discovered endpoint is no longer visible.
    EndpointLost {
        /// The vanished endpoint.
        endpoint: EndpointId,
    },
    /// A connection with `endpoint` has been initiated (by either side)
    /// and awaits local acceptance.
    ConnectionInitiated {
        /// The endpoint the connection is with.
        endpoint: EndpointId,
        /// Display name of the remote peer.
        name: String,
    },
    /// Final outcome of a connection attempt.
    ConnectionResult {
        /// The endpoint the attempt was for.
        endpoint: EndpointId,
        /// Whether the link is established.
        success: bool,
    },
    /// An established link was torn down.
    Disconnected {
        /// The endpoint whose link dropped.
        endpoint: EndpointId,
    },
    /// A payload arrived from a connected endpoint.
    PayloadReceived {
        /// The sending endpoint.
        endpoint: EndpointId,
        /// Raw payload bytes.
        bytes: Vec<u8>,
    },
    /// A previously requested discovery stop has completed.
    DiscoveryStopped,
}

/// Errors surfaced by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Discovery is already running; the caller's state is stale.
    #[error("discovery already running")]
    AlreadyDiscovering,
    /// Advertising is already running; the caller's state is stale.
    #[error("advertising already running")]
    AlreadyAdvertising,
    /// The endpoint is not known to the transport.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(EndpointId),
    /// The endpoint has no established link.
    #[error("endpoint not connected: {0}")]
    NotConnected(EndpointId),
    /// The underlying radio feature is unavailable on this device.
    #[error("radio unavailable: {0}")]
    Unsupported(String),
    /// Transient I/O failure; the operation may be retried.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this failure is terminal for the engine.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// Channel used by a transport to deliver events to the engine.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Point-to-point radio transport as seen by the relay engine.
pub trait Transport: Send + 'static {
    /// Makes this node discoverable under `service_id` as `local_name`.
    fn start_advertising(
        &mut self,
        service_id: &str,
        local_name: &str,
    ) -> Result<(), TransportError>;

    /// Stops advertising. No-op when not advertising.
    fn stop_advertising(&mut self);

    /// Starts scanning for peers advertising `service_id`.
    fn start_discovery(&mut self, service_id: &str) -> Result<(), TransportError>;

    /// Requests discovery to stop. Completion is signalled asynchronously
    /// with [`TransportEvent::DiscoveryStopped`].
    fn stop_discovery(&mut self);

    /// Dials a discovered endpoint, identifying ourselves as `local_name`.
    fn request_connection(&mut self, local_name: &str, endpoint: &str)
        -> Result<(), TransportError>;

    /// Accepts a connection previously surfaced via
    /// [`TransportEvent::ConnectionInitiated`].
    fn accept_connection(&mut self, endpoint: &str) -> Result<(), TransportError>;

    /// Queues `bytes` for delivery to a connected endpoint.
    fn send_payload(&mut self, endpoint: &str, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Tears down every established link.
    fn stop_all_endpoints(&mut self);
}
