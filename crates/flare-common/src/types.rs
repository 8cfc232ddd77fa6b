//! Core type definitions and protocol constants for the FLARE mesh.

/// Opaque transport-assigned identifier of a nearby peer.
///
/// Endpoint ids are compared by equality only; nothing may be inferred
/// from their contents.
pub type EndpointId = String;

/// Service identity advertised and scanned for during discovery.
/// Bump this on breaking wire-format changes.
pub const SERVICE_ID: &str = "flare.alert.v1";

/// Hop budget assigned to a freshly originated alert.
pub const INITIAL_TTL: u32 = 8;

/// Upper bound on alert text length enforced at origination.
/// The codec itself tolerates longer texts arriving off the wire.
pub const MAX_ALERT_TEXT: usize = 500;
