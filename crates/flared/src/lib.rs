//! FLARE mesh node daemon — offline peer-to-peer emergency alert relay.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI parsing and layered TOML configuration.
pub mod config;
/// Mesh relay engine, event bus, and host-facing handle.
pub mod engine;
/// LAN transport: multicast discovery beacons and TCP peer links.
pub mod lan;
/// Line-delimited JSON API over local TCP.
pub mod local_api;
/// Peer table and per-endpoint connection state.
pub mod peers;
/// Bounded duplicate-suppression set for alert ids.
pub mod seen;
/// Transport adapter trait and callback events.
pub mod transport;
