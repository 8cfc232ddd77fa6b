//! Shared types and wire codec for the FLARE alert mesh.
//!
//! This crate provides:
//! - The [`Alert`] record and its single-line JSON wire codec ([`alert`])
//! - Protocol constants and the endpoint identifier alias ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alert;
pub mod types;

pub use alert::{Alert, DecodeError};
pub use types::{EndpointId, INITIAL_TTL, SERVICE_ID};
