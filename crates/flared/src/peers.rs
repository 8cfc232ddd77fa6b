//! Peer table: the engine's authoritative view of nearby endpoints.

use flare_common::EndpointId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lifecycle state of a single endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Seen in discovery; a connection request is about to be issued.
    Discovered,
    /// Connection requested or initiated, awaiting the result.
    Connecting,
    /// Link established and usable for sends.
    Connected,
    /// Previously connected and now gone; eligible for reconnection until
    /// the lost window expires.
    Lost {
        /// When the peer was first marked lost.
        since: Instant,
    },
}

/// In-memory table of every endpoint the engine currently tracks.
///
/// Each endpoint has exactly one state, so a peer can never be both
/// connected and lost.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<EndpointId, PeerState>,
}

impl PeerTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for `endpoint`, if tracked.
    #[must_use]
    pub fn state(&self, endpoint: &str) -> Option<PeerState> {
        self.peers.get(endpoint).copied()
    }

    /// Tracks `endpoint` as freshly discovered.
    pub fn set_discovered(&mut self, endpoint: &str) {
        self.peers
            .insert(endpoint.to_owned(), PeerState::Discovered);
    }

    /// Marks `endpoint` as awaiting a connection result.
    pub fn set_connecting(&mut self, endpoint: &str) {
        self.peers
            .insert(endpoint.to_owned(), PeerState::Connecting);
    }

    /// Marks `endpoint` connected, clearing any lost entry for it.
    pub fn mark_connected(&mut self, endpoint: &str) {
        self.peers.insert(endpoint.to_owned(), PeerState::Connected);
    }

    /// Marks `endpoint` lost as of `now`.
    ///
    /// An existing lost timestamp is preserved so a peer that keeps failing
    /// to reconnect still ages out of the table.
    pub fn mark_lost(&mut self, endpoint: &str, now: Instant) {
        if let Some(PeerState::Lost { .. }) = self.peers.get(endpoint) {
            return;
        }
        self.peers
            .insert(endpoint.to_owned(), PeerState::Lost { since: now });
    }

    /// Forgets `endpoint` entirely.
    pub fn remove(&mut self, endpoint: &str) {
        self.peers.remove(endpoint);
    }

    /// Forgets every tracked endpoint.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Returns `true` if `endpoint` is currently connected.
    #[must_use]
    pub fn is_connected(&self, endpoint: &str) -> bool {
        matches!(self.peers.get(endpoint), Some(PeerState::Connected))
    }

    /// Endpoints currently usable for sends, in a stable order.
    #[must_use]
    pub fn connected(&self) -> Vec<EndpointId> {
        let mut out: Vec<EndpointId> = self
            .peers
            .iter()
            .filter(|(_, state)| matches!(state, PeerState::Connected))
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        out.sort();
        out
    }

    /// Number of currently connected endpoints.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|state| matches!(state, PeerState::Connected))
            .count()
    }

    /// Returns `true` if any endpoint is in the lost state.
    #[must_use]
    pub fn has_lost(&self) -> bool {
        self.peers
            .values()
            .any(|state| matches!(state, PeerState::Lost { .. }))
    }

    /// When `endpoint` was lost, if it is in the lost state.
    #[must_use]
    pub fn lost_since(&self, endpoint: &str) -> Option<Instant> {
        match self.peers.get(endpoint) {
            Some(PeerState::Lost { since }) => Some(*since),
            _ => None,
        }
    }

    /// Drops lost entries older than `window`, returning the evicted ids.
    pub fn evict_lost(&mut self, window: Duration, now: Instant) -> Vec<EndpointId> {
        let expired: Vec<EndpointId> = self
            .peers
            .iter()
            .filter_map(|(endpoint, state)| match state {
                PeerState::Lost { since } if now.duration_since(*since) > window => {
                    Some(endpoint.clone())
                }
                _ => None,
            })
            .collect();
        for endpoint in &expired {
            self.peers.remove(endpoint);
        }
        expired
    }
}
