//! Peer table (C2).
//!
//! Tracks every remote endpoint whose transport is currently established:
//! its opaque handle, the display name it announced at handshake, whether
//! the connection was inbound or outbound, and the topics it has advertised
//! to us (§4.2, invariant 3 and 4).
//!
//! Handles are small integer ids into an arena (design note 9: "Represent
//! handles as integer ids into an arena to avoid back-reference cycles"),
//! the same trick the teacher crate's hub types use for `PeerKey` so that
//! the routing table can reference a peer without owning it — the
//! connection proxy (C5, in `broker-net`) is the sole owner of the
//! underlying transport.

use crate::error::BrokerError;
use crate::topic::Topic;
use hashbrown::HashMap;
use std::collections::BTreeSet;

/// Opaque, stable handle for a connected remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerHandle(u64);

impl PeerHandle {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Test/internal helper: construct a handle directly from a raw id.
    /// Production code always obtains handles from `PeerTable::allocate`.
    #[cfg(test)]
    pub(crate) const fn from_u64(v: u64) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// A connected peer's state (§3, Peer record).
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub handle: PeerHandle,
    pub display_name: String,
    /// True if the remote dialed us; false if we dialed them.
    pub incoming: bool,
    /// Topics the peer has subscribed to and not withdrawn.
    pub advertised_topics: BTreeSet<Topic>,
    /// Incremented on every successful handshake for this handle; used to
    /// resolve "which session is newer" when a peer reconnects before we
    /// noticed the old session drop.
    pub generation: u64,
}

/// The set of currently-established peers, indexed by handle.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<PeerHandle, PeerRecord>,
    next_handle: u64,
}

impl PeerTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            next_handle: 1, // reserve 0 as "no handle"
        }
    }

    /// Mint a fresh handle from the arena. Used when originating a brand
    /// new peer slot (first connection attempt to an address); reconnects
    /// to an already-known address reuse the existing handle.
    pub fn allocate(&mut self) -> PeerHandle {
        let h = PeerHandle(self.next_handle);
        self.next_handle += 1;
        h
    }

    /// Installs `record`, replacing any existing entry for the same handle
    /// only if `record.generation` is strictly newer (§4.2: "Add replaces
    /// an existing record only when the new handshake supersedes").
    ///
    /// Returns `true` if the record was installed.
    pub fn add(&mut self, record: PeerRecord) -> bool {
        match self.peers.get(&record.handle) {
            Some(existing) if existing.generation >= record.generation => false,
            _ => {
                self.peers.insert(record.handle, record);
                true
            }
        }
    }

    /// Removes the peer with the given handle.
    ///
    /// # Errors
    /// Returns `BrokerError::PeerInvalid` if no such peer exists.
    pub fn remove(&mut self, handle: PeerHandle) -> Result<PeerRecord, BrokerError> {
        self.peers
            .remove(&handle)
            .ok_or_else(|| BrokerError::PeerInvalid(handle.to_string()))
    }

    #[must_use]
    pub fn find(&self, handle: PeerHandle) -> Option<&PeerRecord> {
        self.peers.get(&handle)
    }

    pub fn find_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&handle)
    }

    #[must_use]
    pub fn contains(&self, handle: PeerHandle) -> bool {
        self.peers.contains_key(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Every handle except `excluding` — the common "fan out to all peers
    /// but the sender" shape used throughout C4.
    pub fn handles_excluding(&self, excluding: PeerHandle) -> impl Iterator<Item = PeerHandle> + '_ {
        self.peers.keys().copied().filter(move |h| *h != excluding)
    }

    pub fn all_handles(&self) -> impl Iterator<Item = PeerHandle> + '_ {
        self.peers.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Records that `handle` advertised `topic` (invariant 4).
    pub fn mark_advertised(&mut self, handle: PeerHandle, topic: Topic) {
        if let Some(p) = self.peers.get_mut(&handle) {
            p.advertised_topics.insert(topic);
        }
    }

    /// Records that `handle` withdrew `topic`.
    pub fn mark_withdrawn(&mut self, handle: PeerHandle, topic: &Topic) {
        if let Some(p) = self.peers.get_mut(&handle) {
            p.advertised_topics.remove(topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(handle: PeerHandle, generation: u64) -> PeerRecord {
        PeerRecord {
            handle,
            display_name: "venus".into(),
            incoming: false,
            advertised_topics: BTreeSet::new(),
            generation,
        }
    }

    #[test]
    fn add_only_supersedes_with_newer_generation() {
        let mut table = PeerTable::new();
        let h = table.allocate();
        assert!(table.add(record(h, 1)));
        assert!(!table.add(record(h, 1)));
        assert!(!table.add(record(h, 0)));
        assert!(table.add(record(h, 2)));
    }

    #[test]
    fn removing_absent_peer_is_invalid() {
        let mut table = PeerTable::new();
        let h = table.allocate();
        assert!(matches!(table.remove(h), Err(BrokerError::PeerInvalid(_))));
    }

    #[test]
    fn handles_excluding_omits_sender() {
        let mut table = PeerTable::new();
        let a = table.allocate();
        let b = table.allocate();
        table.add(record(a, 1));
        table.add(record(b, 1));
        let remaining: BTreeSet<_> = table.handles_excluding(a).collect();
        assert_eq!(remaining, BTreeSet::from([b]));
    }
}
