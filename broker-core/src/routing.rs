//! Routing table (C3).
//!
//! For every subscription id `(topic, origin)` known anywhere in the
//! overlay, tracks which immediate neighbors advertised it and at what
//! hop distance (TTL), and picks the single neighbor — the *forwarder* —
//! publishes should take to reach that subscription (§4.3).

use crate::peer::PeerHandle;
use crate::pubsub::index::SubscriptionIndex;
use crate::topic::Topic;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type Ttl = u16;

/// Endpoint-unique identifier of the endpoint that owns a subscription
/// (GLOSSARY: "Subscription id"). A random 128-bit value minted once per
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OriginId(u128);

impl OriginId {
    #[must_use]
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(u128::from_le_bytes(bytes))
    }

    #[must_use]
    pub const fn from_u128(v: u128) -> Self {
        Self(v)
    }

    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0
    }
}

impl std::fmt::Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// `(topic, origin)` — uniquely identifies one subscription across the
/// overlay (§3).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId {
    pub topic: Topic,
    pub origin: OriginId,
}

impl SubscriptionId {
    #[must_use]
    pub const fn new(topic: Topic, origin: OriginId) -> Self {
        Self { topic, origin }
    }
}

/// What happened as a result of `RoutingTable::register`.
///
/// Neither variant carries a broadcast target list: the routing table only
/// knows which peers advertise a given subscription id, not the full set
/// of currently-connected peers, so the caller (C4, which also owns C2)
/// computes "every other known peer" itself when it needs to re-advertise
/// or propagate an unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// This subscription id was unknown before; re-advertise it (at
    /// `ttl + 1`) to every other known peer (§4.3, step 2).
    New,
    /// The subscription id was already known and its forwarder changed.
    ForwarderChanged { from: Option<PeerHandle>, to: PeerHandle },
    /// The subscription id was already known and nothing changed.
    Unchanged,
}

/// What happened as a result of `RoutingTable::unregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterOutcome {
    /// The last peer advertising this subscription id was just removed;
    /// broadcast `unsubscribe` to every other known peer.
    Drained,
    ForwarderChanged { from: Option<PeerHandle>, to: PeerHandle },
    Unchanged,
}

#[derive(Default)]
struct Entry {
    peer_ttls: HashMap<PeerHandle, Ttl>,
    forwarder: Option<PeerHandle>,
}

/// The routing table: every subscription id known to this endpoint, who
/// advertises it, and which neighbor is the chosen next hop.
#[derive(Default)]
pub struct RoutingTable {
    entries: HashMap<SubscriptionId, Entry>,
    /// Topics this endpoint itself originates subscriptions for, all at
    /// TTL 0 (§4.4.3: "Insert `(t,self)` at TTL 0 into C3's origin-self
    /// table"). Kept separate from `entries` because there is no via-peer
    /// and no forwarder for a subscription this endpoint itself owns.
    self_origin_topics: HashSet<Topic>,
    /// Topic -> forwarders currently serving some subscription id at that
    /// exact topic. Used to answer "which peers should see a publish to
    /// topic t" without scanning every subscription id (§4.4.2).
    peer_index: SubscriptionIndex<PeerHandle>,
    /// Reference count of how many subscription ids at a given topic
    /// currently have a given peer as forwarder; drives `peer_index`
    /// membership.
    forwarder_refs: HashMap<(Topic, PeerHandle), u32>,
}

impl RoutingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_forwarder_ref(&mut self, topic: &Topic, peer: PeerHandle) {
        let count = self
            .forwarder_refs
            .entry((topic.clone(), peer))
            .or_insert(0);
        *count += 1;
        if *count == 1 {
            self.peer_index.register(topic.clone(), peer);
        }
    }

    fn drop_forwarder_ref(&mut self, topic: &Topic, peer: PeerHandle) {
        if let Some(count) = self.forwarder_refs.get_mut(&(topic.clone(), peer)) {
            *count -= 1;
            if *count == 0 {
                self.forwarder_refs.remove(&(topic.clone(), peer));
                self.peer_index.unregister(topic, &peer);
            }
        }
    }

    /// Picks the forwarder for `peer_ttls` per the tie-break rule fixed by
    /// this spec's Open Question (a): keep the current forwarder if it is
    /// among the minimum-TTL peers, otherwise take the smallest handle
    /// among them.
    fn pick_forwarder(peer_ttls: &HashMap<PeerHandle, Ttl>, current: Option<PeerHandle>) -> Option<PeerHandle> {
        let min_ttl = *peer_ttls.values().min()?;
        let candidates: Vec<PeerHandle> = peer_ttls
            .iter()
            .filter(|(_, &ttl)| ttl == min_ttl)
            .map(|(&p, _)| p)
            .collect();
        if let Some(cur) = current {
            if candidates.contains(&cur) {
                return Some(cur);
            }
        }
        candidates.into_iter().min()
    }

    /// A local subscriber attaches to `topic` (§4.4.3). Returns `true` if
    /// this topic was not already self-originated (i.e. the caller should
    /// advertise it per the auto-advertise/ACL policy).
    pub fn register_local(&mut self, topic: Topic) -> bool {
        self.self_origin_topics.insert(topic)
    }

    /// A local subscriber for `topic` fully detaches. Returns `true` if a
    /// self-origin subscription was actually withdrawn.
    pub fn unregister_local(&mut self, topic: &Topic) -> bool {
        self.self_origin_topics.remove(topic)
    }

    #[must_use]
    pub fn is_self_origin(&self, topic: &Topic) -> bool {
        self.self_origin_topics.contains(topic)
    }

    /// Every self-originated topic, at TTL 0 (§4.4.3: "Insert `(t,self)` at
    /// TTL 0"). The caller pairs each with its own `OriginId` — the routing
    /// table has no notion of "this endpoint's origin", only of which
    /// topics it locally originates.
    pub fn self_origin_topics(&self) -> impl Iterator<Item = &Topic> {
        self.self_origin_topics.iter()
    }

    /// Every subscription id known through a remote peer, at the TTL this
    /// endpoint would advertise it onward (`stored + 1`), skipping entries
    /// whose only forwarder is `exclude` (split horizon: no point telling a
    /// peer about a route that only exists through that same peer). Used to
    /// build the routing snapshot a handshake hello carries (§4.4.1).
    pub fn remote_routes(&self, exclude: Option<PeerHandle>) -> Vec<(Topic, OriginId, Ttl)> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .peer_ttls
                    .keys()
                    .any(|peer| Some(*peer) != exclude)
            })
            .map(|(sub_id, entry)| {
                let min_ttl = entry
                    .peer_ttls
                    .iter()
                    .filter(|(peer, _)| Some(**peer) != exclude)
                    .map(|(_, ttl)| *ttl)
                    .min()
                    .unwrap_or(0);
                (sub_id.topic.clone(), sub_id.origin, min_ttl.saturating_add(1))
            })
            .collect()
    }

    /// Registers that `via_peer` advertises `sub_id` at hop distance `ttl`
    /// (§4.3, `register`).
    pub fn register(&mut self, sub_id: SubscriptionId, via_peer: PeerHandle, ttl: Ttl) -> RegisterOutcome {
        let is_new = !self.entries.contains_key(&sub_id);
        let entry = self.entries.entry(sub_id.clone()).or_default();
        entry.peer_ttls.insert(via_peer, ttl);

        if is_new {
            entry.forwarder = Some(via_peer);
            self.bump_forwarder_ref(&sub_id.topic, via_peer);
            RegisterOutcome::New
        } else {
            let old_forwarder = entry.forwarder;
            let new_forwarder = Self::pick_forwarder(&entry.peer_ttls, old_forwarder);
            if new_forwarder != old_forwarder {
                entry.forwarder = new_forwarder;
                if let Some(old) = old_forwarder {
                    self.drop_forwarder_ref(&sub_id.topic, old);
                }
                if let Some(new) = new_forwarder {
                    self.bump_forwarder_ref(&sub_id.topic, new);
                }
                RegisterOutcome::ForwarderChanged {
                    from: old_forwarder,
                    to: new_forwarder.expect("forwarder exists once any peer entry exists"),
                }
            } else {
                RegisterOutcome::Unchanged
            }
        }
    }

    /// Withdraws `via_peer`'s advertisement of `sub_id`. When `remove` is
    /// `true` the peer's entry is erased outright (peer explicitly
    /// unsubscribed, or dropped); when `false` only the forwarder is
    /// recomputed (used when swapping forwarder on a TTL change without a
    /// membership change) (§4.3, `unregister`).
    pub fn unregister(&mut self, sub_id: &SubscriptionId, via_peer: PeerHandle, remove: bool) -> UnregisterOutcome {
        let Some(entry) = self.entries.get_mut(sub_id) else {
            return UnregisterOutcome::Unchanged;
        };

        if remove {
            entry.peer_ttls.remove(&via_peer);
        }

        if entry.peer_ttls.is_empty() {
            let old_forwarder = entry.forwarder;
            if let Some(old) = old_forwarder {
                self.drop_forwarder_ref(&sub_id.topic, old);
            }
            self.entries.remove(sub_id);
            return UnregisterOutcome::Drained;
        }

        let old_forwarder = entry.forwarder;
        let new_forwarder = Self::pick_forwarder(&entry.peer_ttls, old_forwarder);
        if new_forwarder != old_forwarder {
            entry.forwarder = new_forwarder;
            if let Some(old) = old_forwarder {
                self.drop_forwarder_ref(&sub_id.topic, old);
            }
            if let Some(new) = new_forwarder {
                self.bump_forwarder_ref(&sub_id.topic, new);
            }
            UnregisterOutcome::ForwarderChanged {
                from: old_forwarder,
                to: new_forwarder.expect("forwarder exists: peer_ttls non-empty"),
            }
        } else {
            UnregisterOutcome::Unchanged
        }
    }

    /// A peer's transport dropped: tears down every subscription id it
    /// advertised. Returns the `(sub_id, outcome)` pairs so the caller can
    /// broadcast the resulting `unsubscribe`s.
    pub fn peer_drop(&mut self, peer: PeerHandle) -> Vec<(SubscriptionId, UnregisterOutcome)> {
        let affected: Vec<SubscriptionId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.peer_ttls.contains_key(&peer))
            .map(|(id, _)| id.clone())
            .collect();

        affected
            .into_iter()
            .map(|id| {
                let outcome = self.unregister(&id, peer, true);
                (id, outcome)
            })
            .collect()
    }

    #[must_use]
    pub fn best_forwarder(&self, sub_id: &SubscriptionId) -> Option<PeerHandle> {
        self.entries.get(sub_id).and_then(|e| e.forwarder)
    }

    #[must_use]
    pub fn contains(&self, sub_id: &SubscriptionId) -> bool {
        self.entries.contains_key(sub_id)
    }

    #[must_use]
    pub fn ttl_for(&self, sub_id: &SubscriptionId) -> Option<Ttl> {
        let entry = self.entries.get(sub_id)?;
        let fwd = entry.forwarder?;
        entry.peer_ttls.get(&fwd).copied()
    }

    /// For a publish to `topic`, the deduplicated set of forwarders
    /// covering every subscription id whose topic prefix-matches `topic`
    /// (§4.4.2).
    #[must_use]
    pub fn forwarders_for_publish(&self, topic: &Topic) -> Vec<PeerHandle> {
        self.peer_index.prefix_matches(topic)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.self_origin_topics.is_empty()
    }
}
