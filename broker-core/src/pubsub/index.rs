//! Radix subscription index (C1).
//!
//! Maps topic prefixes to ordered sets of subscribers and supports
//! segment-aware prefix-match queries (§4.1).
//!
//! Design (adapted from the sorted-prefix-table approach the subscription
//! index in the teacher crate uses for its `SubscriptionIndex`):
//! - Keep subscriptions in a `Vec` sorted lexicographically by topic.
//! - subscribe/unsubscribe: `O(log N)` search + `O(N)` insert/remove shift.
//! - `prefix_matches` hot path: forward scan with early-exit once the
//!   candidate topic is lexicographically greater than the query (it and
//!   everything after it can no longer be a byte-prefix of the query).
//! - Unlike the teacher's index, removal preserves subscriber order within
//!   a node (`Vec::remove`, not `swap_remove`): invariant 1 plus the
//!   "stable per-node subscriber sequences" design note require that
//!   subscribers observe publishes in the order they registered, which a
//!   swap-remove-based index would not guarantee after churn.

use crate::topic::Topic;
use hashbrown::HashMap;
use std::collections::BTreeSet;

struct Node<S> {
    topic: Topic,
    subscribers: Vec<S>,
}

/// A prefix-matching index from topics to subscribers.
///
/// `S` is the subscriber identity type: a local consumer handle or a
/// `PeerHandle`, depending on which side of the endpoint core is using it.
#[derive(Default)]
pub struct SubscriptionIndex<S> {
    nodes: Vec<Node<S>>,
    // Reverse index for `topics_of` / `erase`.
    by_subscriber: HashMap<S, BTreeSet<Topic>>,
}

impl<S> SubscriptionIndex<S>
where
    S: Clone + Eq + std::hash::Hash,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            by_subscriber: HashMap::new(),
        }
    }

    fn find(&self, topic: &Topic) -> Result<usize, usize> {
        self.nodes.binary_search_by(|n| n.topic.cmp(topic))
    }

    /// Registers `subscriber` for `topic`. Idempotent: re-registering the
    /// same pair is a no-op (boundary behavior: "re-subscribing the same
    /// pair is idempotent").
    pub fn register(&mut self, topic: Topic, subscriber: S) {
        match self.find(&topic) {
            Ok(idx) => {
                let node = &mut self.nodes[idx];
                if !node.subscribers.contains(&subscriber) {
                    node.subscribers.push(subscriber.clone());
                }
            }
            Err(idx) => {
                self.nodes.insert(
                    idx,
                    Node {
                        topic: topic.clone(),
                        subscribers: vec![subscriber.clone()],
                    },
                );
            }
        }
        self.by_subscriber
            .entry(subscriber)
            .or_default()
            .insert(topic);
    }

    /// Removes `subscriber` from `topic`. No-op if not registered.
    pub fn unregister(&mut self, topic: &Topic, subscriber: &S) {
        if let Ok(idx) = self.find(topic) {
            let node = &mut self.nodes[idx];
            if let Some(pos) = node.subscribers.iter().position(|s| s == subscriber) {
                node.subscribers.remove(pos);
            }
            if node.subscribers.is_empty() {
                self.nodes.remove(idx);
            }
        }
        if let Some(topics) = self.by_subscriber.get_mut(subscriber) {
            topics.remove(topic);
            if topics.is_empty() {
                self.by_subscriber.remove(subscriber);
            }
        }
    }

    /// Returns every subscriber registered at an ancestor of (or exactly
    /// at) `topic`, in the order each was first registered at its node,
    /// grouped node-by-node in topic order.
    #[must_use]
    pub fn prefix_matches(&self, topic: &Topic) -> Vec<S> {
        let mut out = Vec::new();
        for node in &self.nodes {
            if node.topic.as_bytes() > topic.as_bytes() {
                break;
            }
            if node.topic.is_segment_prefix_of(topic) {
                out.extend(node.subscribers.iter().cloned());
            }
        }
        out
    }

    /// Returns the first subscriber registered exactly at `topic`, if any.
    #[must_use]
    pub fn exact_match(&self, topic: &Topic) -> Option<S> {
        self.find(topic)
            .ok()
            .and_then(|idx| self.nodes[idx].subscribers.first().cloned())
    }

    /// True iff some subscriber is registered exactly at `topic`.
    #[must_use]
    pub fn have_subscriber_for(&self, topic: &Topic) -> bool {
        self.find(topic)
            .map(|idx| !self.nodes[idx].subscribers.is_empty())
            .unwrap_or(false)
    }

    /// All topics with at least one subscriber, lexicographic order.
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.nodes.iter().map(|n| n.topic.clone()).collect()
    }

    /// All topics `subscriber` is currently registered for.
    #[must_use]
    pub fn topics_of(&self, subscriber: &S) -> BTreeSet<Topic> {
        self.by_subscriber
            .get(subscriber)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes `subscriber` from every topic. Returns the set of topics it
    /// was removed from, or `None` if it had no subscriptions.
    pub fn erase(&mut self, subscriber: &S) -> Option<BTreeSet<Topic>> {
        let topics = self.by_subscriber.remove(subscriber)?;
        for topic in &topics {
            if let Ok(idx) = self.find(topic) {
                let node = &mut self.nodes[idx];
                if let Some(pos) = node.subscribers.iter().position(|s| s == subscriber) {
                    node.subscribers.remove(pos);
                }
                if node.subscribers.is_empty() {
                    self.nodes.remove(idx);
                }
            }
        }
        Some(topics)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
