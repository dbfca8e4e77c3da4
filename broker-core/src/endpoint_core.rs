//! Endpoint core (C4).
//!
//! Owns C1 (local subscription index), C2 (peer table) and C3 (routing
//! table) exclusively; the single-threaded loop that drives this struct is
//! the only mutator of any of them (§4.4, §5). Following design note
//! "Actor/behavior replacement": this is a plain state-owning object whose
//! sole mutator is `handle`, dispatched from the facade crate's loop —
//! there is no actor framework underneath.

use crate::data::Data;
use crate::error::BrokerError;
use crate::message::{Message, PublishFlags};
use crate::peer::{PeerHandle, PeerRecord, PeerTable};
use crate::pubsub::index::SubscriptionIndex;
use crate::routing::{OriginId, RegisterOutcome, RoutingTable, SubscriptionId, Ttl, UnregisterOutcome};
use crate::status::{StatusBus, StatusEvent, StatusObserver};
use crate::store::{CommandRoute, StoreCommand, StoreCoordinator, StoreEvent, StoreId};
use crate::topic::Topic;
use hashbrown::HashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Opaque handle for a local subscriber attached via `EndpointCore::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Delivers a published `(topic, payload)` pair to one local subscriber.
/// Implemented by the facade crate's subscriber handle; kept as a trait
/// here so the transport-agnostic core never depends on the channel type
/// the facade chooses.
pub trait SubscriberSink: Send + Sync {
    fn deliver(&self, topic: &Topic, payload: &Data);
}

/// Hands an already-built `Message` off toward the network for one peer.
/// Implemented by `broker-net`'s connection proxy (C5); `try_send`
/// returning `false` means the transport's own queue declined the send.
pub trait PeerSink: Send + Sync {
    fn try_send(&self, msg: &Message) -> bool;
}

struct Outbound {
    sink: Arc<dyn PeerSink>,
    backlog: VecDeque<Message>,
}

/// Endpoint-wide configuration for the ACL/auto-mode switches of §4.4.4,
/// plus the per-peer outbound queue depth referenced in §5.
pub struct EndpointPolicy {
    pub auto_publish: bool,
    pub auto_advertise: bool,
    pub outbound_queue_depth: usize,
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self {
            auto_publish: true,
            auto_advertise: true,
            outbound_queue_depth: 1024,
        }
    }
}

/// The central object: owns C1/C2/C3, hosts C6 and C7, and applies every
/// handshake/publish/subscribe/ACL rule in §4.4.
pub struct EndpointCore {
    origin: OriginId,
    local_index: SubscriptionIndex<SubscriberId>,
    local_sinks: HashMap<SubscriberId, Arc<dyn SubscriberSink>>,
    next_subscriber: u64,
    peers: PeerTable,
    routing: RoutingTable,
    outbound: HashMap<PeerHandle, Outbound>,
    status: StatusBus,
    stores: StoreCoordinator,
    policy: EndpointPolicy,
    pub_acls: HashSet<Topic>,
    advert_acls: HashSet<Topic>,
}

impl EndpointCore {
    #[must_use]
    pub fn new(policy: EndpointPolicy) -> Self {
        Self {
            origin: OriginId::random(),
            local_index: SubscriptionIndex::new(),
            local_sinks: HashMap::new(),
            next_subscriber: 1,
            peers: PeerTable::new(),
            routing: RoutingTable::new(),
            outbound: HashMap::new(),
            status: StatusBus::new(),
            stores: StoreCoordinator::new(),
            policy,
            pub_acls: HashSet::new(),
            advert_acls: HashSet::new(),
        }
    }

    #[must_use]
    pub const fn origin(&self) -> OriginId {
        self.origin
    }

    pub fn observe_status(&mut self) -> StatusObserver {
        self.status.subscribe()
    }

    #[must_use]
    pub fn stores(&self) -> &StoreCoordinator {
        &self.stores
    }

    /// Builds the routing snapshot a new handshake's `PeerHello` should
    /// carry (§4.4.1, step 2): every topic this endpoint locally
    /// originates, at TTL 0, plus every subscription id known through
    /// another peer, at the TTL this endpoint would re-advertise it.
    /// `exclude` skips routes only reachable through the peer being
    /// handshaken with (split horizon).
    #[must_use]
    pub fn routing_snapshot(&self, exclude: Option<PeerHandle>) -> Vec<(Topic, OriginId, Ttl)> {
        let mut routes = self.routing.remote_routes(exclude);
        routes.extend(
            self.routing
                .self_origin_topics()
                .map(|topic| (topic.clone(), self.origin, 0)),
        );
        routes
    }

    /// Every topic this endpoint itself has a live local subscriber for
    /// (§6, `PEER_HELLO.advertised`; distinct from `routing_snapshot`, which
    /// also carries routes learned from other peers).
    #[must_use]
    pub fn local_advertised_topics(&self) -> Vec<Topic> {
        self.routing.self_origin_topics().cloned().collect()
    }

    fn broadcast_except(&mut self, msg: Message, except: Option<PeerHandle>) {
        let targets: Vec<PeerHandle> = match except {
            Some(p) => self.peers.handles_excluding(p).collect(),
            None => self.peers.all_handles().collect(),
        };
        for peer in targets {
            self.send_to_peer(peer, msg.clone());
        }
    }

    fn send_to_peer(&mut self, peer: PeerHandle, msg: Message) {
        let Some(ob) = self.outbound.get_mut(&peer) else {
            return;
        };
        while let Some(queued) = ob.backlog.pop_front() {
            if ob.sink.try_send(&queued) {
                continue;
            }
            ob.backlog.push_front(queued);
            break;
        }
        if ob.backlog.is_empty() && ob.sink.try_send(&msg) {
            return;
        }
        ob.backlog.push_back(msg);
        if ob.backlog.len() > self.policy.outbound_queue_depth {
            ob.backlog.pop_front();
            self.status.emit(StatusEvent::PeerUnavailable {
                peer: Some(peer),
                network_addr: None,
                message: "outbound queue overflow, dropped oldest message".into(),
            });
        }
    }

    // ---- §4.4.1 Handshake -------------------------------------------------

    /// Installs a freshly-handshaken peer and applies the routing snapshot
    /// it announced (§4.4.1, steps 2-3). `handle` must already have been
    /// allocated by the caller (the connection proxy, via `PeerTable` access
    /// it is not given — the facade mediates handle allocation through
    /// `allocate_peer_handle`).
    #[allow(clippy::too_many_arguments)]
    pub fn apply_handshake(
        &mut self,
        handle: PeerHandle,
        display_name: String,
        incoming: bool,
        generation: u64,
        network_addr: Option<String>,
        advertised: Vec<Topic>,
        routes: Vec<(Topic, OriginId, Ttl)>,
        sink: Arc<dyn PeerSink>,
    ) {
        let record = PeerRecord {
            handle,
            display_name: display_name.clone(),
            incoming,
            advertised_topics: advertised.iter().cloned().collect(),
            generation,
        };
        if !self.peers.add(record) {
            return;
        }
        self.outbound.insert(
            handle,
            Outbound {
                sink,
                backlog: VecDeque::new(),
            },
        );

        for (topic, origin, ttl) in routes {
            if origin == self.origin {
                continue; // invariant 5: never route a sub_id back to its origin
            }
            self.register_remote_subscription(topic, origin, handle, ttl);
        }

        self.status.emit(StatusEvent::PeerAdded {
            peer: handle,
            network_addr,
            message: format!("handshake with {display_name} complete"),
        });
    }

    /// Mints the next peer handle. Exposed so the connection proxy (which
    /// does not otherwise touch C2) can obtain a stable handle before the
    /// handshake completes.
    pub fn allocate_peer_handle(&mut self) -> PeerHandle {
        self.peers.allocate()
    }

    /// A peer's transport dropped unexpectedly.
    pub fn peer_lost(&mut self, handle: PeerHandle, message: impl Into<String>) {
        self.teardown_peer(handle, StatusEvent::PeerLost {
            peer: handle,
            message: message.into(),
        });
    }

    /// A dial or handshake attempt failed before any session was
    /// established — including a `version_incompatible` rejection — and
    /// there is no peer record to tear down (§7: "asynchronous conditions
    /// [...] are delivered exclusively via the status/error bus"; §6 lists
    /// `peer_unavailable` as the event kind for this case).
    pub fn report_dial_failure(&mut self, handle: Option<PeerHandle>, network_addr: Option<String>, message: impl Into<String>) {
        self.status.emit(StatusEvent::PeerUnavailable {
            peer: handle,
            network_addr,
            message: message.into(),
        });
    }

    /// `unpeer`: a cooperative, locally-initiated disconnect (§5,
    /// "Cancellation").
    ///
    /// # Errors
    /// Returns `BrokerError::PeerInvalid` if `handle` is not currently
    /// known, matching the boundary behavior "unpeering an unknown address
    /// emits exactly one `peer_invalid`".
    pub fn unpeer(&mut self, handle: PeerHandle) -> Result<(), BrokerError> {
        if !self.peers.contains(handle) {
            self.status.emit(StatusEvent::PeerInvalid {
                peer: Some(handle),
                network_addr: None,
                message: "unpeer on unknown peer".into(),
            });
            return Err(BrokerError::PeerInvalid(handle.to_string()));
        }
        self.teardown_peer(handle, StatusEvent::PeerRemoved {
            peer: handle,
            message: "unpeer requested".into(),
        });
        Ok(())
    }

    fn teardown_peer(&mut self, handle: PeerHandle, event: StatusEvent) {
        let dropped = self.routing.peer_drop(handle);
        let _ = self.peers.remove(handle);
        self.outbound.remove(&handle);
        self.status.emit(event);

        for (sub_id, outcome) in dropped {
            if matches!(outcome, UnregisterOutcome::Drained) {
                self.broadcast_except(
                    Message::Unsubscribe { topic: sub_id.topic, origin: sub_id.origin },
                    Some(handle),
                );
            }
        }
    }

    // ---- §4.4.2 Publish handling ------------------------------------------

    /// Handles one publish, whether it originated locally (`from_peer =
    /// None`) or arrived from a peer.
    pub fn publish(&mut self, topic: Topic, payload: Data, flags: PublishFlags, from_peer: Option<PeerHandle>) {
        if from_peer.is_some() {
            self.maybe_apply_store_event(&topic, &payload);
        }

        let local_wants_it = from_peer.is_some() || flags.contains(PublishFlags::SELF);
        if local_wants_it {
            for subscriber in self.local_index.prefix_matches(&topic) {
                if let Some(sink) = self.local_sinks.get(&subscriber) {
                    sink.deliver(&topic, &payload);
                }
            }
        }

        if !flags.contains(PublishFlags::PEERS) {
            return;
        }
        let allowed = self.policy.auto_publish || self.pub_acls.contains(&topic);
        if !allowed {
            return;
        }

        let msg = Message::Publish { topic: topic.clone(), payload, flags };
        if flags.contains(PublishFlags::UNSOLICITED) {
            self.broadcast_except(msg, from_peer);
        } else {
            let mut forwarders = self.routing.forwarders_for_publish(&topic);
            if let Some(sender) = from_peer {
                forwarders.retain(|p| *p != sender);
            }
            for peer in forwarders {
                self.send_to_peer(peer, msg.clone());
            }
        }
    }

    // ---- §4.4.3 Subscribe / unsubscribe propagation ------------------------

    /// Attaches a new local subscriber to `topics`, returning its handle.
    pub fn subscribe(&mut self, topics: &[Topic], sink: Arc<dyn SubscriberSink>) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        self.local_sinks.insert(id, sink);

        for topic in topics {
            self.local_index.register(topic.clone(), id);
            let newly_originated = self.routing.register_local(topic.clone());
            if newly_originated && (self.policy.auto_advertise || self.advert_acls.contains(topic)) {
                self.broadcast_except(
                    Message::Subscribe { topic: topic.clone(), origin: self.origin, ttl: 0 },
                    None,
                );
            }
        }
        id
    }

    /// Fully detaches a local subscriber from every topic it held.
    pub fn unsubscribe_all(&mut self, subscriber: SubscriberId) {
        self.local_sinks.remove(&subscriber);
        let Some(topics) = self.local_index.erase(&subscriber) else {
            return;
        };
        for topic in topics {
            if self.local_index.have_subscriber_for(&topic) {
                continue; // other local subscribers remain at this exact topic
            }
            if self.routing.unregister_local(&topic) {
                self.broadcast_except(Message::Unsubscribe { topic, origin: self.origin }, None);
            }
        }
    }

    /// Registers a subscription id heard (directly or via handshake
    /// snapshot) from `via_peer` at hop distance `ttl`, storing and
    /// re-advertising it at `ttl + 1` (§4.4.1 step 2; §4.4.3, remote
    /// subscribe handler).
    fn register_remote_subscription(&mut self, topic: Topic, origin: OriginId, via_peer: PeerHandle, ttl: Ttl) {
        let advertised_ttl = ttl.saturating_add(1);
        let sub_id = SubscriptionId::new(topic.clone(), origin);
        let outcome = self.routing.register(sub_id.clone(), via_peer, advertised_ttl);
        if matches!(outcome, RegisterOutcome::New) {
            self.broadcast_except(
                Message::Subscribe { topic, origin, ttl: advertised_ttl },
                Some(via_peer),
            );
        }
    }

    /// A remote `SUBSCRIBE` arrived from `from_peer` (§4.4.3).
    pub fn handle_remote_subscribe(&mut self, from_peer: PeerHandle, topic: Topic, origin: OriginId, ttl: Ttl) {
        self.peers.mark_advertised(from_peer, topic.clone()); // invariant 4
        if origin == self.origin {
            return; // invariant 5
        }
        self.register_remote_subscription(topic, origin, from_peer, ttl);
    }

    /// A remote `UNSUBSCRIBE` arrived from `from_peer` (§4.4.3).
    pub fn handle_remote_unsubscribe(&mut self, from_peer: PeerHandle, topic: Topic, origin: OriginId) {
        self.peers.mark_withdrawn(from_peer, &topic); // invariant 4
        let sub_id = SubscriptionId::new(topic.clone(), origin);
        let outcome = self.routing.unregister(&sub_id, from_peer, true);
        if matches!(outcome, UnregisterOutcome::Drained) {
            self.broadcast_except(Message::Unsubscribe { topic, origin }, Some(from_peer));
        }
    }

    // ---- §4.4.4 ACL and policy switches ------------------------------------

    /// Flips `AUTO_ADVERTISE`. Turning it off withdraws every locally
    /// originated topic not covered by `advert_acls`; turning it on
    /// re-advertises every locally originated topic.
    pub fn set_auto_advertise(&mut self, on: bool) {
        if self.policy.auto_advertise == on {
            return;
        }
        self.policy.auto_advertise = on;
        let topics: Vec<Topic> = self.local_index.topics();
        if on {
            for topic in topics {
                if self.routing.is_self_origin(&topic) {
                    self.broadcast_except(
                        Message::Subscribe { topic, origin: self.origin, ttl: 0 },
                        None,
                    );
                }
            }
        } else {
            for topic in topics {
                if self.routing.is_self_origin(&topic) && !self.advert_acls.contains(&topic) {
                    self.broadcast_except(Message::Unsubscribe { topic, origin: self.origin }, None);
                }
            }
        }
    }

    pub fn set_auto_publish(&mut self, on: bool) {
        self.policy.auto_publish = on;
    }

    pub fn allow_publish(&mut self, topic: Topic) {
        self.pub_acls.insert(topic);
    }

    pub fn allow_advertise(&mut self, topic: Topic) {
        self.advert_acls.insert(topic);
    }

    // ---- §4.7 Store coordinator glue ---------------------------------------

    /// Attaches an authoritative replica and advertises its id as a topic
    /// (§4.7, `attach_master`).
    pub fn attach_master(&mut self, id: StoreId) -> Result<(), BrokerError> {
        self.stores.attach_master(id.clone())?;
        let topic = Topic::try_from(id).map_err(|e| BrokerError::Unspecified(e.to_string()))?;
        self.routing.register_local(topic.clone());
        if self.policy.auto_advertise {
            self.broadcast_except(Message::Subscribe { topic, origin: self.origin, ttl: 0 }, None);
        }
        Ok(())
    }

    /// Attaches a mirrored replica and subscribes to its command topic
    /// (§4.7, `attach_clone`).
    pub fn attach_clone(&mut self, id: StoreId) {
        self.stores.attach_clone(id.clone());
        if let Ok(topic) = Topic::try_from(id) {
            let newly = self.routing.register_local(topic.clone());
            if newly && self.policy.auto_advertise {
                self.broadcast_except(Message::Subscribe { topic, origin: self.origin, ttl: 0 }, None);
            }
        }
    }

    /// Routes a store command: applies it locally if this endpoint hosts
    /// the master, otherwise forwards it on the id's topic so C3 carries it
    /// toward the master (§4.7; Open Question (c): "clones publish commands
    /// on the id's topic, which routes to the master").
    pub fn handle_store_command(&mut self, id: StoreId, command: StoreCommand) -> Result<(), BrokerError> {
        match self.stores.resolve_command(&id, command.clone())? {
            CommandRoute::ApplyLocally(event) => {
                let Ok(topic) = Topic::try_from(format!("{id}/events")) else {
                    return Ok(());
                };
                self.publish(
                    topic,
                    encode_store_event(&event),
                    PublishFlags::PEERS | PublishFlags::UNSOLICITED,
                    None,
                );
                Ok(())
            }
            CommandRoute::NoOp => Ok(()),
            CommandRoute::ForwardToMaster => {
                let Ok(topic) = Topic::try_from(id.clone()) else {
                    return Err(BrokerError::Unspecified("invalid store id".into()));
                };
                let msg = Message::StoreCmd { store_id: id.clone(), command };
                let forwarders = self.routing.forwarders_for_publish(&topic);
                if forwarders.is_empty() {
                    return Err(BrokerError::NoSuchMaster(id));
                }
                for peer in forwarders {
                    self.send_to_peer(peer, msg.clone());
                }
                Ok(())
            }
        }
    }

    /// Applies a replayed store event to a local clone of `id`.
    pub fn apply_store_event(&mut self, id: &str, event: &StoreEvent) {
        self.stores.apply_event(id, event);
    }

    /// If `topic` is a known clone's derived events topic (`"{id}/events"`,
    /// §6), decodes `payload` and replays it onto that clone. A no-op for
    /// every other topic, including a master's own id (masters produce
    /// events, they never consume them).
    fn maybe_apply_store_event(&mut self, topic: &Topic, payload: &Data) {
        let Some(id) = topic.as_str().strip_suffix("/events") else {
            return;
        };
        if let Some(event) = decode_store_event(payload) {
            self.apply_store_event(id, &event);
        }
    }
}

/// Encodes a `StoreEvent` as the `[op, key, value?, expiry?]` sequence
/// carried on the derived events topic (§6, "Store event encoding").
fn encode_store_event(event: &StoreEvent) -> Data {
    let expiry_secs = |d: &Option<std::time::Duration>| d.map(|d| d.as_secs_f64());
    let value = match event {
        StoreEvent::Add { key, value, expiry } => serde_json::json!([
            "add",
            key.as_json(),
            value.as_json(),
            expiry_secs(expiry),
        ]),
        StoreEvent::Put { key, value, expiry } => serde_json::json!([
            "put",
            key.as_json(),
            value.as_json(),
            expiry_secs(expiry),
        ]),
        StoreEvent::Erase { key } => serde_json::json!(["erase", key.as_json()]),
    };
    Data::from(value)
}

/// Decodes the `[op, key, value?, expiry?]` wire shape `encode_store_event`
/// produces. Returns `None` for anything malformed rather than erroring —
/// a clone simply ignores an events-topic publish it cannot parse.
fn decode_store_event(data: &Data) -> Option<StoreEvent> {
    let arr = data.as_json().as_array()?;
    let op = arr.first()?.as_str()?;
    let expiry_at = |arr: &[serde_json::Value], idx: usize| {
        arr.get(idx)
            .and_then(serde_json::Value::as_f64)
            .map(std::time::Duration::from_secs_f64)
    };
    match op {
        "add" => Some(StoreEvent::Add {
            key: Data::from(arr.get(1)?.clone()),
            value: Data::from(arr.get(2)?.clone()),
            expiry: expiry_at(arr, 3),
        }),
        "put" => Some(StoreEvent::Put {
            key: Data::from(arr.get(1)?.clone()),
            value: Data::from(arr.get(2)?.clone()),
            expiry: expiry_at(arr, 3),
        }),
        "erase" => Some(StoreEvent::Erase { key: Data::from(arr.get(1)?.clone()) }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        received: Mutex<Vec<(Topic, Data)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { received: Mutex::new(Vec::new()) })
        }
    }

    impl SubscriberSink for RecordingSink {
        fn deliver(&self, topic: &Topic, payload: &Data) {
            self.received.lock().unwrap().push((topic.clone(), payload.clone()));
        }
    }

    struct RecordingPeerSink {
        sent: Mutex<Vec<Message>>,
    }

    impl RecordingPeerSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()) })
        }
    }

    impl PeerSink for RecordingPeerSink {
        fn try_send(&self, msg: &Message) -> bool {
            self.sent.lock().unwrap().push(msg.clone());
            true
        }
    }

    fn t(s: &str) -> Topic {
        Topic::try_from(s).unwrap()
    }

    #[test]
    fn local_publish_fans_out_in_prefix_match_order() {
        let mut core = EndpointCore::new(EndpointPolicy::default());
        let sink = RecordingSink::new();
        core.subscribe(&[t("a/b")], sink.clone());

        core.publish(t("a/b/c"), Data::string("hi"), PublishFlags::SELF, None);
        core.publish(t("a/bc"), Data::string("nope"), PublishFlags::SELF, None);

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, Data::string("hi"));
    }

    #[test]
    fn handshake_installs_peer_and_emits_added() {
        let mut core = EndpointCore::new(EndpointPolicy::default());
        let mut obs = core.observe_status();
        let handle = core.allocate_peer_handle();
        core.apply_handshake(
            handle,
            "venus".into(),
            false,
            1,
            Some("venus:4040".into()),
            vec![],
            vec![],
            RecordingPeerSink::new(),
        );
        let event = obs.try_recv().unwrap();
        assert!(matches!(event, StatusEvent::PeerAdded { .. }));
    }

    #[test]
    fn unpeer_unknown_peer_is_invalid() {
        let mut core = EndpointCore::new(EndpointPolicy::default());
        let mut obs = core.observe_status();
        let handle = core.allocate_peer_handle();
        let err = core.unpeer(handle).unwrap_err();
        assert!(matches!(err, BrokerError::PeerInvalid(_)));
        assert!(matches!(obs.try_recv().unwrap(), StatusEvent::PeerInvalid { .. }));
    }

    #[test]
    fn remote_subscribe_rejected_for_self_origin() {
        let mut core = EndpointCore::new(EndpointPolicy::default());
        let handle = core.allocate_peer_handle();
        core.apply_handshake(handle, "venus".into(), true, 1, None, vec![], vec![], RecordingPeerSink::new());
        let self_origin = core.origin();
        core.handle_remote_subscribe(handle, t("x"), self_origin, 0);
        assert!(!core.routing.contains(&SubscriptionId::new(t("x"), self_origin)));
    }

    #[test]
    fn new_remote_subscription_is_rebroadcast_to_other_peers() {
        let mut core = EndpointCore::new(EndpointPolicy::default());
        let a = core.allocate_peer_handle();
        let sink_a = RecordingPeerSink::new();
        core.apply_handshake(a, "a".into(), true, 1, None, vec![], vec![], sink_a.clone());
        let b = core.allocate_peer_handle();
        let sink_b = RecordingPeerSink::new();
        core.apply_handshake(b, "b".into(), true, 1, None, vec![], vec![], sink_b.clone());

        let origin = OriginId::random();
        core.handle_remote_subscribe(a, t("t"), origin, 0);

        let sent_to_b = sink_b.sent.lock().unwrap();
        assert_eq!(sent_to_b.len(), 1);
        assert!(matches!(sent_to_b[0], Message::Subscribe { .. }));
        assert!(sink_a.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn incoming_events_publish_replays_onto_local_clone() {
        let mut core = EndpointCore::new(EndpointPolicy::default());
        core.attach_clone("kv".into());
        let handle = core.allocate_peer_handle();
        core.apply_handshake(handle, "master-host".into(), true, 1, None, vec![], vec![], RecordingPeerSink::new());

        let event = encode_store_event(&StoreEvent::Put {
            key: Data::string("k"),
            value: Data::integer(7),
            expiry: None,
        });
        core.publish(t("kv/events"), event, PublishFlags::PEERS | PublishFlags::UNSOLICITED, Some(handle));

        assert_eq!(core.stores().find("kv").unwrap().get(&Data::string("k")), Some(&Data::integer(7)));
    }

    #[test]
    fn decode_store_event_ignores_malformed_payload() {
        assert!(decode_store_event(&Data::string("not an event")).is_none());
        assert!(decode_store_event(&Data::from(serde_json::json!(["bogus-op"]))).is_none());
    }
}
