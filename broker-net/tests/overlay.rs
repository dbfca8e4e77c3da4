//! End-to-end overlay scenarios driven over `MemTransport`, wiring several
//! `EndpointCore` instances by hand the way `broker`'s `EndpointLoop` does
//! in production (§8, "Workspace-level `tests/` integration tests ...
//! reproduce the six end-to-end scenarios"). This crate cannot depend on
//! `broker` (that would be circular), so the harness below re-implements
//! the thin dispatch `on_connection_event`/`on_message` does there, minus
//! the command channel (tests call `EndpointCore` methods directly instead
//! of going through an `ApiCmd`).

use broker_core::data::Data;
use broker_core::endpoint_core::{EndpointCore, EndpointPolicy, SubscriberSink};
use broker_core::error::BrokerError;
use broker_core::message::{Message, PublishFlags};
use broker_core::peer::PeerHandle;
use broker_core::status::StatusEvent;
use broker_core::store::StoreCommand;
use broker_core::topic::Topic;
use broker_net::connection::{self, ConnectionEvent};
use broker_net::transport::MemTransport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingSink {
    received: Mutex<Vec<(Topic, Data)>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self { received: Mutex::new(Vec::new()) })
    }

    fn received(&self) -> Vec<(Topic, Data)> {
        self.received.lock().unwrap().clone()
    }
}

impl SubscriberSink for RecordingSink {
    fn deliver(&self, topic: &Topic, payload: &Data) {
        self.received.lock().unwrap().push((topic.clone(), payload.clone()));
    }
}

/// One node of a test overlay: an `EndpointCore` plus the bookkeeping its
/// real-world driver (`broker::EndpointLoop`) would otherwise own.
struct Node {
    name: String,
    core: EndpointCore,
    events_tx: flume::Sender<ConnectionEvent>,
    events_rx: flume::Receiver<ConnectionEvent>,
    generations: HashMap<PeerHandle, u64>,
    publish_events_seen: usize,
    _tasks: Vec<compio::runtime::Task<()>>,
}

impl Node {
    fn new(name: &str) -> Self {
        let policy = EndpointPolicy { auto_publish: true, auto_advertise: true, outbound_queue_depth: 64 };
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            name: name.to_owned(),
            core: EndpointCore::new(policy),
            events_tx,
            events_rx,
            generations: HashMap::new(),
            publish_events_seen: 0,
            _tasks: Vec::new(),
        }
    }

    fn hello(&self) -> Message {
        Message::PeerHello {
            name: self.name.clone(),
            advertised: self.core.local_advertised_topics(),
            routes: self.core.routing_snapshot(None),
        }
    }

    /// Drains every event currently queued from this node's sessions,
    /// mirroring `EndpointLoop::on_connection_event`/`on_message`.
    fn drain(&mut self) {
        while let Ok(ev) = self.events_rx.try_recv() {
            match ev {
                ConnectionEvent::Established { handle, display_name, advertised, routes, sink } => {
                    let generation = self.generations.entry(handle).or_insert(0);
                    *generation += 1;
                    self.core.apply_handshake(handle, display_name, false, *generation, None, advertised, routes, sink);
                }
                ConnectionEvent::Message { handle, message } => {
                    if matches!(message, Message::Publish { .. }) {
                        self.publish_events_seen += 1;
                    }
                    match message {
                        Message::Publish { topic, payload, flags } => {
                            self.core.publish(topic, payload, flags, Some(handle));
                        }
                        Message::Subscribe { topic, origin, ttl } => {
                            self.core.handle_remote_subscribe(handle, topic, origin, ttl);
                        }
                        Message::Unsubscribe { topic, origin } => {
                            self.core.handle_remote_unsubscribe(handle, topic, origin);
                        }
                        Message::StoreCmd { store_id, command } => {
                            let _ = self.core.handle_store_command(store_id, command);
                        }
                        Message::PeerHello { .. } => {}
                    }
                }
                ConnectionEvent::Lost { handle, reason } => self.core.peer_lost(handle, reason),
                ConnectionEvent::DialFailed { handle, addr, error, .. } => {
                    self.core.report_dial_failure(handle, Some(addr), error);
                }
            }
        }
    }
}

/// Lets every currently-spawned session task run, then drains whatever
/// arrived. Generous enough to cover several propagation hops on
/// `compio`'s single-threaded scheduler.
async fn settle(nodes: &mut [&mut Node]) {
    for _ in 0..4 {
        compio::time::sleep(Duration::from_millis(30)).await;
        for node in nodes.iter_mut() {
            node.drain();
        }
    }
}

/// Handshakes `a` and `b` over a fresh `MemTransport` pair and installs
/// each side as a peer of the other, exactly as `Endpoint::accept_one`
/// does for a real inbound connection (both ends use the transport-generic
/// `connection::accept`, since neither side is "dialing" a `SocketAddr`).
async fn connect_pair(a: &mut Node, b: &mut Node) -> (PeerHandle, PeerHandle) {
    let (ta, tb) = MemTransport::pair();
    let hello_a = a.hello();
    let hello_b = b.hello();
    let (res_a, res_b) =
        futures::join!(connection::accept(ta, hello_a, None), connection::accept(tb, hello_b, None));
    let sess_a = res_a.expect("a's handshake succeeds");
    let sess_b = res_b.expect("b's handshake succeeds");

    let handle_a = a.core.allocate_peer_handle();
    let handle_b = b.core.allocate_peer_handle();

    a.core.apply_handshake(
        handle_a,
        sess_a.display_name.clone(),
        true,
        1,
        None,
        sess_a.advertised.clone(),
        sess_a.routes.clone(),
        sess_a.sink.clone(),
    );
    b.core.apply_handshake(
        handle_b,
        sess_b.display_name.clone(),
        true,
        1,
        None,
        sess_b.advertised.clone(),
        sess_b.routes.clone(),
        sess_b.sink.clone(),
    );

    let events_a = a.events_tx.clone();
    let events_b = b.events_tx.clone();
    a._tasks.push(compio::runtime::spawn(async move {
        sess_a.run(handle_a, events_a).await;
    }));
    b._tasks.push(compio::runtime::spawn(async move {
        sess_b.run(handle_b, events_b).await;
    }));

    (handle_a, handle_b)
}

fn topic(s: &str) -> Topic {
    Topic::try_from(s).unwrap()
}

/// Scenario 1: prefix match, three-node star (spec.md §8, scenario 1).
#[compio::test]
async fn star_topology_prefix_matches_fan_out_correctly() {
    let mut mercury = Node::new("mercury");
    let mut venus = Node::new("venus");
    let mut earth = Node::new("earth");

    connect_pair(&mut mercury, &mut venus).await;
    connect_pair(&mut mercury, &mut earth).await;
    settle(&mut [&mut mercury, &mut venus, &mut earth]).await;

    let venus_sink = RecordingSink::new();
    venus.core.subscribe(&[topic("bro/events")], venus_sink.clone());
    let earth_sink = RecordingSink::new();
    earth.core.subscribe(&[topic("bro/events/failures")], earth_sink.clone());
    settle(&mut [&mut mercury, &mut venus, &mut earth]).await;

    let items = [
        ("bro/events/failures", Data::string("oops")),
        ("bro/events/failures", Data::string("sorry!")),
        ("bro/events/logging", Data::integer(123)),
        ("bro/events/logging", Data::integer(456)),
    ];
    for (t, payload) in &items {
        mercury.core.publish(topic(t), payload.clone(), PublishFlags::PEERS, None);
    }
    settle(&mut [&mut mercury, &mut venus, &mut earth]).await;

    let venus_got = venus_sink.received();
    assert_eq!(venus_got.len(), 4, "venus should see every item under bro/events");
    for (got, (want_topic, want_payload)) in venus_got.iter().zip(items.iter()) {
        assert_eq!(got.0, topic(want_topic));
        assert_eq!(&got.1, want_payload);
    }

    let earth_got = earth_sink.received();
    assert_eq!(earth_got.len(), 2, "earth should see only the two failures items");
    assert_eq!(earth_got[0], (topic("bro/events/failures"), Data::string("oops")));
    assert_eq!(earth_got[1], (topic("bro/events/failures"), Data::string("sorry!")));
}

/// Scenario 2: unpeer lifecycle (spec.md §8, scenario 2).
#[compio::test]
async fn unpeer_emits_removed_then_invalid_on_repeat() {
    let mut mercury = Node::new("mercury");
    let mut venus = Node::new("venus");

    let mercury_observer = mercury.core.observe_status();
    let venus_observer = venus.core.observe_status();

    let (mercury_sees_venus, venus_sees_mercury) = connect_pair(&mut mercury, &mut venus).await;
    settle(&mut [&mut mercury, &mut venus]).await;

    assert!(matches!(
        mercury_observer.try_recv(),
        Ok(StatusEvent::PeerAdded { peer, .. }) if peer == mercury_sees_venus
    ));
    assert!(matches!(
        venus_observer.try_recv(),
        Ok(StatusEvent::PeerAdded { peer, .. }) if peer == venus_sees_mercury
    ));

    // venus.unpeer(mercury): mercury's transport drops (Lost), venus tore
    // it down cooperatively (Removed).
    venus.core.unpeer(venus_sees_mercury).expect("venus knows this peer");
    mercury.core.peer_lost(mercury_sees_venus, "simulated transport drop");

    assert!(matches!(
        venus_observer.try_recv(),
        Ok(StatusEvent::PeerRemoved { peer, .. }) if peer == venus_sees_mercury
    ));
    assert!(matches!(
        mercury_observer.try_recv(),
        Ok(StatusEvent::PeerLost { peer, .. }) if peer == mercury_sees_venus
    ));

    // A second unpeer from venus on the same (now-gone) handle: peer_invalid,
    // nothing elsewhere.
    let err = venus.core.unpeer(venus_sees_mercury).unwrap_err();
    assert!(matches!(err, BrokerError::PeerInvalid(_)));
    assert!(matches!(
        venus_observer.try_recv(),
        Ok(StatusEvent::PeerInvalid { peer: Some(peer), .. }) if peer == venus_sees_mercury
    ));
    assert!(mercury_observer.try_recv().is_err(), "mercury sees nothing from venus's second unpeer");
}

/// Scenario 3: retry (spec.md §8, scenario 3). This is the one scenario
/// that needs a real `SocketAddr` target rather than `MemTransport`, since
/// `dial_outbound`'s retry loop dials an address, not a pre-built pipe.
#[compio::test]
async fn retry_succeeds_once_the_listener_comes_up() {
    use broker_core::peer::PeerTable;
    use compio::net::TcpListener;

    // Reserve a port, then free it immediately so the first dial attempts
    // race an address nothing is listening on yet.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let (events_tx, events_rx) = flume::unbounded();
    let mut handles = PeerTable::new();
    let handle = handles.allocate();
    let dial_task = compio::runtime::spawn(connection::dial_outbound(
        addr,
        handle,
        Some(Duration::from_millis(30)),
        || Message::PeerHello { name: "venus".into(), advertised: Vec::new(), routes: Vec::new() },
        None,
        events_tx,
    ));

    // Let a couple of failed attempts go by.
    compio::time::sleep(Duration::from_millis(120)).await;
    let mut saw_dial_failed = false;
    let mut core = EndpointCore::new(EndpointPolicy::default());
    let mut status = core.observe_status();
    while let Ok(ev) = events_rx.try_recv() {
        if let ConnectionEvent::DialFailed { handle, addr, error, .. } = ev {
            saw_dial_failed = true;
            // §7: a failed attempt must reach the status bus, not just `tracing`.
            core.report_dial_failure(handle, Some(addr.to_string()), error);
        }
    }
    assert!(saw_dial_failed, "venus should have logged at least one failed attempt");
    assert!(matches!(status.try_recv(), Ok(StatusEvent::PeerUnavailable { .. })));

    let listener = TcpListener::bind(addr).await.expect("the port was freed above");
    let accept_task = compio::runtime::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let hello = Message::PeerHello { name: "mercury".into(), advertised: Vec::new(), routes: Vec::new() };
        connection::accept(stream, hello, None).await.unwrap()
    });

    compio::time::sleep(Duration::from_millis(200)).await;
    let mut established = false;
    while let Ok(ev) = events_rx.try_recv() {
        if matches!(ev, ConnectionEvent::Established { .. }) {
            established = true;
        }
    }
    assert!(established, "the next retry after mercury starts listening should succeed");

    drop(dial_task);
    drop(accept_task);
}

/// Scenario 4: forwarder switch (spec.md §8, scenario 4). Chain
/// A — B — C — D with D subscribing to `t`; a shortcut link A — D should
/// switch A's forwarder from B to D and stop routing publishes through the
/// chain's middle.
#[compio::test]
async fn shortcut_link_switches_the_forwarder() {
    let mut a = Node::new("a");
    let mut b = Node::new("b");
    let mut c = Node::new("c");
    let mut d = Node::new("d");

    connect_pair(&mut a, &mut b).await;
    connect_pair(&mut b, &mut c).await;
    connect_pair(&mut c, &mut d).await;
    settle(&mut [&mut a, &mut b, &mut c, &mut d]).await;

    let d_sink = RecordingSink::new();
    d.core.subscribe(&[topic("t")], d_sink.clone());
    settle(&mut [&mut a, &mut b, &mut c, &mut d]).await;

    // Baseline: a publish from A should reach D through the chain, and C
    // (the chain's middle hop) should see exactly one forwarded publish.
    a.core.publish(topic("t"), Data::string("via-chain"), PublishFlags::PEERS, None);
    settle(&mut [&mut a, &mut b, &mut c, &mut d]).await;
    assert_eq!(d_sink.received().len(), 1);
    assert_eq!(c.publish_events_seen, 1, "the chain's middle hop forwards the first publish");

    // Shortcut: A and D peer up directly. D's own origin for "t" reaches A
    // at one hop, beating the three-hop route learned via B.
    connect_pair(&mut a, &mut d).await;
    settle(&mut [&mut a, &mut b, &mut c, &mut d]).await;

    a.core.publish(topic("t"), Data::string("via-shortcut"), PublishFlags::PEERS, None);
    settle(&mut [&mut a, &mut b, &mut c, &mut d]).await;

    let d_got = d_sink.received();
    assert_eq!(d_got.len(), 2, "d still gets both publishes, now via the direct link");
    assert_eq!(d_got[1].1, Data::string("via-shortcut"));
    assert_eq!(
        c.publish_events_seen, 1,
        "after the shortcut, a's forwarder is d directly; c sees no second publish"
    );
}

/// Scenario 5: store replication (spec.md §8, scenario 5).
#[compio::test]
async fn clone_put_replicates_through_the_master() {
    let mut mercury = Node::new("mercury");
    let mut venus = Node::new("venus");

    mercury.core.attach_master("kv".to_string()).expect("mercury is the only master so far");
    venus.core.attach_clone("kv".to_string());

    connect_pair(&mut mercury, &mut venus).await;
    settle(&mut [&mut mercury, &mut venus]).await;

    venus
        .core
        .handle_store_command("kv".to_string(), StoreCommand::Put { key: Data::string("k"), value: Data::integer(1), expiry: None })
        .expect("venus's clone can route the command toward mercury's master");
    settle(&mut [&mut mercury, &mut venus]).await;

    let replicated = venus.core.stores().find("kv").and_then(|store| store.get(&Data::string("k")));
    assert_eq!(replicated, Some(&Data::integer(1)));
}

/// Scenario 6: master collision (spec.md §8, scenario 6). Purely local: no
/// peering involved.
#[compio::test]
async fn second_attach_master_on_same_endpoint_fails() {
    let mut mercury = Node::new("mercury");

    mercury.core.attach_master("kv".to_string()).expect("first attach succeeds");
    let err = mercury.core.attach_master("kv".to_string()).unwrap_err();
    assert!(matches!(err, BrokerError::StoreIdInUse(id) if id == "kv"));

    // The first master replica is still operational.
    venus_can_still_write_through(&mut mercury);
}

fn venus_can_still_write_through(mercury: &mut Node) {
    mercury
        .core
        .handle_store_command("kv".to_string(), StoreCommand::Put { key: Data::string("k"), value: Data::integer(7), expiry: None })
        .expect("the original master replica is unaffected by the rejected second attach");
    let value = mercury.core.stores().find("kv").and_then(|store| store.get(&Data::string("k")));
    assert_eq!(value, Some(&Data::integer(7)));
}
