//! `Endpoint`: the public facade over C4 (§4.4) and the driving loop that
//! owns it.
//!
//! One task runs `EndpointLoop::run`, the only mutator of the
//! `EndpointCore` it holds, and multiplexes two channels with
//! `futures::select!` — local API calls (`ApiCmd`) and arrivals from every
//! connection proxy session (`ConnectionEvent`) — the same shape as the
//! teacher's `PubSubHub::run`. Every other method on `Endpoint` is a thin
//! client that sends a command and, where a result is needed, awaits a
//! one-shot reply channel.

use broker_core::data::Data;
use broker_core::endpoint_core::{EndpointCore, EndpointPolicy, PeerSink, SubscriberId, SubscriberSink};
use broker_core::error::BrokerError;
use broker_core::message::{Message, PublishFlags};
use broker_core::peer::PeerHandle;
use broker_core::routing::{OriginId, Ttl};
use broker_core::status::StatusObserver;
use broker_core::store::{StoreCommand, StoreId};
use broker_core::topic::Topic;
use broker_net::connection::{self, ConnectionEvent};
use compio::net::TcpListener;
use flume::{Receiver, Sender};
use futures::{select, FutureExt};
use hashbrown::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::event_subscriber::EventSubscriber;
use crate::subscriber::{ChannelSink, Subscriber};

enum ApiCmd {
    AllocateHandle {
        reply: Sender<PeerHandle>,
    },
    InstallPeer {
        handle: PeerHandle,
        display_name: String,
        incoming: bool,
        network_addr: Option<String>,
        advertised: Vec<Topic>,
        routes: Vec<(Topic, OriginId, Ttl)>,
        sink: Arc<dyn PeerSink>,
    },
    Unpeer {
        handle: PeerHandle,
        reply: Sender<Result<(), BrokerError>>,
    },
    Publish {
        topic: Topic,
        payload: Data,
        flags: PublishFlags,
    },
    Subscribe {
        topics: Vec<Topic>,
        sink: Arc<dyn SubscriberSink>,
        reply: Sender<SubscriberId>,
    },
    Unsubscribe {
        subscriber: SubscriberId,
    },
    AttachMaster {
        id: StoreId,
        reply: Sender<Result<(), BrokerError>>,
    },
    AttachClone {
        id: StoreId,
    },
    StoreCommand {
        id: StoreId,
        command: StoreCommand,
        reply: Sender<Result<(), BrokerError>>,
    },
    StoreGet {
        id: StoreId,
        key: Data,
        reply: Sender<Option<Data>>,
    },
    SetAutoPublish(bool),
    SetAutoAdvertise(bool),
    AllowPublish(Topic),
    AllowAdvertise(Topic),
    ObserveStatus {
        reply: Sender<StatusObserver>,
    },
    Hello {
        reply: Sender<(Vec<Topic>, Vec<(Topic, OriginId, Ttl)>)>,
    },
    ReportDialFailure {
        network_addr: Option<String>,
        message: String,
    },
}

/// Owns the `EndpointCore` and every handle-generation counter; the sole
/// task allowed to mutate the core.
struct EndpointLoop {
    core: EndpointCore,
    cmd_rx: Receiver<ApiCmd>,
    events_rx: Receiver<ConnectionEvent>,
    generations: HashMap<PeerHandle, u64>,
}

impl EndpointLoop {
    async fn run(mut self) {
        loop {
            select! {
                cmd = self.cmd_rx.recv_async().fuse() => {
                    match cmd {
                        Ok(cmd) => self.on_api_cmd(cmd),
                        Err(_) => break, // every Endpoint handle dropped
                    }
                }
                ev = self.events_rx.recv_async().fuse() => {
                    match ev {
                        Ok(ev) => self.on_connection_event(ev),
                        Err(_) => break, // unreachable: the loop itself holds a sender
                    }
                }
            }
        }
        debug!("endpoint loop exiting");
    }

    fn on_api_cmd(&mut self, cmd: ApiCmd) {
        match cmd {
            ApiCmd::AllocateHandle { reply } => {
                let handle = self.core.allocate_peer_handle();
                let _ = reply.send(handle);
            }
            ApiCmd::InstallPeer { handle, display_name, incoming, network_addr, advertised, routes, sink } => {
                let generation = self.generations.entry(handle).or_insert(0);
                *generation += 1;
                self.core.apply_handshake(handle, display_name, incoming, *generation, network_addr, advertised, routes, sink);
            }
            ApiCmd::Unpeer { handle, reply } => {
                let _ = reply.send(self.core.unpeer(handle));
            }
            ApiCmd::Publish { topic, payload, flags } => {
                self.core.publish(topic, payload, flags, None);
            }
            ApiCmd::Subscribe { topics, sink, reply } => {
                let id = self.core.subscribe(&topics, sink);
                let _ = reply.send(id);
            }
            ApiCmd::Unsubscribe { subscriber } => {
                self.core.unsubscribe_all(subscriber);
            }
            ApiCmd::AttachMaster { id, reply } => {
                let _ = reply.send(self.core.attach_master(id));
            }
            ApiCmd::AttachClone { id } => {
                self.core.attach_clone(id);
            }
            ApiCmd::StoreCommand { id, command, reply } => {
                let _ = reply.send(self.core.handle_store_command(id, command));
            }
            ApiCmd::StoreGet { id, key, reply } => {
                let value = self.core.stores().find(&id).and_then(|store| store.get(&key)).cloned();
                let _ = reply.send(value);
            }
            ApiCmd::SetAutoPublish(on) => self.core.set_auto_publish(on),
            ApiCmd::SetAutoAdvertise(on) => self.core.set_auto_advertise(on),
            ApiCmd::AllowPublish(topic) => self.core.allow_publish(topic),
            ApiCmd::AllowAdvertise(topic) => self.core.allow_advertise(topic),
            ApiCmd::ObserveStatus { reply } => {
                let _ = reply.send(self.core.observe_status());
            }
            ApiCmd::Hello { reply } => {
                let advertised = self.core.local_advertised_topics();
                let routes = self.core.routing_snapshot(None);
                let _ = reply.send((advertised, routes));
            }
            ApiCmd::ReportDialFailure { network_addr, message } => {
                self.core.report_dial_failure(None, network_addr, message);
            }
        }
    }

    fn on_connection_event(&mut self, ev: ConnectionEvent) {
        match ev {
            ConnectionEvent::Established { handle, display_name, advertised, routes, sink } => {
                let generation = self.generations.entry(handle).or_insert(0);
                *generation += 1;
                self.core.apply_handshake(handle, display_name, false, *generation, None, advertised, routes, sink);
            }
            ConnectionEvent::Message { handle, message } => self.on_message(handle, message),
            ConnectionEvent::Lost { handle, reason } => self.core.peer_lost(handle, reason),
            ConnectionEvent::DialFailed { handle, addr, attempt, error } => {
                warn!(%addr, attempt, %error, "outbound peer dial failed");
                self.core.report_dial_failure(handle, Some(addr), error);
            }
        }
    }

    fn on_message(&mut self, handle: PeerHandle, message: Message) {
        match message {
            Message::Publish { topic, payload, flags } => self.core.publish(topic, payload, flags, Some(handle)),
            Message::Subscribe { topic, origin, ttl } => self.core.handle_remote_subscribe(handle, topic, origin, ttl),
            Message::Unsubscribe { topic, origin } => self.core.handle_remote_unsubscribe(handle, topic, origin),
            Message::StoreCmd { store_id, command } => {
                let _ = self.core.handle_store_command(store_id, command);
            }
            Message::PeerHello { .. } => {
                // The handshake already consumed the one hello this peer
                // gets; a later resend is simply ignored.
            }
        }
    }
}

struct Inner {
    cmd_tx: Sender<ApiCmd>,
    events_tx: Sender<ConnectionEvent>,
    config: EndpointConfig,
    tasks: Mutex<Vec<compio::runtime::Task<()>>>,
}

/// One peer-to-peer pub/sub broker endpoint (§2, "Endpoint").
///
/// Cheap to clone: every clone shares the same underlying driving loop and
/// connection tasks. Dropping every clone drops the command channels, which
/// ends the driving loop and every session task it spawned.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Starts a new endpoint with no peers, no stores, and no local
    /// subscriptions. The driving loop runs as a background task from the
    /// moment this returns.
    #[must_use]
    pub fn new(config: EndpointConfig) -> Self {
        let policy = EndpointPolicy {
            auto_publish: config.auto_publish,
            auto_advertise: config.auto_advertise,
            outbound_queue_depth: config.outbound_queue_depth,
        };
        let core = EndpointCore::new(policy);
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (events_tx, events_rx) = flume::unbounded();

        let loop_task = compio::runtime::spawn(
            EndpointLoop { core, cmd_rx, events_rx, generations: HashMap::new() }.run(),
        );

        Self {
            inner: Arc::new(Inner {
                cmd_tx,
                events_tx,
                config,
                tasks: Mutex::new(vec![loop_task]),
            }),
        }
    }

    fn track(&self, task: compio::runtime::Task<()>) {
        self.inner.tasks.lock().unwrap().push(task);
    }

    async fn call<T>(&self, build: impl FnOnce(Sender<T>) -> ApiCmd) -> Result<T, BrokerError> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.inner
            .cmd_tx
            .send_async(build(reply_tx))
            .await
            .map_err(|_| BrokerError::Unspecified("endpoint loop is gone".into()))?;
        reply_rx
            .recv_async()
            .await
            .map_err(|_| BrokerError::Unspecified("endpoint loop dropped the reply".into()))
    }

    async fn hello(&self) -> Message {
        let (advertised, routes) = self.call(|reply| ApiCmd::Hello { reply }).await.unwrap_or_default();
        Message::PeerHello { name: self.inner.config.display_name.clone(), advertised, routes }
    }

    // ---- §4.5 Connection proxy: peer lifecycle -----------------------------

    /// Dials `addr`, performs the handshake, and installs the resulting
    /// peer (§4.4.1). Blocks (asynchronously) until the handshake completes
    /// or fails; does not retry.
    ///
    /// A failure is both returned to the caller and reported on the status
    /// bus (design note 9: "replace [connect failure exceptions] with an
    /// explicit result type surfaced to the status bus"), so an observer
    /// sees the same `peer_unavailable` an unattended `peer_async` retry
    /// loop would have produced.
    ///
    /// # Errors
    /// Whatever `broker_net::connection::connect` returns: `PeerUnavailable`
    /// if the TCP connect fails, or `VersionIncompatible` / `PeerTimeout` /
    /// `PeerInvalid` if the handshake itself does.
    pub async fn peer(&self, addr: SocketAddr) -> Result<PeerHandle, BrokerError> {
        let hello = self.hello().await;
        let session = match connection::connect(addr, hello, self.inner.config.handshake_timeout).await {
            Ok(session) => session,
            Err(e) => {
                let _ = self
                    .inner
                    .cmd_tx
                    .send_async(ApiCmd::ReportDialFailure {
                        network_addr: Some(addr.to_string()),
                        message: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };
        let handle = self
            .call(|reply| ApiCmd::AllocateHandle { reply })
            .await?;
        self.install_and_run(handle, false, Some(addr.to_string()), session).await;
        Ok(handle)
    }

    /// Mints a peer handle immediately and spawns a background task that
    /// dials `addr`, retrying at the configured fixed interval (§4.5) on
    /// every failed attempt or dropped session, until `unpeer(handle)` is
    /// called. Returns the handle once it is allocated, well before the
    /// connection (or any retry of it) actually establishes.
    ///
    /// Each retry's hello carries an empty `advertised`/`routes` snapshot
    /// rather than the live one `peer`/`listen` use: refreshing it would
    /// need a round trip through the endpoint loop on every attempt, and a
    /// dropped connection's retries are rare enough relative to handshake
    /// re-advertisement on the next `Subscribe` that this is not worth the
    /// extra hop.
    pub async fn peer_async(&self, addr: SocketAddr) -> PeerHandle {
        let handle = self
            .call(|reply| ApiCmd::AllocateHandle { reply })
            .await
            .expect("endpoint loop is alive for the lifetime of this Endpoint");

        let retry = self.inner.config.retry_interval;
        let handshake_timeout = self.inner.config.handshake_timeout;
        let display_name = self.inner.config.display_name.clone();
        let events_tx = self.inner.events_tx.clone();

        let task = compio::runtime::spawn(async move {
            let hello_factory = move || Message::PeerHello {
                name: display_name.clone(),
                advertised: Vec::new(),
                routes: Vec::new(),
            };
            connection::dial_outbound(addr, handle, Some(retry), hello_factory, handshake_timeout, events_tx).await;
        });
        self.track(task);
        handle
    }

    async fn install_and_run<T: broker_net::transport::Transport>(
        &self,
        handle: PeerHandle,
        incoming: bool,
        network_addr: Option<String>,
        session: connection::Session<T>,
    ) {
        let cmd_tx = self.inner.cmd_tx.clone();
        let _ = cmd_tx
            .send_async(ApiCmd::InstallPeer {
                handle,
                display_name: session.display_name.clone(),
                incoming,
                network_addr,
                advertised: session.advertised.clone(),
                routes: session.routes.clone(),
                sink: session.sink.clone(),
            })
            .await;
        let events_tx = self.inner.events_tx.clone();
        let task = compio::runtime::spawn(async move {
            session.run(handle, events_tx).await;
        });
        self.track(task);
    }

    /// Cooperatively disconnects `handle` (§5, "Cancellation").
    ///
    /// # Errors
    /// `BrokerError::PeerInvalid` if `handle` is not currently known.
    pub async fn unpeer(&self, handle: PeerHandle) -> Result<(), BrokerError> {
        self.call(|reply| ApiCmd::Unpeer { handle, reply }).await?
    }

    /// Accepts inbound connections on `addr` and installs each as a peer
    /// once its handshake completes. Returns the bound local address (useful
    /// when `addr`'s port is `0`) once the listener is up; the accept loop
    /// itself keeps running in the background for the lifetime of this
    /// `Endpoint`.
    ///
    /// # Errors
    /// Whatever binding the listener returns as an `io::Error`, wrapped as
    /// `BrokerError::Unspecified`.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, BrokerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BrokerError::Unspecified(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(|e| BrokerError::Unspecified(e.to_string()))?;

        let this = self.clone();
        let task = compio::runtime::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let this = this.clone();
                        let accept_task = compio::runtime::spawn(async move {
                            this.accept_one(stream, peer_addr).await;
                        });
                        this.track(accept_task);
                    }
                    Err(e) => {
                        warn!(%e, "accept loop terminating");
                        return;
                    }
                }
            }
        });
        self.track(task);
        Ok(local_addr)
    }

    async fn accept_one(&self, stream: compio::net::TcpStream, peer_addr: SocketAddr) {
        let hello = self.hello().await;
        let session = match connection::accept(stream, hello, self.inner.config.handshake_timeout).await {
            Ok(session) => session,
            Err(e) => {
                debug!(%peer_addr, %e, "inbound handshake failed");
                return;
            }
        };
        let handle = match self.call(|reply| ApiCmd::AllocateHandle { reply }).await {
            Ok(handle) => handle,
            Err(_) => return,
        };
        self.install_and_run(handle, true, Some(peer_addr.to_string()), session).await;
    }

    // ---- §4.4.2 / §4.4.3 Publish / subscribe -------------------------------

    /// Publishes `payload` to `topic` with the given flags (§4.4.2).
    pub async fn publish(&self, topic: Topic, payload: Data, flags: PublishFlags) {
        let _ = self
            .inner
            .cmd_tx
            .send_async(ApiCmd::Publish { topic, payload, flags })
            .await;
    }

    /// Subscribes to every topic in `topics`, returning a handle that
    /// yields matching publishes in delivery order until dropped or
    /// explicitly unsubscribed (§4.4.3).
    pub async fn subscribe(&self, topics: &[Topic]) -> Subscriber {
        let (sink, rx) = ChannelSink::new_pair();
        let id = self
            .call(|reply| ApiCmd::Subscribe { topics: topics.to_vec(), sink, reply })
            .await
            .expect("endpoint loop outlives its own Endpoint handles");
        let cmd_tx = self.inner.cmd_tx.clone();
        Subscriber::new(rx, move || {
            let _ = cmd_tx.send(ApiCmd::Unsubscribe { subscriber: id });
        })
    }

    // ---- §4.4.4 ACL / auto-mode switches ------------------------------------

    pub async fn set_auto_publish(&self, on: bool) {
        let _ = self.inner.cmd_tx.send_async(ApiCmd::SetAutoPublish(on)).await;
    }

    pub async fn set_auto_advertise(&self, on: bool) {
        let _ = self.inner.cmd_tx.send_async(ApiCmd::SetAutoAdvertise(on)).await;
    }

    pub async fn allow_publish(&self, topic: Topic) {
        let _ = self.inner.cmd_tx.send_async(ApiCmd::AllowPublish(topic)).await;
    }

    pub async fn allow_advertise(&self, topic: Topic) {
        let _ = self.inner.cmd_tx.send_async(ApiCmd::AllowAdvertise(topic)).await;
    }

    // ---- §4.7 Store replication ---------------------------------------------

    /// Attaches an authoritative replica for `id` (§4.7).
    ///
    /// # Errors
    /// `BrokerError::StoreIdInUse` if this endpoint already hosts a master
    /// for `id`.
    pub async fn attach_master(&self, id: StoreId) -> Result<(), BrokerError> {
        self.call(|reply| ApiCmd::AttachMaster { id, reply }).await?
    }

    /// Attaches a mirrored replica for `id` (§4.7).
    pub async fn attach_clone(&self, id: StoreId) {
        let _ = self.inner.cmd_tx.send_async(ApiCmd::AttachClone { id }).await;
    }

    /// Routes a store command: applies it locally if this endpoint hosts
    /// `id`'s master, otherwise forwards it toward the master via C3.
    ///
    /// # Errors
    /// `BrokerError::NoSuchMaster` if no master for `id` is reachable.
    pub async fn store_command(&self, id: StoreId, command: StoreCommand) -> Result<(), BrokerError> {
        self.call(|reply| ApiCmd::StoreCommand { id, command, reply }).await?
    }

    /// Reads `key` out of the local replica of `id`, whether a master or a
    /// clone. Returns `None` if this endpoint does not host `id` at all or
    /// `key` is absent.
    pub async fn store_get(&self, id: StoreId, key: Data) -> Option<Data> {
        self.call(|reply| ApiCmd::StoreGet { id, key, reply }).await.ok().flatten()
    }

    // ---- §4.6 Status/error bus -----------------------------------------------

    /// Returns a subscriber over this endpoint's peer lifecycle events
    /// (§4.6).
    pub async fn make_event_subscriber(&self) -> EventSubscriber {
        let observer = self
            .call(|reply| ApiCmd::ObserveStatus { reply })
            .await
            .expect("endpoint loop outlives its own Endpoint handles");
        EventSubscriber::new(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn listen_then_peer_establishes_and_exchanges_a_publish() {
        let server = Endpoint::new(EndpointConfig::default().with_display_name("server"));
        let client = Endpoint::new(EndpointConfig::default().with_display_name("client"));

        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let server_sub = server.subscribe(&[Topic::try_from("greetings").unwrap()]).await;
        client.peer(addr).await.unwrap();

        // Give the accept task a moment to finish installing the peer
        // before we publish; a real caller would instead await
        // `make_event_subscriber` for `peer_added`.
        compio::time::sleep(std::time::Duration::from_millis(50)).await;

        client
            .publish(
                Topic::try_from("greetings").unwrap(),
                Data::string("hi"),
                PublishFlags::PEERS,
            )
            .await;

        let (topic, payload) = server_sub.recv().await.unwrap();
        assert_eq!(topic, Topic::try_from("greetings").unwrap());
        assert_eq!(payload, Data::string("hi"));
    }

    #[compio::test]
    async fn unpeer_unknown_handle_is_invalid() {
        let endpoint = Endpoint::new(EndpointConfig::default());
        let handle = endpoint.peer_async("127.0.0.1:1".parse().unwrap()).await;
        // peer_async allocates a handle but the dial will fail immediately
        // (nothing listening); unpeer before any successful handshake still
        // behaves correctly since the core never installed it.
        let err = endpoint.unpeer(handle).await.unwrap_err();
        assert!(matches!(err, BrokerError::PeerInvalid(_)));
    }
}
