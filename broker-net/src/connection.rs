//! Connection proxy (C5).
//!
//! One instance of the machinery in this module drives exactly one remote
//! address: it dials (or accepts), performs the bootstrap handshake, and
//! — once established — pumps messages in both directions until the
//! transport drops or the local side asks it to stop (§4.5).
//!
//! This crate never touches C2/C3 directly (design note 9, "Cyclic
//! references": the peer table and routing table are owned exclusively by
//! `EndpointCore`). Instead a session reports `ConnectionEvent`s on a
//! shared channel; the facade crate's event loop is the only thing that
//! turns those into `EndpointCore` method calls, the same separation the
//! teacher keeps between its `SocketActor` (pure I/O pump) and the hubs
//! that own routing state.

use crate::codec::{encode_frame, FrameDecoder};
use crate::handshake::perform_handshake;
use crate::reconnect::ReconnectState;
use crate::timeout::read_with_timeout;
use crate::transport::Transport;
use broker_core::endpoint_core::PeerSink;
use broker_core::error::BrokerError;
use broker_core::message::Message;
use broker_core::peer::PeerHandle;
use broker_core::routing::{OriginId, Ttl};
use broker_core::topic::Topic;
use compio::io::AsyncWriteExt;
use flume::{Receiver, Sender};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reported by a running session back to the endpoint's event loop. The
/// loop (owned by the facade crate) is the sole caller of the
/// corresponding `EndpointCore` methods (`apply_handshake`, the message
/// handlers, `peer_lost`).
pub enum ConnectionEvent {
    /// The bootstrap handshake (§4.4.1) completed for `handle`. The event
    /// loop must call `EndpointCore::apply_handshake` with these fields
    /// before any `Message` event for the same handle is processed —
    /// `dial_outbound` guarantees it sends this before spawning the
    /// session's pump loop, so the two can never race on one channel.
    Established {
        handle: PeerHandle,
        display_name: String,
        advertised: Vec<Topic>,
        routes: Vec<(Topic, OriginId, Ttl)>,
        sink: Arc<dyn PeerSink>,
    },
    /// A fully decoded frame arrived from an established peer.
    Message { handle: PeerHandle, message: Message },
    /// The transport dropped (unexpectedly, or after a graceful shutdown
    /// requested by dropping the peer's sink).
    Lost { handle: PeerHandle, reason: String },
    /// A dial or handshake attempt failed before a session was ever
    /// established for this address. `handle` is set when the attempt was
    /// for a peer the core already has a slot allocated for (outbound
    /// retries); `None` for inbound handshake failures.
    DialFailed { handle: Option<PeerHandle>, addr: String, attempt: u32, error: String },
}

/// Hands `Message`s to an established session's writer queue.
/// `PeerSink::try_send` returning `false` is the "transport declining new
/// sends" backpressure signal in §5 — it fires once the bounded channel
/// behind this sink is full.
pub struct TransportPeerSink {
    tx: Sender<Message>,
}

impl PeerSink for TransportPeerSink {
    fn try_send(&self, msg: &Message) -> bool {
        self.tx.try_send(msg.clone()).is_ok()
    }
}

/// Queue depth for a session's outbound channel. `EndpointCore` already
/// applies its own bounded backlog with drop-oldest semantics (§5), so
/// this only needs to be large enough to avoid needless `try_send`
/// failures under a brief burst.
const SESSION_QUEUE_DEPTH: usize = 4096;

/// A session that has completed the bootstrap handshake (§4.5) but is not
/// yet pumping messages. The caller installs `sink`/`advertised`/`routes`
/// into `EndpointCore` (via `apply_handshake`) before calling `run`, so
/// that no inbound frame can be processed before the peer is known to C2.
pub struct Session<T> {
    pub display_name: String,
    pub advertised: Vec<Topic>,
    pub routes: Vec<(Topic, OriginId, Ttl)>,
    pub sink: Arc<dyn PeerSink>,
    transport: T,
    cmd_rx: Receiver<Message>,
}

impl<T: Transport> Session<T> {
    /// Runs the session to completion: a non-blocking drain of the
    /// outbound queue before every read, the same split-pump shape as the
    /// teacher's `SocketActor::run`. Returns once the transport drops, a
    /// write fails, or the session's sink is dropped (graceful local
    /// close via `unpeer`).
    pub async fn run(self, handle: PeerHandle, events_tx: Sender<ConnectionEvent>) {
        let Self { mut transport, cmd_rx, .. } = self;
        let mut decoder = FrameDecoder::new();

        loop {
            loop {
                match cmd_rx.try_recv() {
                    Ok(msg) => {
                        let Ok(frame) = encode_frame(&msg) else {
                            continue;
                        };
                        let compio::BufResult(res, _) = transport.write_all(frame).await;
                        if let Err(e) = res {
                            let _ = events_tx.send(ConnectionEvent::Lost {
                                handle,
                                reason: format!("write failed: {e}"),
                            });
                            return;
                        }
                    }
                    Err(flume::TryRecvError::Empty) => break,
                    Err(flume::TryRecvError::Disconnected) => {
                        // The peer's sink was dropped locally (teardown
                        // via `unpeer`, or the endpoint shutting down):
                        // close gracefully, no `Lost` event (the caller
                        // already knows).
                        let _ = transport.shutdown().await;
                        return;
                    }
                }
            }

            let buf = vec![0u8; 8192];
            let read = read_with_timeout(&mut transport, buf, None).await;
            let (n, buf) = match read {
                Ok(compio::BufResult(Ok(n), buf)) => (n, buf),
                Ok(compio::BufResult(Err(e), _)) | Err(e) => {
                    let _ = events_tx.send(ConnectionEvent::Lost {
                        handle,
                        reason: format!("read failed: {e}"),
                    });
                    return;
                }
            };
            if n == 0 {
                let _ = events_tx.send(ConnectionEvent::Lost {
                    handle,
                    reason: "connection closed by peer".into(),
                });
                return;
            }

            decoder.feed(&buf[..n]);
            loop {
                match decoder.try_decode() {
                    Ok(Some(message)) => {
                        if events_tx.send(ConnectionEvent::Message { handle, message }).is_err() {
                            return; // event loop gone; nothing left to do
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = events_tx.send(ConnectionEvent::Lost {
                            handle,
                            reason: format!("malformed frame: {e}"),
                        });
                        return;
                    }
                }
            }
        }
    }
}

async fn handshake_over<T: Transport>(
    mut transport: T,
    local_hello: Message,
    handshake_timeout: Option<Duration>,
) -> Result<Session<T>, BrokerError> {
    let remote_hello = perform_handshake(&mut transport, local_hello, handshake_timeout).await?;
    let Message::PeerHello { name, advertised, routes } = remote_hello else {
        return Err(BrokerError::PeerInvalid("handshake did not yield PeerHello".into()));
    };
    let (cmd_tx, cmd_rx) = flume::bounded(SESSION_QUEUE_DEPTH);
    let sink: Arc<dyn PeerSink> = Arc::new(TransportPeerSink { tx: cmd_tx });
    Ok(Session { display_name: name, advertised, routes, sink, transport, cmd_rx })
}

/// Dials `addr` once and performs the handshake. Used by the synchronous
/// `peer()` API: the caller gets a `Result` it can report directly, and
/// is responsible for installing the session into `EndpointCore` and
/// spawning `Session::run`.
///
/// # Errors
/// Returns `BrokerError::PeerUnavailable` if the TCP connect fails, or
/// whatever `perform_handshake` returns (`VersionIncompatible`,
/// `PeerTimeout`, `PeerInvalid`) if the connect succeeds but the
/// handshake doesn't.
pub async fn connect(
    addr: SocketAddr,
    local_hello: Message,
    handshake_timeout: Option<Duration>,
) -> Result<Session<compio::net::TcpStream>, BrokerError> {
    let stream = compio::net::TcpStream::connect(addr)
        .await
        .map_err(|e| BrokerError::PeerUnavailable(e.to_string()))?;
    handshake_over(stream, local_hello, handshake_timeout).await
}

/// Performs the handshake over an already-accepted inbound transport
/// (§4.5, the "incoming" side of bootstrap).
///
/// # Errors
/// See `perform_handshake`.
pub async fn accept<T: Transport>(
    transport: T,
    local_hello: Message,
    handshake_timeout: Option<Duration>,
) -> Result<Session<T>, BrokerError> {
    handshake_over(transport, local_hello, handshake_timeout).await
}

/// Dials `addr` and drives the resulting session, reporting every step on
/// `events_tx`. On each successful handshake, sends `Established` (so the
/// event loop can call `apply_handshake` before any frame from this
/// session can be dispatched) and only then starts the session's pump
/// loop. If `retry` is `Some`, keeps retrying at that fixed interval
/// (§4.5: "Retry uses a caller-specified fixed interval") after both
/// failed attempts and dropped sessions (`disconnected -> connected` on
/// the next success). If `retry` is `None`, a single failed attempt is
/// reported and the task ends. This backs `peer_async`; `peer()` instead
/// calls `connect` directly for a synchronous result.
pub async fn dial_outbound<F>(
    addr: SocketAddr,
    handle: PeerHandle,
    retry: Option<Duration>,
    hello_factory: F,
    handshake_timeout: Option<Duration>,
    events_tx: Sender<ConnectionEvent>,
) where
    F: Fn() -> Message,
{
    let mut reconnect = ReconnectState::new(retry.unwrap_or(Duration::from_secs(1)));
    loop {
        match connect(addr, hello_factory(), handshake_timeout).await {
            Ok(session) => {
                reconnect.reset();
                let established = ConnectionEvent::Established {
                    handle,
                    display_name: session.display_name.clone(),
                    advertised: session.advertised.clone(),
                    routes: session.routes.clone(),
                    sink: session.sink.clone(),
                };
                if events_tx.send(established).is_err() {
                    return; // event loop gone
                }
                session.run(handle, events_tx.clone()).await;
            }
            Err(e) => {
                let _ = events_tx.send(ConnectionEvent::DialFailed {
                    handle: Some(handle),
                    addr: addr.to_string(),
                    attempt: reconnect.attempt(),
                    error: e.to_string(),
                });
            }
        }

        let Some(_) = retry else { return };
        let delay = reconnect.next_delay();
        debug!(%addr, attempt = reconnect.attempt(), ?delay, "retrying outbound peer connection");
        compio::time::sleep(delay).await;
    }
}
