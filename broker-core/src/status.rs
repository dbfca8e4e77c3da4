//! Status/error bus (C6).
//!
//! Emits typed lifecycle events about peers to subscribed observers. The
//! bus guarantees that, for any one observer, a `PeerAdded` for a given
//! peer precedes any `PeerLost`/`PeerRemoved` for the same peer, which
//! falls out for free here because every event is produced synchronously
//! by the single-threaded endpoint core and delivered in emission order
//! (§4.6; §5, "Status events for a given peer are emitted in the order
//! they occur").

use crate::peer::PeerHandle;
use flume::{Receiver, Sender};

/// A typed peering lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A peer's transport was established and the handshake succeeded.
    PeerAdded {
        peer: PeerHandle,
        network_addr: Option<String>,
        message: String,
    },
    /// A local `unpeer` (or the remote doing the same) cleanly tore the
    /// peer down.
    PeerRemoved { peer: PeerHandle, message: String },
    /// The transport to a peer dropped unexpectedly.
    PeerLost { peer: PeerHandle, message: String },
    /// A peer's outbound queue overflowed and the oldest message was
    /// dropped, or a connection attempt could not be completed.
    PeerUnavailable {
        peer: Option<PeerHandle>,
        network_addr: Option<String>,
        message: String,
    },
    /// An operation referenced a peer/address that is not known (e.g.
    /// `unpeer` on an address never peered, or a malformed remote message).
    PeerInvalid {
        peer: Option<PeerHandle>,
        network_addr: Option<String>,
        message: String,
    },
}

/// Handle for observing the status bus. Backed by an unbounded broadcast
/// channel: every subscriber gets its own `Receiver` cloned from the
/// sender side at subscribe time (see `StatusBus::subscribe`).
pub type StatusObserver = Receiver<StatusEvent>;

/// The status/error bus: one emitter (the endpoint core), many observers.
#[derive(Default)]
pub struct StatusBus {
    observers: Vec<Sender<StatusEvent>>,
}

impl StatusBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Registers a new observer and returns its receiving half.
    pub fn subscribe(&mut self) -> StatusObserver {
        let (tx, rx) = flume::unbounded();
        self.observers.push(tx);
        rx
    }

    /// Emits `event` to every currently-registered observer. Observers
    /// whose receiver has been dropped are pruned lazily.
    pub fn emit(&mut self, event: StatusEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}
