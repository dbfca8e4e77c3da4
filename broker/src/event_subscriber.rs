//! Public wrapper around the status/error bus (C6).

use broker_core::status::{StatusEvent, StatusObserver};

/// Observes peer lifecycle notifications (`peer_added`, `peer_removed`,
/// `peer_lost`, `peer_unavailable`, `peer_invalid`) emitted by one
/// `Endpoint`. Obtained from `Endpoint::make_event_subscriber`.
pub struct EventSubscriber {
    observer: StatusObserver,
}

impl EventSubscriber {
    pub(crate) fn new(observer: StatusObserver) -> Self {
        Self { observer }
    }

    /// Awaits the next status event. Returns `None` once the endpoint has
    /// shut down and the status bus has no more senders.
    pub async fn recv(&self) -> Option<StatusEvent> {
        self.observer.recv_async().await.ok()
    }

    /// Blocking variant of `recv`, for use from a non-async thread.
    #[must_use]
    pub fn recv_blocking(&self) -> Option<StatusEvent> {
        self.observer.recv().ok()
    }

    /// Non-blocking poll.
    #[must_use]
    pub fn try_recv(&self) -> Option<StatusEvent> {
        self.observer.try_recv().ok()
    }
}
