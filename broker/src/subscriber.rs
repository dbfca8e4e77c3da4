//! Local subscriber handles (part of C8).
//!
//! `EndpointCore` delivers to anything implementing
//! `broker_core::endpoint_core::SubscriberSink`; this module is the one
//! concrete implementation the facade crate hands out, backed by a
//! `flume` channel so a subscriber can be drained either blocking,
//! async, or via a callback task — the same three shapes the teacher
//! crate exposes over its socket `recv()` methods.

use broker_core::data::Data;
use broker_core::endpoint_core::SubscriberSink;
use broker_core::topic::Topic;
use flume::Receiver;
use std::sync::Arc;

pub(crate) struct ChannelSink {
    tx: flume::Sender<(Topic, Data)>,
}

impl ChannelSink {
    pub(crate) fn new_pair() -> (Arc<Self>, Receiver<(Topic, Data)>) {
        let (tx, rx) = flume::unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl SubscriberSink for ChannelSink {
    fn deliver(&self, topic: &Topic, payload: &Data) {
        let _ = self.tx.send((topic.clone(), payload.clone()));
    }
}

/// A handle to a set of local subscriptions created by
/// `Endpoint::subscribe`. Dropping it detaches every topic it was
/// registered for.
pub struct Subscriber {
    rx: Receiver<(Topic, Data)>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscriber {
    pub(crate) fn new(rx: Receiver<(Topic, Data)>, detach: impl FnOnce() + Send + 'static) -> Self {
        Self { rx, detach: Some(Box::new(detach)) }
    }

    /// Awaits the next `(topic, payload)` delivered to this subscriber, in
    /// the order `EndpointCore` dispatched them (§4.4.2, invariant 1).
    /// Returns `None` once the endpoint has shut down.
    pub async fn recv(&self) -> Option<(Topic, Data)> {
        self.rx.recv_async().await.ok()
    }

    /// Blocking variant of `recv`, for use from a non-async thread.
    #[must_use]
    pub fn recv_blocking(&self) -> Option<(Topic, Data)> {
        self.rx.recv().ok()
    }

    /// Non-blocking poll: returns `None` if nothing has arrived yet
    /// without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<(Topic, Data)> {
        self.rx.try_recv().ok()
    }

    /// Detaches this subscriber from every topic it holds. Also happens
    /// automatically on drop.
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Spawns a task that invokes `callback` for every message delivered to
/// `subscriber`, until the endpoint shuts down. Returned so the caller can
/// keep the task alive for as long as it wants the callback to run.
pub fn drive_callback<F>(subscriber: Subscriber, mut callback: F) -> compio::runtime::Task<()>
where
    F: FnMut(Topic, Data) + 'static,
{
    compio::runtime::spawn(async move {
        while let Some((topic, payload)) = subscriber.recv().await {
            callback(topic, payload);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_delivers_clones() {
        let (sink, rx) = ChannelSink::new_pair();
        let t = Topic::try_from("a").unwrap();
        sink.deliver(&t, &Data::integer(1));
        let (topic, payload) = rx.try_recv().unwrap();
        assert_eq!(topic, t);
        assert_eq!(payload, Data::integer(1));
    }
}
