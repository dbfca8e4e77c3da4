//! A peer-to-peer publish/subscribe broker with TTL-routed subscription
//! dissemination and master/clone key-value store replication.
//!
//! An [`Endpoint`] is a single node in the overlay: it holds local
//! subscribers, peers over TCP, and any store roles it has joined. Peers
//! learn about each other's subscriptions through a bootstrap handshake and
//! keep forwarding tables in sync as links come and go; publishes ride the
//! shortest known path rather than flooding every link.
//!
//! ```no_run
//! use broker::{Endpoint, EndpointConfig};
//! use broker_core::data::Data;
//! use broker_core::message::PublishFlags;
//! use broker_core::topic::Topic;
//!
//! # async fn run() {
//! let topic = Topic::try_from("weather/oslo").unwrap();
//! let node = Endpoint::new(EndpointConfig::default());
//! let sub = node.subscribe(&[topic.clone()]).await;
//! node.publish(topic, Data::string("17C"), PublishFlags::SELF).await;
//! let (topic, payload) = sub.recv().await.unwrap();
//! # }
//! ```

#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dev_tracing;
pub mod endpoint;
pub mod event_subscriber;
pub mod subscriber;

pub use config::EndpointConfig;
pub use endpoint::Endpoint;
pub use event_subscriber::EventSubscriber;
pub use subscriber::Subscriber;

/// Re-exports of the `broker-core` types most callers need alongside
/// [`Endpoint`], so a simple user never has to add `broker-core` as a
/// direct dependency.
pub mod prelude {
    pub use crate::config::EndpointConfig;
    pub use crate::endpoint::Endpoint;
    pub use crate::event_subscriber::EventSubscriber;
    pub use crate::subscriber::Subscriber;

    pub use broker_core::data::Data;
    pub use broker_core::error::{BrokerError, Result};
    pub use broker_core::message::PublishFlags;
    pub use broker_core::peer::PeerHandle;
    pub use broker_core::status::StatusEvent;
    pub use broker_core::store::{StoreCommand, StoreId, StoreRole};
    pub use broker_core::topic::Topic;
}
