//! Wire message types (§6).
//!
//! These are the application-level payloads exchanged between peers once
//! the protocol-version handshake has succeeded. `broker-net` owns the
//! actual byte framing (length prefix + encoding); this module only
//! defines the shapes, since `EndpointCore` dispatches on them without
//! caring how they arrived.

use crate::data::Data;
use crate::routing::{OriginId, Ttl};
use crate::store::StoreCommand;
use crate::topic::Topic;
use serde::{Deserialize, Serialize};

/// Flags on a `PUBLISH` frame controlling fan-out (GLOSSARY; §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublishFlags(u8);

impl PublishFlags {
    /// Deliver to local subscribers.
    pub const SELF: Self = Self(1 << 0);
    /// Forward to remote peers via C3.
    pub const PEERS: Self = Self(1 << 1);
    /// Publish even if there is no known subscriber (used by store
    /// commands, which must reach the master regardless of whether this
    /// endpoint can see a local subscriber for the id's topic).
    pub const UNSOLICITED: Self = Self(1 << 2);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for PublishFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// One application-level message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Sent immediately after the protocol-version handshake completes.
    PeerHello {
        name: String,
        advertised: Vec<Topic>,
        routes: Vec<(Topic, OriginId, Ttl)>,
    },
    Publish {
        topic: Topic,
        payload: Data,
        flags: PublishFlags,
    },
    Subscribe {
        topic: Topic,
        origin: OriginId,
        ttl: Ttl,
    },
    Unsubscribe { topic: Topic, origin: OriginId },
    StoreCmd {
        store_id: String,
        command: StoreCommand,
    },
}
