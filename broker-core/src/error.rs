//! Broker Error Types
//!
//! Comprehensive error handling for all broker operations.

use thiserror::Error;

/// Main error type for broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The two endpoints negotiated incompatible protocol versions during handshake.
    #[error("incompatible protocol version: local {local}, remote {remote}")]
    VersionIncompatible { local: u32, remote: u32 },

    /// A remote peer is known but currently unreachable (dropped, or its
    /// outbound queue overflowed).
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    /// An operation referenced a peer that does not exist (e.g. `unpeer` on
    /// an address that was never peered).
    #[error("peer invalid: {0}")]
    PeerInvalid(String),

    /// A connection attempt or handshake did not complete before the
    /// configured timeout.
    #[error("peer timeout: {0}")]
    PeerTimeout(String),

    /// `attach_master` was called for a store id that already has a local
    /// master.
    #[error("store id already in use: {0}")]
    StoreIdInUse(String),

    /// A store command or `find_master` query could not locate any master,
    /// local or remote, for the given store id.
    #[error("no master for store: {0}")]
    NoSuchMaster(String),

    /// A store command targeted a key whose existing value is a
    /// different (incompatible) `Data` shape than the command implies.
    #[error("type clash on store key")]
    TypeClash,

    /// A catch-all for conditions that don't warrant their own variant, but
    /// are still worth surfacing to the status bus.
    #[error("unspecified error: {0}")]
    Unspecified(String),
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Returns true if the condition is one a caller can expect the
    /// connection proxy to recover from on its own (i.e. it should not be
    /// treated as fatal to the overlay).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::PeerUnavailable(_) | Self::PeerTimeout(_))
    }

    /// Returns true if this error describes a peer connection problem
    /// (as opposed to a local API misuse or a store-level error).
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::VersionIncompatible { .. }
                | Self::PeerUnavailable(_)
                | Self::PeerInvalid(_)
                | Self::PeerTimeout(_)
        )
    }
}
