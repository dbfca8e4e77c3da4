//! Endpoint configuration (SPEC_FULL §4.9).
//!
//! Collects the tunables the distilled spec leaves implicit: the fixed
//! retry interval `peer_async` uses (§4.5), the bounded per-peer outbound
//! queue depth (§5), the handshake timeout, and the initial
//! `AUTO_PUBLISH`/`AUTO_ADVERTISE` policy switches (§4.4.4). Builder style
//! follows the teacher crate's `SocketOptions`.

use std::time::Duration;

/// Endpoint-wide configuration.
///
/// # Examples
///
/// ```
/// use broker::config::EndpointConfig;
/// use std::time::Duration;
///
/// let config = EndpointConfig::default()
///     .with_auto_publish(false)
///     .with_retry_interval(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Whether publishes are forwarded to peers without needing an
    /// explicit entry in `pub_acls` (§4.4.4).
    pub auto_publish: bool,
    /// Whether local subscriptions are advertised to peers without an
    /// explicit entry in `advert_acls` (§4.4.4).
    pub auto_advertise: bool,
    /// Depth of the per-peer outbound backlog `EndpointCore` holds beyond
    /// the transport's own queue before drop-oldest kicks in (§5).
    pub outbound_queue_depth: usize,
    /// Fixed retry interval used by `peer_async` (§4.5: "no backoff in
    /// v1").
    pub retry_interval: Duration,
    /// Maximum time the bootstrap handshake (§4.4.1) may take before a
    /// connection attempt is abandoned as `peer_timeout`.
    pub handshake_timeout: Option<Duration>,
    /// Display name this endpoint announces in `PEER_HELLO` (§6).
    pub display_name: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            auto_publish: true,
            auto_advertise: true,
            outbound_queue_depth: 1024,
            retry_interval: Duration::from_secs(1),
            handshake_timeout: Some(Duration::from_secs(10)),
            display_name: "endpoint".to_string(),
        }
    }
}

impl EndpointConfig {
    #[must_use]
    pub fn with_auto_publish(mut self, on: bool) -> Self {
        self.auto_publish = on;
        self
    }

    #[must_use]
    pub fn with_auto_advertise(mut self, on: bool) -> Self {
        self.auto_advertise = on;
        self
    }

    #[must_use]
    pub const fn with_outbound_queue_depth(mut self, depth: usize) -> Self {
        self.outbound_queue_depth = depth;
        self
    }

    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}
