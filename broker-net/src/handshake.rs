//! Connection bootstrap (§4.5, "bootstrap" state of C5): a 32-bit protocol
//! version exchange followed by a `Message::PeerHello` frame exchange,
//! mirroring the two-phase ZMTP greeting/ready sequence the teacher's
//! `greeting.rs` implements, but collapsed to this overlay's own simpler
//! version number instead of a security-mechanism negotiation.

use crate::codec::{encode_frame, FrameDecoder};
use crate::timeout::{read_exact_with_timeout, read_with_timeout, write_all_with_timeout};
use crate::transport::Transport;
use broker_core::error::BrokerError;
use broker_core::message::Message;
use std::time::Duration;

/// Wire protocol version for this crate. Bumped whenever `Message`'s wire
/// encoding changes in a way that isn't backward compatible.
pub const PROTOCOL_VERSION: u32 = 1;

/// Performs the bootstrap handshake over `transport`: both sides exchange
/// a 4-byte big-endian protocol version, then `local_hello`, and the
/// peer's `Message::PeerHello` is returned.
///
/// # Errors
/// Returns `BrokerError::VersionIncompatible` if the remote's version
/// doesn't match ours, `BrokerError::PeerTimeout` if `deadline` elapses
/// before the exchange completes, or `BrokerError::PeerInvalid` if the
/// remote sends anything other than `PeerHello` as its first frame.
pub async fn perform_handshake<T: Transport>(
    transport: &mut T,
    local_hello: Message,
    deadline: Option<Duration>,
) -> Result<Message, BrokerError> {
    let io_err = |e: std::io::Error| BrokerError::PeerTimeout(e.to_string());

    let write_version = PROTOCOL_VERSION.to_be_bytes().to_vec();
    write_all_with_timeout(transport, write_version, deadline)
        .await
        .map_err(io_err)?
        .0
        .map_err(io_err)?;

    let read_version = vec![0u8; 4];
    let compio::BufResult(res, read_version) =
        read_exact_with_timeout(transport, read_version, deadline).await.map_err(io_err)?;
    res.map_err(io_err)?;
    let remote_version = u32::from_be_bytes(read_version.try_into().unwrap());
    if remote_version != PROTOCOL_VERSION {
        return Err(BrokerError::VersionIncompatible { local: PROTOCOL_VERSION, remote: remote_version });
    }

    let frame = encode_frame(&local_hello).map_err(|e| BrokerError::Unspecified(e.to_string()))?;
    write_all_with_timeout(transport, frame, deadline).await.map_err(io_err)?.0.map_err(io_err)?;

    let mut decoder = FrameDecoder::new();
    loop {
        let chunk = vec![0u8; 4096];
        let compio::BufResult(res, chunk) = read_with_timeout(transport, chunk, deadline).await.map_err(io_err)?;
        let n = res.map_err(io_err)?;
        if n == 0 {
            return Err(BrokerError::PeerInvalid("connection closed during handshake".into()));
        }
        decoder.feed(&chunk[..n]);
        if let Some(msg) = decoder.try_decode().map_err(|e| BrokerError::PeerInvalid(e.to_string()))? {
            return match msg {
                Message::PeerHello { .. } => Ok(msg),
                other => Err(BrokerError::PeerInvalid(format!("expected PeerHello, got {other:?}"))),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemTransport;
    use broker_core::routing::OriginId;
    use broker_core::topic::Topic;

    fn hello(name: &str) -> Message {
        Message::PeerHello { name: name.to_owned(), advertised: Vec::<Topic>::new(), routes: Vec::new() }
    }

    #[compio::test]
    async fn handshake_exchanges_hello_both_ways() {
        let (mut a, mut b) = MemTransport::pair();
        let (res_a, res_b) = futures::join!(
            perform_handshake(&mut a, hello("mercury"), None),
            perform_handshake(&mut b, hello("venus"), None),
        );
        let hello_from_b = res_a.unwrap();
        let hello_from_a = res_b.unwrap();
        assert!(matches!(hello_from_b, Message::PeerHello { name, .. } if name == "venus"));
        assert!(matches!(hello_from_a, Message::PeerHello { name, .. } if name == "mercury"));
        let _ = OriginId::random();
    }
}
