//! Wire framing, bootstrap handshake, and the connection proxy (C5) for the
//! broker overlay.
//!
//! This crate is the only place that touches actual I/O: `broker-core`
//! dispatches on already-decoded `Message`s and never knows whether they
//! arrived over `compio::net::TcpStream` or the in-memory `MemTransport`
//! used by tests.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

pub mod codec;
pub mod connection;
pub mod handshake;
pub mod reconnect;
pub mod timeout;
pub mod transport;

pub use handshake::PROTOCOL_VERSION;
