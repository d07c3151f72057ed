//! Network layer shared by the transports.
//!
//! This module contains:
//! - `stream`: the transport-agnostic byte stream with peer metadata
//! - `handshake`: the magic-byte exchange at the head of every stream
//! - `registry`: adopted raw side-band sockets keyed by connection id
//! - `kcp`: reliable-UDP driver with the host datagram filter hook
//! - `tls`: rustls connector/acceptor setup

pub mod handshake;
pub mod kcp;
pub mod registry;
pub mod stream;
pub mod tls;

pub use handshake::{ConnectionId, Greeting};
pub use registry::RawSocketRegistry;
pub use stream::RpcStream;
