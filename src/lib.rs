#![deny(clippy::all)]
#![warn(unused_crate_dependencies)]

//! Transport layer of the lafrpc RPC runtime.
//!
//! Pluggable connection factories and listener handlers turn raw byte
//! streams (TCP, TLS, KCP, KCP+TLS, HTTP/HTTPS-upgraded) into framed
//! bidirectional data channels carrying RPC traffic, plus raw side-band
//! sockets for bulk transfer out of band of the RPC channel.

pub mod channel;
pub mod common;
pub mod config;
pub mod net;
pub mod rpc;
pub mod transport;

pub use channel::{DataChannel, Pole, PEER_CERTIFICATE, PEER_CERTIFICATE_HASH};
pub use net::handshake::ConnectionId;
pub use net::kcp::{DatagramFilter, KcpConfig};
pub use net::stream::RpcStream;
pub use rpc::{Peer, Rpc};
pub use transport::{
    AnyTransport, HttpTransport, KcpSslTransport, KcpTransport, SslTransport, TcpTransport,
};
