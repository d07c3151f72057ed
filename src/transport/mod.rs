//! Connection factories and listener handlers for every supported stack.
//!
//! Each transport turns raw byte streams into framed [`DataChannel`]s or
//! adopted raw side-band sockets behind one uniform contract: `can_handle`,
//! `connect`, `make_raw_socket`, `take_raw_socket`, `start_server`.
//! Dispatch is a tagged enum over the concrete transports; the shared
//! handshake and accept logic is composed in from this module.

pub mod http;
pub mod kcp;
pub mod ssl;
pub mod tcp;

pub use http::HttpTransport;
pub use kcp::{KcpSslTransport, KcpTransport};
pub use ssl::SslTransport;
pub use tcp::TcpTransport;

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::*;

use crate::channel::{DataChannel, Pole};
use crate::common::format_address;
use crate::net::handshake::{self, ConnectionId, Greeting};
use crate::net::registry::RawSocketRegistry;
use crate::net::stream::RpcStream;
use crate::rpc::Rpc;

/// Connect timeout of owners built without settings; also bounds
/// server-side TLS handshakes.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A zero `connect` timeout selects the owner's configured fallback.
pub(crate) fn effective_timeout(timeout: Duration, fallback: Duration) -> Duration {
    if timeout.is_zero() {
        fallback
    } else {
        timeout
    }
}

/// All transports behind one tagged dispatch.
pub enum AnyTransport {
    Tcp(TcpTransport),
    Ssl(SslTransport),
    Kcp(KcpTransport),
    KcpSsl(KcpSslTransport),
    Http(HttpTransport),
}

impl AnyTransport {
    pub fn can_handle(&self, address: &str) -> bool {
        match self {
            AnyTransport::Tcp(t) => t.can_handle(address),
            AnyTransport::Ssl(t) => t.can_handle(address),
            AnyTransport::Kcp(t) => t.can_handle(address),
            AnyTransport::KcpSsl(t) => t.can_handle(address),
            AnyTransport::Http(t) => t.can_handle(address),
        }
    }

    /// Canonical address template for formatting peer addresses.
    pub fn address_template(&self) -> &'static str {
        match self {
            AnyTransport::Tcp(_) => "tcp://{}:{}",
            AnyTransport::Ssl(_) => "ssl://{}:{}",
            AnyTransport::Kcp(_) => "kcp://{}:{}",
            AnyTransport::KcpSsl(_) => "kcp+ssl://{}:{}",
            AnyTransport::Http(t) => t.address_template(),
        }
    }

    /// Open a positive-pole channel to `address`. A zero timeout selects
    /// the 5-second default.
    pub async fn connect(&self, address: &str, timeout: Duration) -> Option<DataChannel> {
        match self {
            AnyTransport::Tcp(t) => t.connect(address, timeout).await,
            AnyTransport::Ssl(t) => t.connect(address, timeout).await,
            AnyTransport::Kcp(t) => t.connect(address, timeout).await,
            AnyTransport::KcpSsl(t) => t.connect(address, timeout).await,
            AnyTransport::Http(t) => t.connect(address, timeout).await,
        }
    }

    /// Open a raw side-band socket to `address`; the returned id is
    /// communicated to the peer out of band.
    pub async fn make_raw_socket(&self, address: &str) -> Option<(RpcStream, ConnectionId)> {
        match self {
            AnyTransport::Tcp(t) => t.make_raw_socket(address).await,
            AnyTransport::Ssl(t) => t.make_raw_socket(address).await,
            AnyTransport::Kcp(t) => t.make_raw_socket(address).await,
            AnyTransport::KcpSsl(t) => t.make_raw_socket(address).await,
            AnyTransport::Http(t) => t.make_raw_socket(address).await,
        }
    }

    /// Adopt a raw socket a client previously announced under `id`.
    pub fn take_raw_socket(&self, id: &ConnectionId) -> Option<RpcStream> {
        match self {
            AnyTransport::Tcp(t) => t.take_raw_socket(id),
            AnyTransport::Ssl(t) => t.take_raw_socket(id),
            AnyTransport::Kcp(t) => t.take_raw_socket(id),
            AnyTransport::KcpSsl(t) => t.take_raw_socket(id),
            AnyTransport::Http(t) => t.take_raw_socket(id),
        }
    }

    /// Serve `address` until cancelled. Returns `false` only on setup
    /// failure.
    pub async fn start_server(&self, address: &str) -> bool {
        match self {
            AnyTransport::Tcp(t) => t.start_server(address).await,
            AnyTransport::Ssl(t) => t.start_server(address).await,
            AnyTransport::Kcp(t) => t.start_server(address).await,
            AnyTransport::KcpSsl(t) => t.start_server(address).await,
            AnyTransport::Http(t) => t.start_server(address).await,
        }
    }
}

/// Apply the owner's packet-size limit and the stream's TLS identity to a
/// freshly built channel.
pub(crate) fn setup_channel(rpc: &Arc<Rpc>, channel: &mut DataChannel) {
    channel.set_max_packet_size(rpc.max_packet_size());
    channel.attach_peer_certificate();
}

/// Client side of the channel handshake: announce the magic, wrap the
/// stream as a positive-pole channel.
pub(crate) async fn open_channel(rpc: &Arc<Rpc>, mut stream: RpcStream) -> Option<DataChannel> {
    if let Err(e) = handshake::send_channel_magic(&mut stream).await {
        debug!("handshaking failed on client side: {}", e);
        return None;
    }
    let mut channel = DataChannel::new(stream, Pole::Positive);
    setup_channel(rpc, &mut channel);
    Some(channel)
}

/// Client side of the raw-socket handshake.
pub(crate) async fn open_raw_socket(mut stream: RpcStream) -> Option<(RpcStream, ConnectionId)> {
    match handshake::open_raw_socket(&mut stream).await {
        Ok(id) => {
            debug!("raw socket handshake finished");
            Some((stream, id))
        }
        Err(e) => {
            debug!("handshaking failed on client side: {}", e);
            None
        }
    }
}

/// Format a peer endpoint with the transport's canonical template.
pub(crate) fn peer_address_string(template: &str, stream: &RpcStream) -> String {
    match stream.peer_addr() {
        Some(addr) => format_address(template, &addr.ip().to_string(), addr.port()),
        None => format_address(template, "unknown", 0),
    }
}

/// Shared server-side accept path: read the greeting and either register a
/// peer, adopt a raw socket, or drop the stream.
pub(crate) async fn handle_request(
    rpc: &Weak<Rpc>,
    registry: &Arc<RawSocketRegistry>,
    mut stream: RpcStream,
    template: &str,
) {
    let Some(rpc) = rpc.upgrade() else {
        debug!("rpc is gone");
        return;
    };
    match handshake::read_greeting(&mut stream).await {
        Ok(greeting) => dispatch_greeting(&rpc, registry, stream, template, greeting),
        Err(e) => debug!("handshaking failed on server side: {}", e),
    }
}

/// Act on an already-classified greeting. Split from [`handle_request`] so
/// the HTTP magic-code shortcut can feed in bytes it sniffed itself.
pub(crate) fn dispatch_greeting(
    rpc: &Arc<Rpc>,
    registry: &Arc<RawSocketRegistry>,
    stream: RpcStream,
    template: &str,
    greeting: Greeting,
) {
    match greeting {
        Greeting::Channel => {
            let address = peer_address_string(template, &stream);
            let mut channel = DataChannel::new(stream, Pole::Negative);
            setup_channel(rpc, &mut channel);
            debug!("got request from: {}", address);
            let _peer = rpc.prepare_peer(channel, None, &address);
        }
        Greeting::RawSocket(id) => {
            debug!("got raw socket: {:02x?}", id);
            registry.insert(id, stream);
        }
        Greeting::Unknown(magic) => {
            debug!("unknown magic {:02x} {:02x}, closing", magic[0], magic[1]);
            drop(stream);
        }
    }
}
