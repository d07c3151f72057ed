//! Plain TCP transport.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::*;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::channel::DataChannel;
use crate::common::{parse_address, ParsedAddress};
use crate::net::handshake::ConnectionId;
use crate::net::registry::RawSocketRegistry;
use crate::net::stream::RpcStream;
use crate::rpc::Rpc;

use super::{effective_timeout, handle_request, open_channel, open_raw_socket};

pub(crate) const TCP_TEMPLATE: &str = "tcp://{}:{}";

pub struct TcpTransport {
    rpc: Weak<Rpc>,
    registry: Arc<RawSocketRegistry>,
}

impl TcpTransport {
    pub fn new(rpc: &Arc<Rpc>) -> Self {
        Self {
            rpc: Arc::downgrade(rpc),
            registry: Arc::new(RawSocketRegistry::new()),
        }
    }

    pub fn can_handle(&self, address: &str) -> bool {
        crate::common::has_scheme(address, "tcp")
    }

    fn parse(&self, address: &str) -> Option<ParsedAddress> {
        match parse_address(&["tcp"], address) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!("rejecting address {}: {}", address, e);
                None
            }
        }
    }

    /// Connect and set `TCP_NODELAY`, trying resolved addresses in order.
    async fn create_connection(&self, host: &str, port: u16) -> Option<RpcStream> {
        let rpc = self.rpc.upgrade()?;
        let ips = rpc.dns_cache().resolve(host).await;
        for ip in ips {
            let addr = SocketAddr::new(ip, port);
            match TcpStream::connect(addr).await {
                Ok(socket) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!("set_nodelay on {}: {}", addr, e);
                    }
                    return Some(RpcStream::new(socket).with_peer_addr(addr));
                }
                Err(e) => debug!("connecting {} failed: {}", addr, e),
            }
        }
        None
    }

    pub async fn connect(&self, address: &str, timeout: Duration) -> Option<DataChannel> {
        let rpc = self.rpc.upgrade()?;
        let parsed = self.parse(address)?;
        tokio::time::timeout(effective_timeout(timeout, rpc.connect_timeout()), async {
            let stream = self.create_connection(&parsed.host, parsed.port).await?;
            open_channel(&rpc, stream).await
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn make_raw_socket(&self, address: &str) -> Option<(RpcStream, ConnectionId)> {
        let parsed = self.parse(address)?;
        let stream = self.create_connection(&parsed.host, parsed.port).await?;
        open_raw_socket(stream).await
    }

    pub fn take_raw_socket(&self, id: &ConnectionId) -> Option<RpcStream> {
        self.registry.take(id)
    }

    /// Number of raw sockets awaiting adoption.
    pub fn pending_raw_sockets(&self) -> usize {
        self.registry.len()
    }

    pub async fn start_server(&self, address: &str) -> bool {
        let Some(rpc) = self.rpc.upgrade() else {
            return false;
        };
        let Some(parsed) = self.parse(address) else {
            return false;
        };
        let host: IpAddr = match parsed.host.parse() {
            Ok(ip) => ip,
            Err(_) => {
                let resolved = rpc.dns_cache().resolve(&parsed.host).await;
                match resolved.first() {
                    Some(ip) => *ip,
                    None => {
                        warn!("cannot resolve {}", parsed.host);
                        return false;
                    }
                }
            }
        };
        drop(rpc);

        let listener = match TcpListener::bind(SocketAddr::new(host, parsed.port)).await {
            Ok(l) => l,
            Err(e) => {
                warn!("binding {}:{} failed: {}", parsed.host, parsed.port, e);
                return false;
            }
        };
        info!("tcp transport listening on {}:{}", parsed.host, parsed.port);

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!("set_nodelay on {}: {}", peer, e);
                    }
                    let stream = RpcStream::new(socket).with_peer_addr(peer);
                    let rpc = self.rpc.clone();
                    let registry = self.registry.clone();
                    handlers.spawn(async move {
                        handle_request(&rpc, &registry, stream, TCP_TEMPLATE).await;
                    });
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
    }
}
