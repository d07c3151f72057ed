//! Reliable-UDP transports: plain KCP and TLS stacked on top of KCP.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::*;
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;

use crate::channel::DataChannel;
use crate::common::{parse_address, ParsedAddress};
use crate::config::TlsSettings;
use crate::net::handshake::ConnectionId;
use crate::net::kcp::{KcpConfig, KcpListener, KcpStream};
use crate::net::registry::RawSocketRegistry;
use crate::net::stream::RpcStream;
use crate::net::tls::{build_tls_acceptor, build_tls_connector, peer_certificate_der, server_name};
use crate::rpc::Rpc;

use super::{effective_timeout, handle_request, open_channel, open_raw_socket, DEFAULT_CONNECT_TIMEOUT};

pub(crate) const KCP_TEMPLATE: &str = "kcp://{}:{}";
pub(crate) const KCP_SSL_TEMPLATE: &str = "kcp+ssl://{}:{}";

/// KCP transport. Sockets are created through the owner's datagram filter,
/// letting the RPC core multiplex unrelated UDP payloads on the same port.
pub struct KcpTransport {
    rpc: Weak<Rpc>,
    registry: Arc<RawSocketRegistry>,
    config: KcpConfig,
}

impl KcpTransport {
    pub fn new(rpc: &Arc<Rpc>, config: KcpConfig) -> Self {
        Self {
            rpc: Arc::downgrade(rpc),
            registry: Arc::new(RawSocketRegistry::new()),
            config,
        }
    }

    pub fn can_handle(&self, address: &str) -> bool {
        crate::common::has_scheme(address, "kcp")
    }

    fn parse(&self, address: &str) -> Option<ParsedAddress> {
        match parse_address(&["kcp"], address) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!("rejecting address {}: {}", address, e);
                None
            }
        }
    }

    async fn create_connection(&self, host: &str, port: u16) -> Option<RpcStream> {
        let rpc = self.rpc.upgrade()?;
        let filter = rpc.kcp_filter();
        let ips = rpc.dns_cache().resolve(host).await;
        for ip in ips {
            let addr = SocketAddr::new(ip, port);
            match KcpStream::connect(&self.config, addr, filter.clone()).await {
                Ok(stream) => return Some(RpcStream::new(stream).with_peer_addr(addr)),
                Err(e) => debug!("kcp connect to {} failed: {}", addr, e),
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

    pub async fn start_server(&self, address: &str) -> bool {
        let Some((host, parsed)) = resolve_bind_host(&self.rpc, |a| self.parse(a), address).await
        else {
            return false;
        };
        let Some(rpc) = self.rpc.upgrade() else {
            return false;
        };
        let mut listener = match KcpListener::bind(
            self.config.clone(),
            SocketAddr::new(host, parsed.port),
            rpc.kcp_filter(),
        )
        .await
        {
            Ok(l) => l,
            Err(e) => {
                warn!("binding {}:{} failed: {}", parsed.host, parsed.port, e);
                return false;
            }
        };
        drop(rpc);
        info!("kcp transport listening on {}:{}", parsed.host, parsed.port);

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok(s) => s,
                        Err(e) => {
                            error!("accept: {}", e);
                            continue;
                        }
                    };
                    let peer = stream.peer_addr();
                    let stream = RpcStream::new(stream).with_peer_addr(peer);
                    let rpc = self.rpc.clone();
                    let registry = self.registry.clone();
                    handlers.spawn(async move {
                        handle_request(&rpc, &registry, stream, KCP_TEMPLATE).await;
                    });
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
    }
}

/// TLS stacked on top of a KCP stream. The client handshake runs inline
/// after the conversation opens; a failed handshake discards the stream.
pub struct KcpSslTransport {
    rpc: Weak<Rpc>,
    registry: Arc<RawSocketRegistry>,
    config: KcpConfig,
    settings: TlsSettings,
    connector: TlsConnector,
}

impl KcpSslTransport {
    pub fn new(rpc: &Arc<Rpc>, config: KcpConfig, settings: TlsSettings) -> io::Result<Self> {
        let connector = build_tls_connector(&settings)?;
        Ok(Self {
            rpc: Arc::downgrade(rpc),
            registry: Arc::new(RawSocketRegistry::new()),
            config,
            settings,
            connector,
        })
    }

    pub fn can_handle(&self, address: &str) -> bool {
        crate::common::has_scheme(address, "kcp+ssl") || crate::common::has_scheme(address, "ssl+kcp")
    }

    fn parse(&self, address: &str) -> Option<ParsedAddress> {
        match parse_address(&["kcp+ssl", "ssl+kcp"], address) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!("rejecting address {}: {}", address, e);
                None
            }
        }
    }

    async fn create_connection(&self, host: &str, port: u16) -> Option<RpcStream> {
        let rpc = self.rpc.upgrade()?;
        let filter = rpc.kcp_filter();
        let name = match server_name(host) {
            Ok(n) => n,
            Err(e) => {
                debug!("bad TLS server name {}: {}", host, e);
                return None;
            }
        };
        let ips = rpc.dns_cache().resolve(host).await;
        for ip in ips {
            let addr = SocketAddr::new(ip, port);
            let kcp = match KcpStream::connect(&self.config, addr, filter.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    debug!("kcp connect to {} failed: {}", addr, e);
                    continue;
                }
            };
            match self.connector.connect(name.clone(), kcp).await {
                Ok(tls) => {
                    let der = peer_certificate_der(tls.get_ref().1);
                    let mut stream = RpcStream::new(tls).with_peer_addr(addr);
                    if let Some(der) = der {
                        stream = stream.with_peer_certificate(der);
                    }
                    return Some(stream);
                }
                Err(e) => debug!("tls-over-kcp handshake with {} failed: {}", addr, e),
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

    pub async fn start_server(&self, address: &str) -> bool {
        let Some((host, parsed)) = resolve_bind_host(&self.rpc, |a| self.parse(a), address).await
        else {
            return false;
        };
        let acceptor = match build_tls_acceptor(&self.settings) {
            Ok(a) => a,
            Err(e) => {
                warn!("tls acceptor setup failed: {}", e);
                return false;
            }
        };
        let Some(rpc) = self.rpc.upgrade() else {
            return false;
        };
        let mut listener = match KcpListener::bind(
            self.config.clone(),
            SocketAddr::new(host, parsed.port),
            rpc.kcp_filter(),
        )
        .await
        {
            Ok(l) => l,
            Err(e) => {
                warn!("binding {}:{} failed: {}", parsed.host, parsed.port, e);
                return false;
            }
        };
        drop(rpc);
        info!(
            "kcp+ssl transport listening on {}:{}",
            parsed.host, parsed.port
        );

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok(s) => s,
                        Err(e) => {
                            error!("accept: {}", e);
                            continue;
                        }
                    };
                    let peer = stream.peer_addr();
                    let acceptor = acceptor.clone();
                    let rpc = self.rpc.clone();
                    let registry = self.registry.clone();
                    handlers.spawn(async move {
                        let handshake = tokio::time::timeout(
                            DEFAULT_CONNECT_TIMEOUT,
                            acceptor.accept(stream),
                        );
                        let tls = match handshake.await {
                            Ok(Ok(tls)) => tls,
                            Ok(Err(e)) => {
                                debug!("tls accept from {}: {}", peer, e);
                                return;
                            }
                            Err(_) => {
                                debug!("tls handshake timeout from {}", peer);
                                return;
                            }
                        };
                        let der = peer_certificate_der(tls.get_ref().1);
                        let mut stream = RpcStream::new(tls).with_peer_addr(peer);
                        if let Some(der) = der {
                            stream = stream.with_peer_certificate(der);
                        }
                        handle_request(&rpc, &registry, stream, KCP_SSL_TEMPLATE).await;
                    });
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
    }
}

/// Resolve the bind host for a server address: numeric literals directly,
/// otherwise the first DNS cache entry.
async fn resolve_bind_host<P>(
    rpc: &Weak<Rpc>,
    parse: P,
    address: &str,
) -> Option<(IpAddr, ParsedAddress)>
where
    P: FnOnce(&str) -> Option<ParsedAddress>,
{
    let rpc = rpc.upgrade()?;
    let parsed = parse(address)?;
    if let Ok(ip) = parsed.host.parse() {
        return Some((ip, parsed));
    }
    let resolved = rpc.dns_cache().resolve(&parsed.host).await;
    match resolved.first() {
        Some(ip) => Some((*ip, parsed)),
        None => {
            warn!("cannot resolve {}", parsed.host);
            None
        }
    }
}
