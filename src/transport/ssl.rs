//! TLS-over-TCP transport.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::*;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;

use crate::channel::DataChannel;
use crate::common::{parse_address, ParsedAddress};
use crate::config::TlsSettings;
use crate::net::handshake::ConnectionId;
use crate::net::registry::RawSocketRegistry;
use crate::net::stream::RpcStream;
use crate::net::tls::{build_tls_acceptor, build_tls_connector, peer_certificate_der, server_name};
use crate::rpc::Rpc;

use super::{effective_timeout, handle_request, open_channel, open_raw_socket, DEFAULT_CONNECT_TIMEOUT};

pub(crate) const SSL_TEMPLATE: &str = "ssl://{}:{}";

/// Identical to the TCP transport except every stream is wrapped in TLS,
/// and completed handshakes surface the peer certificate on the channel.
pub struct SslTransport {
    rpc: Weak<Rpc>,
    registry: Arc<RawSocketRegistry>,
    settings: TlsSettings,
    connector: TlsConnector,
}

impl SslTransport {
    pub fn new(rpc: &Arc<Rpc>, settings: TlsSettings) -> io::Result<Self> {
        let connector = build_tls_connector(&settings)?;
        Ok(Self {
            rpc: Arc::downgrade(rpc),
            registry: Arc::new(RawSocketRegistry::new()),
            settings,
            connector,
        })
    }

    pub fn can_handle(&self, address: &str) -> bool {
        crate::common::has_scheme(address, "ssl")
    }

    fn parse(&self, address: &str) -> Option<ParsedAddress> {
        match parse_address(&["ssl"], address) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!("rejecting address {}: {}", address, e);
                None
            }
        }
    }

    async fn create_connection(&self, host: &str, port: u16) -> Option<RpcStream> {
        let rpc = self.rpc.upgrade()?;
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
            let socket = match TcpStream::connect(addr).await {
                Ok(s) => s,
                Err(e) => {
                    debug!("connecting {} failed: {}", addr, e);
                    continue;
                }
            };
            if let Err(e) = socket.set_nodelay(true) {
                debug!("set_nodelay on {}: {}", addr, e);
            }
            match self.connector.connect(name.clone(), socket).await {
                Ok(tls) => {
                    let der = peer_certificate_der(tls.get_ref().1);
                    let mut stream = RpcStream::new(tls).with_peer_addr(addr);
                    if let Some(der) = der {
                        stream = stream.with_peer_certificate(der);
                    }
                    return Some(stream);
                }
                Err(e) => debug!("tls handshake with {} failed: {}", addr, e),
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

        let acceptor = match build_tls_acceptor(&self.settings) {
            Ok(a) => a,
            Err(e) => {
                warn!("tls acceptor setup failed: {}", e);
                return false;
            }
        };
        let listener = match TcpListener::bind(SocketAddr::new(host, parsed.port)).await {
            Ok(l) => l,
            Err(e) => {
                warn!("binding {}:{} failed: {}", parsed.host, parsed.port, e);
                return false;
            }
        };
        info!("ssl transport listening on {}:{}", parsed.host, parsed.port);

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
                    let acceptor = acceptor.clone();
                    let rpc = self.rpc.clone();
                    let registry = self.registry.clone();
                    handlers.spawn(async move {
                        let handshake = tokio::time::timeout(
                            DEFAULT_CONNECT_TIMEOUT,
                            acceptor.accept(socket),
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
                        handle_request(&rpc, &registry, stream, SSL_TEMPLATE).await;
                    });
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
    }
}
