//! HTTP transport: the RPC handshake embedded in an HTTP upgrade.
//!
//! One port serves three kinds of traffic:
//! - `POST <rpc path>` with `Connection: Upgrade` / `Upgrade: lafrpc`
//!   promotes the connection to an RPC byte stream (101 Switching
//!   Protocols), after which the shared magic-byte handshake applies;
//! - connections whose very first bytes are already the RPC magic skip
//!   HTTP parsing entirely (the magic-code shortcut);
//! - every other path is served as static content from `root_dir`.

use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{header, HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::*;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;

use crate::channel::DataChannel;
use crate::common::{parse_address, ParsedAddress};
use crate::config::{HttpSettings, TlsSettings};
use crate::net::handshake::{self, ConnectionId, CHANNEL_MAGIC, RAW_SOCKET_MAGIC};
use crate::net::registry::RawSocketRegistry;
use crate::net::stream::{Io, RpcStream};
use crate::net::tls::{build_tls_acceptor, build_tls_connector, peer_certificate_der, server_name};
use crate::rpc::Rpc;

use super::{
    dispatch_greeting, effective_timeout, open_channel, open_raw_socket, DEFAULT_CONNECT_TIMEOUT,
};

/// Token carried in the `Upgrade` header.
pub const UPGRADE_PROTOCOL: &str = "lafrpc";

pub(crate) const HTTP_TEMPLATE: &str = "http://{}:{}";
pub(crate) const HTTPS_TEMPLATE: &str = "https://{}:{}";

const HTTP_SCHEMES: &[&str] = &["http", "https"];

pub struct HttpTransport {
    rpc: Weak<Rpc>,
    registry: Arc<RawSocketRegistry>,
    root_dir: PathBuf,
    tls: Option<TlsSettings>,
    connector: TlsConnector,
}

impl HttpTransport {
    /// `tls` provides both the server certificate for `https://` listeners
    /// and the client-side trust settings; without it, clients verify
    /// against the bundled web roots and `https://` servers cannot start.
    pub fn new(
        rpc: &Arc<Rpc>,
        http: HttpSettings,
        tls: Option<TlsSettings>,
    ) -> io::Result<Self> {
        let connector = build_tls_connector(tls.as_ref().unwrap_or(&TlsSettings::default()))?;
        Ok(Self {
            rpc: Arc::downgrade(rpc),
            registry: Arc::new(RawSocketRegistry::new()),
            root_dir: PathBuf::from(http.root_dir),
            tls,
            connector,
        })
    }

    pub fn can_handle(&self, address: &str) -> bool {
        crate::common::has_scheme(address, "http") || crate::common::has_scheme(address, "https")
    }

    pub fn address_template(&self) -> &'static str {
        if self.tls.is_some() {
            HTTPS_TEMPLATE
        } else {
            HTTP_TEMPLATE
        }
    }

    fn parse(&self, address: &str) -> Option<ParsedAddress> {
        match parse_address(HTTP_SCHEMES, address) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!("rejecting address {}: {}", address, e);
                None
            }
        }
    }

    /// Run the upgrade request and hand back the hijacked byte stream.
    async fn http_connect(&self, address: &str) -> Option<RpcStream> {
        let rpc = self.rpc.upgrade()?;
        let parsed = self.parse(address)?;
        let secure = parsed.scheme == "https";

        let ips = rpc.dns_cache().resolve(&parsed.host).await;
        drop(rpc);
        let mut socket = None;
        for ip in ips {
            let addr = SocketAddr::new(ip, parsed.port);
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    socket = Some((s, addr));
                    break;
                }
                Err(e) => debug!("connecting {} failed: {}", addr, e),
            }
        }
        let (socket, addr) = socket?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("set_nodelay on {}: {}", addr, e);
        }

        let host_header = crate::common::format_address("{}:{}", &parsed.host, parsed.port);
        if secure {
            let name = match server_name(&parsed.host) {
                Ok(n) => n,
                Err(e) => {
                    debug!("bad TLS server name {}: {}", parsed.host, e);
                    return None;
                }
            };
            let tls = match self.connector.connect(name, socket).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!("tls handshake with {} failed: {}", addr, e);
                    return None;
                }
            };
            let upgraded = request_upgrade(tls, &host_header, &parsed.path).await?;
            let tls = recover_io::<tokio_rustls::client::TlsStream<TcpStream>>(upgraded)?;
            let der = peer_certificate_der(tls.get_ref().1);
            let mut stream = RpcStream::new(tls).with_peer_addr(addr);
            if let Some(der) = der {
                stream = stream.with_peer_certificate(der);
            }
            Some(stream)
        } else {
            let upgraded = request_upgrade(socket, &host_header, &parsed.path).await?;
            let socket = recover_io::<TcpStream>(upgraded)?;
            Some(RpcStream::new(socket).with_peer_addr(addr))
        }
    }

    pub async fn connect(&self, address: &str, timeout: Duration) -> Option<DataChannel> {
        let rpc = self.rpc.upgrade()?;
        tokio::time::timeout(effective_timeout(timeout, rpc.connect_timeout()), async {
            let stream = self.http_connect(address).await?;
            open_channel(&rpc, stream).await
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn make_raw_socket(&self, address: &str) -> Option<(RpcStream, ConnectionId)> {
        let stream = self.http_connect(address).await?;
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
        if self.rpc.upgrade().is_none() {
            return false;
        }
        let Some(parsed) = self.parse(address) else {
            return false;
        };
        let host: IpAddr = match parsed.host.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!("require an ip address to start the http server");
                return false;
            }
        };
        let secure = parsed.scheme == "https";
        let acceptor = if secure {
            let Some(tls) = &self.tls else {
                warn!("https server requires tls settings");
                return false;
            };
            match build_tls_acceptor(tls) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!("tls acceptor setup failed: {}", e);
                    return false;
                }
            }
        } else {
            None
        };

        let listener = match TcpListener::bind(SocketAddr::new(host, parsed.port)).await {
            Ok(l) => l,
            Err(e) => {
                warn!("binding {}:{} failed: {}", parsed.host, parsed.port, e);
                return false;
            }
        };
        info!(
            "http transport listening on {}://{}:{}{}",
            parsed.scheme, parsed.host, parsed.port, parsed.path
        );

        let ctx = Arc::new(HttpServerContext {
            rpc: self.rpc.clone(),
            registry: self.registry.clone(),
            rpc_path: parsed.path.clone(),
            root_dir: self.root_dir.clone(),
            template: if secure { HTTPS_TEMPLATE } else { HTTP_TEMPLATE },
        });

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
                    let ctx = ctx.clone();
                    let acceptor = acceptor.clone();
                    handlers.spawn(async move {
                        match acceptor {
                            Some(acceptor) => {
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
                                serve_stream(ctx, tls, peer, der).await;
                            }
                            None => serve_stream(ctx, socket, peer, None).await,
                        }
                    });
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
    }
}

struct HttpServerContext {
    rpc: Weak<Rpc>,
    registry: Arc<RawSocketRegistry>,
    rpc_path: String,
    root_dir: PathBuf,
    template: &'static str,
}

/// Serve one accepted connection, trying the magic-code shortcut before
/// parsing HTTP.
async fn serve_stream<S: Io + 'static>(
    ctx: Arc<HttpServerContext>,
    stream: S,
    peer: SocketAddr,
    peer_cert: Option<Vec<u8>>,
) {
    let mut stream = RpcStream::new(stream).with_peer_addr(peer);
    if let Some(der) = peer_cert {
        stream = stream.with_peer_certificate(der);
    }

    let mut magic = [0u8; 2];
    if let Err(e) = stream.read_exact(&mut magic).await {
        debug!("connection from {} ended before any data: {}", peer, e);
        return;
    }

    if magic == CHANNEL_MAGIC || magic == RAW_SOCKET_MAGIC {
        let Some(rpc) = ctx.rpc.upgrade() else {
            debug!("rpc is gone");
            return;
        };
        match handshake::classify_magic(&mut stream, magic).await {
            Ok(greeting) => {
                dispatch_greeting(&rpc, &ctx.registry, stream, ctx.template, greeting)
            }
            Err(e) => debug!("handshaking failed on server side: {}", e),
        }
        return;
    }

    // Not RPC magic: replay the two bytes and hand the stream to HTTP.
    stream.prepend(magic.to_vec());
    let service_ctx = ctx.clone();
    let service = service_fn(move |req| {
        let ctx = service_ctx.clone();
        async move { router(ctx, peer, req).await }
    });
    if let Err(e) = server_http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!("http connection from {} ended: {}", peer, e);
    }
}

async fn router(
    ctx: Arc<HttpServerContext>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let resp = if method == Method::POST && path == ctx.rpc_path {
        handle_upgrade(ctx, peer, req)
    } else if method == Method::GET || method == Method::HEAD {
        serve_static(&ctx.root_dir, &path, method == Method::HEAD).await
    } else {
        status_response(StatusCode::NOT_FOUND)
    };

    Ok(resp)
}

/// Promote an upgrade request to an RPC byte stream.
fn handle_upgrade(
    ctx: Arc<HttpServerContext>,
    peer: SocketAddr,
    mut req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if !connection_requests_upgrade(req.headers()) {
        return status_response(StatusCode::NOT_FOUND);
    }
    if !upgrade_is_lafrpc(req.headers()) {
        return status_response(StatusCode::NOT_FOUND);
    }
    let Some(rpc) = ctx.rpc.upgrade() else {
        return status_response(StatusCode::SERVICE_UNAVAILABLE);
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(u) => u,
            Err(e) => {
                debug!("upgrade from {} failed: {}", peer, e);
                return;
            }
        };
        let mut stream = match upgraded.downcast::<TokioIo<RpcStream>>() {
            Ok(parts) => {
                let mut stream = parts.io.into_inner();
                if !parts.read_buf.is_empty() {
                    stream.prepend(parts.read_buf.to_vec());
                }
                stream
            }
            Err(upgraded) => {
                // Unexpected io type; keep the connection usable anyway.
                debug!("upgraded stream lost its transport metadata");
                RpcStream::new(TokioIo::new(upgraded)).with_peer_addr(peer)
            }
        };
        match handshake::read_greeting(&mut stream).await {
            Ok(greeting) => {
                dispatch_greeting(&rpc, &ctx.registry, stream, ctx.template, greeting)
            }
            Err(e) => debug!("handshaking failed on server side: {}", e),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, UPGRADE_PROTOCOL)
        .body(Full::default())
        .expect("static response")
}

fn connection_requests_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false)
}

fn upgrade_is_lafrpc(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case(UPGRADE_PROTOCOL))
        .unwrap_or(false)
}

/// Serve a file from the document root; anything unresolvable is 404.
async fn serve_static(root: &Path, request_path: &str, head: bool) -> Response<Full<Bytes>> {
    let rel = request_path.trim_start_matches('/');
    let mut file_path = if rel.is_empty() {
        root.join("index.html")
    } else {
        root.join(rel)
    };
    if file_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return status_response(StatusCode::NOT_FOUND);
    }
    if let Ok(meta) = tokio::fs::metadata(&file_path).await {
        if meta.is_dir() {
            file_path = file_path.join("index.html");
        }
    }
    match tokio::fs::read(&file_path).await {
        Ok(data) => {
            let builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type_for(&file_path))
                .header(header::CONTENT_LENGTH, data.len());
            let body = if head {
                Full::default()
            } else {
                Full::new(Bytes::from(data))
            };
            builder.body(body).expect("static response")
        }
        Err(_) => status_response(StatusCode::NOT_FOUND),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(
            status.canonical_reason().unwrap_or("error"),
        )))
        .expect("static response")
}

/// Client side: send the upgrade request over an established stream and
/// return the hijacked connection.
async fn request_upgrade<S: Io + 'static>(io: S, host: &str, path: &str) -> Option<Upgraded> {
    let (mut sender, conn) = match client_http1::handshake(TokioIo::new(io)).await {
        Ok(v) => v,
        Err(e) => {
            debug!("http handshake failed: {}", e);
            return None;
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("http connection task ended: {}", e);
        }
    });

    let req = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::HOST, host)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, UPGRADE_PROTOCOL)
        .body(Empty::<Bytes>::new())
        .expect("static request");

    let response = match sender.send_request(req).await {
        Ok(r) => r,
        Err(e) => {
            debug!("upgrade request failed: {}", e);
            return None;
        }
    };
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(
            "server replied {}, it is a plain http server without {} support",
            response.status(),
            UPGRADE_PROTOCOL
        );
        return None;
    }
    match hyper::upgrade::on(response).await {
        Ok(upgraded) => Some(upgraded),
        Err(e) => {
            warn!("got invalid upgraded stream: {}", e);
            None
        }
    }
}

/// Unwrap the hijacked connection back into its transport stream. A 101
/// response must not carry a body; leftover bytes after the headers are a
/// protocol violation.
fn recover_io<T: Io + 'static>(upgraded: Upgraded) -> Option<T> {
    match upgraded.downcast::<TokioIo<T>>() {
        Ok(parts) => {
            if !parts.read_buf.is_empty() {
                warn!("the server should not send a body");
                return None;
            }
            Some(parts.io.into_inner())
        }
        Err(_) => {
            warn!("got invalid stream");
            None
        }
    }
}
