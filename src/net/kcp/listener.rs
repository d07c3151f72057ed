//! Server side of the KCP driver: one UDP socket, many conversations.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::*;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::stream::{KcpSession, KcpStream, KCP_OVERHEAD};
use super::{DatagramFilter, KcpConfig};

const ACCEPT_BACKLOG: usize = 64;

/// Accepts KCP conversations, demultiplexed by source address.
///
/// The first datagram from an unknown source establishes its conversation,
/// using the conversation id carried in the KCP header.
pub struct KcpListener {
    accept_rx: mpsc::Receiver<KcpStream>,
    local_addr: SocketAddr,
    driver: JoinHandle<()>,
}

impl KcpListener {
    pub async fn bind(
        config: KcpConfig,
        addr: SocketAddr,
        filter: Option<Arc<dyn DatagramFilter>>,
    ) -> io::Result<KcpListener> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let driver = tokio::spawn(drive_listener(socket, config, filter, accept_tx));
        Ok(KcpListener {
            accept_rx,
            local_addr,
            driver,
        })
    }

    pub async fn accept(&mut self) -> io::Result<KcpStream> {
        self.accept_rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "kcp listener driver gone"))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for KcpListener {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive_listener(
    socket: Arc<UdpSocket>,
    config: KcpConfig,
    filter: Option<Arc<dyn DatagramFilter>>,
    accept_tx: mpsc::Sender<KcpStream>,
) {
    let mut sessions: HashMap<SocketAddr, Arc<KcpSession>> = HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut tick = tokio::time::interval(Duration::from_millis(10));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, src)) => {
                    let mut data = buf[..n].to_vec();
                    let mut src = src;
                    if let Some(f) = &filter {
                        if f.filter(&mut data, &mut src) {
                            continue;
                        }
                    }
                    if data.len() < KCP_OVERHEAD {
                        continue;
                    }
                    if let Some(session) = sessions.get(&src) {
                        session.input(&data);
                        continue;
                    }
                    let conv = kcp::get_conv(&data);
                    let session = KcpSession::new(conv, socket.clone(), src, &config);
                    session.input(&data);
                    let stream = KcpStream::accepted(session.clone(), src);
                    match accept_tx.try_send(stream) {
                        Ok(()) => {
                            debug!("new kcp conversation {} from {}", conv, src);
                            sessions.insert(src, session);
                        }
                        Err(_) => {
                            debug!("accept backlog full, dropping conversation from {}", src);
                        }
                    }
                }
                // Transient receive errors (e.g. ICMP-induced) must not
                // tear down every conversation on the socket.
                Err(e) => debug!("kcp listener receive failed: {}", e),
            },
            _ = tick.tick() => {
                sessions.retain(|_, session| {
                    session.update();
                    !session.is_closed() && !session.idle_longer_than(config.session_expire)
                });
            }
        }
    }
}
