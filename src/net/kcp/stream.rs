//! KCP conversation state and the stream facade over it.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use kcp::Kcp;
use log::*;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{DatagramFilter, KcpConfig};

/// Datagrams shorter than the KCP header cannot belong to a conversation.
pub(super) const KCP_OVERHEAD: usize = 24;

/// Sink KCP flushes segments into: fire-and-forget UDP sends.
struct UdpOutput {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl Write for UdpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.socket.try_send_to(buf, self.peer) {
            Ok(n) => Ok(n),
            // Socket buffer full: drop the segment, KCP retransmits it.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(buf.len()),
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct KcpCore {
    kcp: Kcp<UdpOutput>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    closed: bool,
    last_active: Instant,
}

impl KcpCore {
    fn wake_reader(&mut self) {
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }
}

/// One KCP conversation, shared between its stream facade and the socket
/// driver task. The mutex is never held across a suspension point.
pub(super) struct KcpSession {
    core: Mutex<KcpCore>,
    epoch: Instant,
    send_backlog: usize,
}

impl KcpSession {
    pub(super) fn new(
        conv: u32,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        config: &KcpConfig,
    ) -> Arc<Self> {
        let output = UdpOutput { socket, peer };
        let mut kcp = Kcp::new_stream(conv, output);
        let _ = kcp.set_mtu(config.mtu);
        kcp.set_wndsize(config.snd_wnd, config.rcv_wnd);
        kcp.set_nodelay(
            config.nodelay,
            config.interval,
            config.resend,
            config.congestion_off,
        );
        Arc::new(Self {
            core: Mutex::new(KcpCore {
                kcp,
                read_waker: None,
                write_waker: None,
                closed: false,
                last_active: Instant::now(),
            }),
            epoch: Instant::now(),
            send_backlog: config.snd_wnd as usize * 2,
        })
    }

    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Feed one received datagram into the state machine.
    pub(super) fn input(&self, data: &[u8]) {
        let now = self.now_ms();
        let mut core = self.core.lock().expect("kcp lock poisoned");
        if let Err(e) = core.kcp.input(data) {
            debug!("kcp input rejected: {}", e);
            return;
        }
        let _ = core.kcp.update(now);
        core.last_active = Instant::now();
        core.wake_reader();
        core.wake_writer();
    }

    /// Tick the retransmission clock.
    pub(super) fn update(&self) {
        let now = self.now_ms();
        let mut core = self.core.lock().expect("kcp lock poisoned");
        let _ = core.kcp.update(now);
        if core.kcp.wait_snd() < self.send_backlog {
            core.wake_writer();
        }
    }

    pub(super) fn close(&self) {
        let mut core = self.core.lock().expect("kcp lock poisoned");
        core.closed = true;
        core.wake_reader();
        core.wake_writer();
    }

    pub(super) fn is_closed(&self) -> bool {
        self.core.lock().expect("kcp lock poisoned").closed
    }

    pub(super) fn idle_longer_than(&self, limit: Duration) -> bool {
        self.core
            .lock()
            .expect("kcp lock poisoned")
            .last_active
            .elapsed()
            > limit
    }
}

/// A reliable bidirectional stream over one KCP conversation.
pub struct KcpStream {
    session: Arc<KcpSession>,
    peer: SocketAddr,
    /// Client streams own their socket driver; accepted streams are driven
    /// by the listener.
    driver: Option<JoinHandle<()>>,
    /// Bytes received from KCP that did not fit the caller's buffer yet.
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl KcpStream {
    /// Open a conversation to `peer`, optionally routing received datagrams
    /// through `filter` first.
    pub async fn connect(
        config: &KcpConfig,
        peer: SocketAddr,
        filter: Option<Arc<dyn DatagramFilter>>,
    ) -> io::Result<KcpStream> {
        let bind_addr: SocketAddr = if peer.is_ipv6() {
            "[::]:0".parse().expect("literal addr")
        } else {
            "0.0.0.0:0".parse().expect("literal addr")
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(peer).await?;

        let conv: u32 = rand::random();
        let session = KcpSession::new(conv, socket.clone(), peer, config);
        let driver = tokio::spawn(drive_client(socket, session.clone(), filter, peer));
        Ok(KcpStream {
            session,
            peer,
            driver: Some(driver),
            read_buf: Vec::new(),
            read_pos: 0,
        })
    }

    pub(super) fn accepted(session: Arc<KcpSession>, peer: SocketAddr) -> KcpStream {
        KcpStream {
            session,
            peer,
            driver: None,
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for KcpStream {
    fn drop(&mut self) {
        self.session.close();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl AsyncRead for KcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Drain bytes a previous read could not hand over
        if this.read_pos < this.read_buf.len() {
            let remaining = &this.read_buf[this.read_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.read_pos += n;
            if this.read_pos == this.read_buf.len() {
                this.read_buf.clear();
                this.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        let mut core = this.session.core.lock().expect("kcp lock poisoned");
        match core.kcp.peeksize() {
            Ok(size) if size > 0 => {
                let mut tmp = vec![0u8; size];
                match core.kcp.recv(&mut tmp) {
                    Ok(received) => {
                        drop(core);
                        let n = received.min(buf.remaining());
                        buf.put_slice(&tmp[..n]);
                        if n < received {
                            this.read_buf = tmp[n..received].to_vec();
                            this.read_pos = 0;
                        }
                        Poll::Ready(Ok(()))
                    }
                    Err(e) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        e.to_string(),
                    ))),
                }
            }
            _ => {
                if core.closed {
                    // EOF
                    return Poll::Ready(Ok(()));
                }
                core.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for KcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let session = &self.session;
        let now = session.now_ms();
        let mut core = session.core.lock().expect("kcp lock poisoned");
        if core.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if core.kcp.wait_snd() >= session.send_backlog {
            core.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        match core.kcp.send(buf) {
            Ok(n) => {
                let _ = core.kcp.update(now);
                let _ = core.kcp.flush();
                Poll::Ready(Ok(n))
            }
            Err(e) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                e.to_string(),
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut core = self.session.core.lock().expect("kcp lock poisoned");
        let _ = core.kcp.flush();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.session.close();
        Poll::Ready(Ok(()))
    }
}

/// Socket driver for a client conversation: receive datagrams, run the
/// filter, feed KCP, tick the clock.
async fn drive_client(
    socket: Arc<UdpSocket>,
    session: Arc<KcpSession>,
    filter: Option<Arc<dyn DatagramFilter>>,
    peer: SocketAddr,
) {
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
                    if src != peer || data.len() < KCP_OVERHEAD {
                        continue;
                    }
                    session.input(&data);
                }
                Err(e) => {
                    debug!("kcp socket receive failed: {}", e);
                    session.close();
                    break;
                }
            },
            _ = tick.tick() => {
                session.update();
                if session.is_closed() {
                    break;
                }
            }
        }
    }
}
