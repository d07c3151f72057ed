//! Reliable-UDP transport driver.
//!
//! This module drives the `kcp` ARQ state machine with tokio UDP I/O:
//! - `KcpStream`: AsyncRead/AsyncWrite over a KCP conversation
//! - `KcpListener`: accepts conversations demultiplexed by source address
//! - `DatagramFilter`: host hook invoked on every received datagram before
//!   KCP sees it, so unrelated UDP payloads can share the port
//!
//! The state machine lives behind a mutex with registered wakers; a driver
//! task per socket feeds received datagrams in and ticks the retransmission
//! clock. The filter runs before the lock is taken.

mod listener;
mod stream;

pub use listener::KcpListener;
pub use stream::KcpStream;

use std::net::SocketAddr;
use std::time::Duration;

/// Host-provided hook at the per-datagram boundary of the UDP receiver.
pub trait DatagramFilter: Send + Sync {
    /// Inspect a received datagram before KCP consumes it. The payload and
    /// source address are mutable; returning `true` marks the datagram as
    /// consumed and suppresses it from KCP entirely.
    fn filter(&self, data: &mut Vec<u8>, peer: &mut SocketAddr) -> bool;
}

/// Tuning knobs for KCP conversations.
#[derive(Debug, Clone)]
pub struct KcpConfig {
    pub mtu: usize,
    /// Internal update interval in milliseconds.
    pub interval: i32,
    /// Fast resend threshold; 0 disables fast resend.
    pub resend: i32,
    pub nodelay: bool,
    /// Disable KCP's own congestion window.
    pub congestion_off: bool,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
    /// Server-side sessions idle longer than this are torn down.
    pub session_expire: Duration,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            interval: 10,
            resend: 2,
            nodelay: true,
            congestion_off: true,
            snd_wnd: 256,
            rcv_wnd: 256,
            session_expire: Duration::from_secs(90),
        }
    }
}
