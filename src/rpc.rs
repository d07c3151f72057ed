//! The owning RPC core the transports point back to.
//!
//! Transports hold a `Weak<Rpc>` and check it at every entry point; a dead
//! owner turns operations into clean no-ops. The core publishes the global
//! maximum packet size, the connect timeout, the DNS cache, the optional
//! KCP datagram filter, and registers peers for accepted channels.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::*;

use crate::channel::DataChannel;
use crate::config::RpcSettings;
use crate::net::kcp::DatagramFilter;
use crate::transport::DEFAULT_CONNECT_TIMEOUT;

/// A registered remote peer holding its data channel.
pub struct Peer {
    address: String,
    hint: Option<String>,
    channel: tokio::sync::Mutex<DataChannel>,
}

impl Peer {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn channel(&self) -> &tokio::sync::Mutex<DataChannel> {
        &self.channel
    }
}

/// Hostname resolution with a process-wide cache.
///
/// Numeric literals short-circuit; everything else goes through the system
/// resolver once and is cached for the lifetime of the owning `Rpc`.
#[derive(Default)]
pub struct DnsCache {
    entries: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl DnsCache {
    pub async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }
        if let Some(cached) = self.entries.lock().expect("dns lock poisoned").get(host) {
            return cached.clone();
        }
        let resolved: Vec<IpAddr> = match tokio::net::lookup_host((host, 0u16)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).collect(),
            Err(e) => {
                warn!("resolving {} failed: {}", host, e);
                Vec::new()
            }
        };
        if !resolved.is_empty() {
            self.entries
                .lock()
                .expect("dns lock poisoned")
                .insert(host.to_string(), resolved.clone());
        }
        resolved
    }
}

/// The RPC runtime owner.
pub struct Rpc {
    max_packet_size: usize,
    connect_timeout: Duration,
    dns_cache: DnsCache,
    kcp_filter: Mutex<Option<Arc<dyn DatagramFilter>>>,
    peers: Mutex<Vec<Arc<Peer>>>,
}

impl Rpc {
    pub fn new(max_packet_size: usize) -> Arc<Rpc> {
        Arc::new(Rpc {
            max_packet_size,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dns_cache: DnsCache::default(),
            kcp_filter: Mutex::new(None),
            peers: Mutex::new(Vec::new()),
        })
    }

    /// Build an owner from a parsed configuration section.
    pub fn with_settings(settings: &RpcSettings) -> Arc<Rpc> {
        Arc::new(Rpc {
            max_packet_size: settings.max_packet_size,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            dns_cache: DnsCache::default(),
            kcp_filter: Mutex::new(None),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Timeout the transports fall back to when `connect` is called with
    /// a zero timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn dns_cache(&self) -> &DnsCache {
        &self.dns_cache
    }

    /// Install the datagram filter KCP transports pass to their sockets.
    /// Published at startup, read-mostly afterwards.
    pub fn set_kcp_filter(&self, filter: Arc<dyn DatagramFilter>) {
        *self.kcp_filter.lock().expect("filter lock poisoned") = Some(filter);
    }

    pub fn kcp_filter(&self) -> Option<Arc<dyn DatagramFilter>> {
        self.kcp_filter
            .lock()
            .expect("filter lock poisoned")
            .clone()
    }

    /// Adopt an accepted or connected channel as a peer.
    pub fn prepare_peer(
        self: &Arc<Self>,
        channel: DataChannel,
        hint: Option<&str>,
        address: &str,
    ) -> Option<Arc<Peer>> {
        let peer = Arc::new(Peer {
            address: address.to_string(),
            hint: hint.map(|h| h.to_string()),
            channel: tokio::sync::Mutex::new(channel),
        });
        debug!("prepared peer at {}", address);
        self.peers
            .lock()
            .expect("peers lock poisoned")
            .push(peer.clone());
        Some(peer)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().expect("peers lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dns_cache_short_circuits_literals() {
        let cache = DnsCache::default();
        let ips = cache.resolve("127.0.0.1").await;
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        let ips = cache.resolve("::1").await;
        assert_eq!(ips, vec!["::1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn settings_carry_connect_timeout() {
        let rpc = Rpc::with_settings(&RpcSettings {
            max_packet_size: 2048,
            connect_timeout_ms: 1234,
        });
        assert_eq!(rpc.max_packet_size(), 2048);
        assert_eq!(rpc.connect_timeout(), Duration::from_millis(1234));

        let rpc = Rpc::new(1024);
        assert_eq!(rpc.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn prepare_peer_registers() {
        let rpc = Rpc::new(64 * 1024);
        let (a, _b) = tokio::io::duplex(8);
        let channel = DataChannel::new(
            crate::net::stream::RpcStream::new(a),
            crate::channel::Pole::Negative,
        );
        let peer = rpc
            .prepare_peer(channel, None, "tcp://127.0.0.1:4321")
            .unwrap();
        assert_eq!(peer.address(), "tcp://127.0.0.1:4321");
        assert_eq!(rpc.peers().len(), 1);
    }
}
