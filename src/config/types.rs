//! Configuration type definitions.

use std::time::Duration;

use crate::net::kcp::KcpConfig;

/// RPC-wide settings the transports consume.
#[derive(Clone, Debug)]
pub struct RpcSettings {
    pub max_packet_size: usize,
    pub connect_timeout_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            max_packet_size: 1024 * 1024,
            connect_timeout_ms: 5000,
        }
    }
}

/// TLS material for `ssl://`, `kcp+ssl://` and `https://` endpoints.
#[derive(Clone, Debug, Default)]
pub struct TlsSettings {
    /// PEM certificate chain presented to the peer.
    pub cert_path: String,
    /// PEM private key matching `cert_path`.
    pub key_path: String,
    /// PEM roots used to verify the peer; system-independent.
    pub ca_path: String,
    /// Skip server certificate verification on the client side.
    pub insecure_skip_verify: bool,
}

/// KCP tuning section; converted into the driver's [`KcpConfig`].
#[derive(Clone, Debug)]
pub struct KcpSettings {
    pub mtu: usize,
    pub interval_ms: i32,
    pub resend: i32,
    pub nodelay: bool,
    pub congestion_off: bool,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
    pub session_expire_ms: u64,
}

impl Default for KcpSettings {
    fn default() -> Self {
        Self {
            mtu: 1400,
            interval_ms: 10,
            resend: 2,
            nodelay: true,
            congestion_off: true,
            snd_wnd: 256,
            rcv_wnd: 256,
            session_expire_ms: 90_000,
        }
    }
}

impl From<&KcpSettings> for KcpConfig {
    fn from(s: &KcpSettings) -> KcpConfig {
        KcpConfig {
            mtu: s.mtu,
            interval: s.interval_ms,
            resend: s.resend,
            nodelay: s.nodelay,
            congestion_off: s.congestion_off,
            snd_wnd: s.snd_wnd,
            rcv_wnd: s.rcv_wnd,
            session_expire: Duration::from_millis(s.session_expire_ms),
        }
    }
}

/// HTTP transport section.
#[derive(Clone, Debug)]
pub struct HttpSettings {
    /// Document root for non-RPC paths.
    pub root_dir: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            root_dir: ".".into(),
        }
    }
}

/// Root configuration container.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub rpc: RpcSettings,
    pub tls: Option<TlsSettings>,
    pub kcp: KcpSettings,
    pub http: HttpSettings,
}
