//! End-to-end tests for the reliable-UDP transports.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::sleep;

use lafrpc::config::TlsSettings;
use lafrpc::{DatagramFilter, KcpConfig, KcpSslTransport, KcpTransport, Pole, Rpc, PEER_CERTIFICATE};

/// Consumes exactly the ten-byte `0xAA` probe datagrams; KCP traffic is
/// always at least a full header long and passes through.
struct ProbeFilter {
    consumed: AtomicUsize,
}

impl DatagramFilter for ProbeFilter {
    fn filter(&self, data: &mut Vec<u8>, _peer: &mut SocketAddr) -> bool {
        if data.len() == 10 && data.iter().all(|&b| b == 0xaa) {
            self.consumed.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }
}

async fn exchange_packets(server_rpc: &Arc<Rpc>, client: &KcpTransport, address: &str) {
    let mut channel = client
        .connect(address, Duration::from_secs(10))
        .await
        .expect("kcp connect failed");
    assert_eq!(channel.pole(), Pole::Positive);

    channel.send_packet(b"over udp").await.unwrap();

    // Wait for the server to register the peer
    let mut peers = server_rpc.peers();
    for _ in 0..50 {
        if !peers.is_empty() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
        peers = server_rpc.peers();
    }
    assert_eq!(peers.len(), 1);
    assert!(peers[0].address().starts_with("kcp://127.0.0.1:"));

    let mut server_channel = peers[0].channel().lock().await;
    let packet = server_channel.recv_packet().await.unwrap();
    assert_eq!(&packet[..], b"over udp");

    server_channel.send_packet(b"reply").await.unwrap();
    drop(server_channel);

    let packet = channel.recv_packet().await.unwrap();
    assert_eq!(&packet[..], b"reply");
}

#[tokio::test]
async fn kcp_channel_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();
    let server_rpc = Rpc::new(64 * 1024);
    let server = Arc::new(KcpTransport::new(&server_rpc, KcpConfig::default()));
    let listener = server.clone();
    tokio::spawn(async move {
        listener.start_server("kcp://127.0.0.1:18971").await;
    });
    sleep(Duration::from_millis(300)).await;

    let client_rpc = Rpc::new(64 * 1024);
    let client = KcpTransport::new(&client_rpc, KcpConfig::default());
    exchange_packets(&server_rpc, &client, "kcp://127.0.0.1:18971").await;
}

#[tokio::test]
async fn kcp_filter_consumes_foreign_datagrams() {
    let filter = Arc::new(ProbeFilter {
        consumed: AtomicUsize::new(0),
    });

    let server_rpc = Rpc::new(64 * 1024);
    server_rpc.set_kcp_filter(filter.clone());
    let server = Arc::new(KcpTransport::new(&server_rpc, KcpConfig::default()));
    let listener = server.clone();
    tokio::spawn(async move {
        listener.start_server("kcp://127.0.0.1:18972").await;
    });
    sleep(Duration::from_millis(300)).await;

    // Probe datagrams are swallowed by the filter, never reaching KCP
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe
        .send_to(&[0xaa_u8; 10], "127.0.0.1:18972")
        .await
        .unwrap();
    probe
        .send_to(&[0xaa_u8; 10], "127.0.0.1:18972")
        .await
        .unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(filter.consumed.load(Ordering::Relaxed), 2);
    assert!(server_rpc.peers().is_empty());

    // Ordinary RPC traffic on the same port is unaffected
    let client_rpc = Rpc::new(64 * 1024);
    let client = KcpTransport::new(&client_rpc, KcpConfig::default());
    exchange_packets(&server_rpc, &client, "kcp://127.0.0.1:18972").await;
}

#[tokio::test]
async fn kcp_server_survives_malformed_datagrams() {
    let server_rpc = Rpc::new(64 * 1024);
    let server = Arc::new(KcpTransport::new(&server_rpc, KcpConfig::default()));
    let listener = server.clone();
    tokio::spawn(async move {
        listener.start_server("kcp://127.0.0.1:18975").await;
    });
    sleep(Duration::from_millis(300)).await;

    // Garbage below the KCP header size, and garbage long enough to reach
    // the state machine but fail to parse
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe
        .send_to(&[0xff_u8; 5], "127.0.0.1:18975")
        .await
        .unwrap();
    probe
        .send_to(&[0xff_u8; 48], "127.0.0.1:18975")
        .await
        .unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(server_rpc.peers().is_empty());

    // The listener keeps serving real conversations afterwards
    let client_rpc = Rpc::new(64 * 1024);
    let client = KcpTransport::new(&client_rpc, KcpConfig::default());
    exchange_packets(&server_rpc, &client, "kcp://127.0.0.1:18975").await;
}

fn write_test_cert(name: &str) -> TlsSettings {
    let dir =
        std::env::temp_dir().join(format!("lafrpc-test-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    TlsSettings {
        cert_path: cert_path.to_string_lossy().into_owned(),
        key_path: key_path.to_string_lossy().into_owned(),
        insecure_skip_verify: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn kcp_ssl_channel_end_to_end() {
    let tls = write_test_cert("kcp-ssl");

    let server_rpc = Rpc::new(64 * 1024);
    let server = Arc::new(
        KcpSslTransport::new(&server_rpc, KcpConfig::default(), tls.clone()).unwrap(),
    );
    let listener = server.clone();
    tokio::spawn(async move {
        listener.start_server("kcp+ssl://127.0.0.1:18974").await;
    });
    sleep(Duration::from_millis(300)).await;

    let client_rpc = Rpc::new(64 * 1024);
    let client = KcpSslTransport::new(&client_rpc, KcpConfig::default(), tls).unwrap();
    // The alias scheme reaches the same transport
    assert!(client.can_handle("ssl+kcp://127.0.0.1:18974"));

    let mut channel = client
        .connect("kcp+ssl://127.0.0.1:18974", Duration::from_secs(15))
        .await
        .expect("kcp+ssl connect failed");
    assert!(channel.property(PEER_CERTIFICATE).is_some());

    channel.send_packet(b"encrypted datagram").await.unwrap();

    let mut peers = server_rpc.peers();
    for _ in 0..50 {
        if !peers.is_empty() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
        peers = server_rpc.peers();
    }
    assert_eq!(peers.len(), 1);
    assert!(peers[0].address().starts_with("kcp+ssl://127.0.0.1:"));

    let mut server_channel = peers[0].channel().lock().await;
    let packet = server_channel.recv_packet().await.unwrap();
    assert_eq!(&packet[..], b"encrypted datagram");
}

#[tokio::test]
async fn kcp_raw_socket() {
    let server_rpc = Rpc::new(64 * 1024);
    let server = Arc::new(KcpTransport::new(&server_rpc, KcpConfig::default()));
    let listener = server.clone();
    tokio::spawn(async move {
        listener.start_server("kcp://127.0.0.1:18973").await;
    });
    sleep(Duration::from_millis(300)).await;

    let client_rpc = Rpc::new(64 * 1024);
    let client = KcpTransport::new(&client_rpc, KcpConfig::default());
    let (mut stream, id) = client
        .make_raw_socket("kcp://127.0.0.1:18973")
        .await
        .expect("raw socket handshake failed");

    sleep(Duration::from_millis(500)).await;
    let mut adopted = server.take_raw_socket(&id).expect("socket not adopted");
    assert!(server.take_raw_socket(&id).is_none());

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream.write_all(b"datagram bulk").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = vec![0u8; 13];
    adopted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"datagram bulk");
}
