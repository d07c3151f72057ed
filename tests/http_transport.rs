//! End-to-end tests for the HTTP transport: upgrade handshake, static
//! files, the magic-code shortcut and the HTTPS certificate surface.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

use lafrpc::config::{HttpSettings, TlsSettings};
use lafrpc::{HttpTransport, Rpc, PEER_CERTIFICATE, PEER_CERTIFICATE_HASH};

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lafrpc-test-{}-{}", name, std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_test_cert(dir: &PathBuf) -> TlsSettings {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    fs::write(&cert_path, cert.cert.pem()).unwrap();
    fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    TlsSettings {
        cert_path: cert_path.to_string_lossy().into_owned(),
        key_path: key_path.to_string_lossy().into_owned(),
        insecure_skip_verify: true,
        ..Default::default()
    }
}

async fn start_http_server(
    rpc: &Arc<Rpc>,
    root_dir: &PathBuf,
    tls: Option<TlsSettings>,
    address: &'static str,
) -> Arc<HttpTransport> {
    let _ = env_logger::builder().is_test(true).try_init();
    let settings = HttpSettings {
        root_dir: root_dir.to_string_lossy().into_owned(),
    };
    let transport = Arc::new(HttpTransport::new(rpc, settings, tls).unwrap());
    let server = transport.clone();
    tokio::spawn(async move {
        server.start_server(address).await;
    });
    sleep(Duration::from_millis(300)).await;
    transport
}

#[tokio::test]
async fn http_upgrade_channel_and_static_files() {
    let root = test_dir("http-upgrade");
    fs::write(root.join("index.html"), "<html>hello</html>").unwrap();

    let server_rpc = Rpc::new(128 * 1024);
    let _server = start_http_server(&server_rpc, &root, None, "http://127.0.0.1:18951/rpc").await;

    // RPC upgrade on the configured path
    let client_rpc = Rpc::new(64 * 1024);
    let client =
        HttpTransport::new(&client_rpc, HttpSettings::default(), None).unwrap();
    let mut channel = client
        .connect("http://127.0.0.1:18951/rpc", Duration::ZERO)
        .await
        .expect("upgrade connect failed");
    assert_eq!(channel.max_packet_size(), 64 * 1024);

    sleep(Duration::from_millis(300)).await;
    let peers = server_rpc.peers();
    assert_eq!(peers.len(), 1);
    assert!(peers[0].address().starts_with("http://127.0.0.1:"));

    channel.send_packet(b"over http").await.unwrap();
    let mut server_channel = peers[0].channel().lock().await;
    let packet = server_channel.recv_packet().await.unwrap();
    assert_eq!(&packet[..], b"over http");
    drop(server_channel);

    // A plain GET on the same port serves the document root
    let mut socket = TcpStream::connect("127.0.0.1:18951").await.unwrap();
    socket
        .write_all(
            b"GET /index.html HTTP/1.1\r\nHost: 127.0.0.1:18951\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut response = Vec::new();
    socket.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("<html>hello</html>"), "{}", response);
}

#[tokio::test]
async fn http_upgrade_on_wrong_path_is_not_found() {
    let root = test_dir("http-wrong-path");
    let server_rpc = Rpc::new(64 * 1024);
    let server = start_http_server(&server_rpc, &root, None, "http://127.0.0.1:18952/rpc").await;

    let mut socket = TcpStream::connect("127.0.0.1:18952").await.unwrap();
    socket
        .write_all(
            b"POST /other HTTP/1.1\r\nHost: 127.0.0.1:18952\r\nConnection: Upgrade\r\n\
              Upgrade: lafrpc\r\nContent-Length: 0\r\n\r\n",
        )
        .await
        .unwrap();
    let mut buf = vec![0u8; 1024];
    let n = socket.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

    sleep(Duration::from_millis(200)).await;
    assert!(server_rpc.peers().is_empty());
    assert_eq!(server.pending_raw_sockets(), 0);

    // Same for missing upgrade headers on the right path
    let mut socket = TcpStream::connect("127.0.0.1:18952").await.unwrap();
    socket
        .write_all(
            b"POST /rpc HTTP/1.1\r\nHost: 127.0.0.1:18952\r\nContent-Length: 0\r\n\r\n",
        )
        .await
        .unwrap();
    let n = socket.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
}

#[tokio::test]
async fn magic_code_shortcut_skips_http() {
    let root = test_dir("http-shortcut");
    let server_rpc = Rpc::new(64 * 1024);
    let server = start_http_server(&server_rpc, &root, None, "http://127.0.0.1:18953/rpc").await;

    // A direct RPC channel open, no HTTP at all
    let mut socket = TcpStream::connect("127.0.0.1:18953").await.unwrap();
    socket.write_all(&[0x4e, 0x67]).await.unwrap();
    socket.flush().await.unwrap();
    sleep(Duration::from_millis(300)).await;
    let peers = server_rpc.peers();
    assert_eq!(peers.len(), 1);
    assert!(peers[0].address().starts_with("http://127.0.0.1:"));
    drop(socket);

    // A direct raw-socket open on the same port
    let mut socket = TcpStream::connect("127.0.0.1:18953").await.unwrap();
    let id = [0x5a_u8; 16];
    socket.write_all(&[0x33, 0x74]).await.unwrap();
    socket.write_all(&id).await.unwrap();
    socket.flush().await.unwrap();
    let mut ack = [0u8; 2];
    socket.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, [0xf3, 0x97]);

    sleep(Duration::from_millis(200)).await;
    let mut adopted = server.take_raw_socket(&id).expect("socket not adopted");
    socket.write_all(b"side band").await.unwrap();
    let mut buf = vec![0u8; 9];
    adopted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"side band");
}

#[tokio::test]
async fn https_upgrade_exposes_peer_certificate() {
    let root = test_dir("https-upgrade");
    let tls = write_test_cert(&root);

    let server_rpc = Rpc::new(64 * 1024);
    let _server = start_http_server(
        &server_rpc,
        &root,
        Some(tls.clone()),
        "https://127.0.0.1:18954/rpc",
    )
    .await;

    let client_rpc = Rpc::new(64 * 1024);
    let client = HttpTransport::new(&client_rpc, HttpSettings::default(), Some(tls)).unwrap();
    let channel = client
        .connect("https://127.0.0.1:18954/rpc", Duration::from_secs(10))
        .await
        .expect("https upgrade connect failed");

    let cert_pem = channel
        .property(PEER_CERTIFICATE)
        .expect("missing certificate property");
    let parsed = pem::parse(cert_pem).unwrap();
    let hash = channel
        .property(PEER_CERTIFICATE_HASH)
        .expect("missing certificate hash property");
    assert_eq!(hash, &Sha256::digest(parsed.contents())[..]);
}
