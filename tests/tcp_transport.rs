//! End-to-end tests for the TCP transport over loopback.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

use lafrpc::{Pole, Rpc, TcpTransport};

async fn start_tcp_server(rpc: &Arc<Rpc>, address: &'static str) -> Arc<TcpTransport> {
    let _ = env_logger::builder().is_test(true).try_init();
    let transport = Arc::new(TcpTransport::new(rpc));
    let server = transport.clone();
    tokio::spawn(async move {
        server.start_server(address).await;
    });
    // Give the listener a moment to bind
    sleep(Duration::from_millis(300)).await;
    transport
}

#[tokio::test]
async fn tcp_channel_end_to_end() {
    let server_rpc = Rpc::new(128 * 1024);
    let _server = start_tcp_server(&server_rpc, "tcp://127.0.0.1:18941").await;

    let client_rpc = Rpc::new(64 * 1024);
    let client = TcpTransport::new(&client_rpc);
    let mut channel = client
        .connect("tcp://127.0.0.1:18941", Duration::ZERO)
        .await
        .expect("connect failed");

    // The channel reflects its owner's packet size at creation time
    assert_eq!(channel.pole(), Pole::Positive);
    assert_eq!(channel.max_packet_size(), 64 * 1024);

    sleep(Duration::from_millis(300)).await;
    let peers = server_rpc.peers();
    assert_eq!(peers.len(), 1);
    assert!(
        peers[0].address().starts_with("tcp://127.0.0.1:"),
        "unexpected peer address {}",
        peers[0].address()
    );

    channel.send_packet(b"ping").await.unwrap();

    let mut server_channel = peers[0].channel().lock().await;
    assert_eq!(server_channel.pole(), Pole::Negative);
    assert_eq!(server_channel.max_packet_size(), 128 * 1024);
    let packet = server_channel.recv_packet().await.unwrap();
    assert_eq!(&packet[..], b"ping");

    server_channel.send_packet(b"pong").await.unwrap();
    drop(server_channel);

    let packet = channel.recv_packet().await.unwrap();
    assert_eq!(&packet[..], b"pong");
}

#[tokio::test]
async fn tcp_raw_socket_adoption() {
    let server_rpc = Rpc::new(64 * 1024);
    let server = start_tcp_server(&server_rpc, "tcp://127.0.0.1:18942").await;

    let client_rpc = Rpc::new(64 * 1024);
    let client = TcpTransport::new(&client_rpc);
    let (mut stream, id) = client
        .make_raw_socket("tcp://127.0.0.1:18942")
        .await
        .expect("raw socket handshake failed");
    assert_eq!(id.len(), 16);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(server.pending_raw_sockets(), 1);

    let mut adopted = server.take_raw_socket(&id).expect("socket not adopted");
    // Take removes the entry; a second take yields nothing
    assert!(server.take_raw_socket(&id).is_none());
    assert_eq!(server.pending_raw_sockets(), 0);

    // Arbitrary bytes pass through out of band of any channel
    stream.write_all(b"bulk transfer").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = vec![0u8; 13];
    adopted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"bulk transfer");

    // No peer was registered along the way
    assert!(server_rpc.peers().is_empty());
}

#[tokio::test]
async fn tcp_bad_magic_is_ignored() {
    let server_rpc = Rpc::new(64 * 1024);
    let server = start_tcp_server(&server_rpc, "tcp://127.0.0.1:18943").await;

    let mut socket = TcpStream::connect("127.0.0.1:18943").await.unwrap();
    socket.write_all(&[0x00, 0x00]).await.unwrap();
    socket.flush().await.unwrap();
    drop(socket);

    sleep(Duration::from_millis(300)).await;
    assert!(server_rpc.peers().is_empty());
    assert_eq!(server.pending_raw_sockets(), 0);
}

#[tokio::test]
async fn dead_owner_turns_operations_into_noops() {
    let transport = {
        let rpc = Rpc::new(1024);
        TcpTransport::new(&rpc)
    };
    assert!(transport
        .connect("tcp://127.0.0.1:18944", Duration::ZERO)
        .await
        .is_none());
    assert!(transport
        .make_raw_socket("tcp://127.0.0.1:18944")
        .await
        .is_none());
    assert!(!transport.start_server("tcp://127.0.0.1:18944").await);
}

#[tokio::test]
async fn invalid_addresses_are_rejected() {
    let rpc = Rpc::new(1024);
    let transport = TcpTransport::new(&rpc);
    assert!(transport
        .connect("ssl://127.0.0.1:18945", Duration::ZERO)
        .await
        .is_none());
    assert!(transport
        .connect("tcp://127.0.0.1", Duration::ZERO)
        .await
        .is_none());
    assert!(!transport.start_server("tcp://:0").await);
}
