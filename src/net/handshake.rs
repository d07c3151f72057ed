//! The fixed two-byte handshake at the head of every accepted stream.
//!
//! A client opens either an RPC channel (`4E 67`, no reply) or a raw
//! side-band socket (`33 74` followed by a 16-byte connection id, answered
//! with `F3 97`). There is no framing, versioning or negotiation; a short
//! read or write aborts the connection.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::error::HandshakeError;

/// Magic tag opening an RPC channel ("Ng").
pub const CHANNEL_MAGIC: [u8; 2] = [0x4e, 0x67];
/// Magic tag opening a raw side-band socket ("3t").
pub const RAW_SOCKET_MAGIC: [u8; 2] = [0x33, 0x74];
/// Server acknowledgement of a raw-socket open.
pub const RAW_SOCKET_ACK: [u8; 2] = [0xf3, 0x97];

pub const CONNECTION_ID_LEN: usize = 16;

/// Opaque identifier a raw socket is adopted under.
pub type ConnectionId = [u8; CONNECTION_ID_LEN];

/// Draw a fresh 16-byte connection id. Duplicates are not checked; the
/// collision probability is negligible.
pub fn new_connection_id() -> ConnectionId {
    rand::random()
}

/// What the first bytes of an accepted stream announced.
#[derive(Debug, PartialEq, Eq)]
pub enum Greeting {
    /// `4E 67`: the remainder of the stream is a framed RPC channel.
    Channel,
    /// `33 74` plus id: the stream is a raw socket to adopt under `id`.
    RawSocket(ConnectionId),
    /// Anything else; the host decides what to do with the two bytes.
    Unknown([u8; 2]),
}

fn map_short(e: io::Error) -> HandshakeError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        HandshakeError::Short
    } else {
        HandshakeError::Io(e)
    }
}

/// Server side: read the greeting from a fresh stream.
///
/// For a raw-socket open this reads the full 18 bytes and sends the 2-byte
/// ack before returning.
pub async fn read_greeting<S>(stream: &mut S) -> Result<Greeting, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut magic = [0u8; 2];
    stream.read_exact(&mut magic).await.map_err(map_short)?;
    classify_magic(stream, magic).await
}

/// Server side: classify an already-read magic pair, completing the
/// raw-socket exchange when it announces one. Used by the HTTP shortcut
/// which sniffs the two bytes itself.
pub async fn classify_magic<S>(stream: &mut S, magic: [u8; 2]) -> Result<Greeting, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if magic == CHANNEL_MAGIC {
        return Ok(Greeting::Channel);
    }
    if magic == RAW_SOCKET_MAGIC {
        let mut id = [0u8; CONNECTION_ID_LEN];
        stream.read_exact(&mut id).await.map_err(map_short)?;
        stream
            .write_all(&RAW_SOCKET_ACK)
            .await
            .map_err(map_short)?;
        stream.flush().await.map_err(map_short)?;
        return Ok(Greeting::RawSocket(id));
    }
    Ok(Greeting::Unknown(magic))
}

/// Client side: announce an RPC channel.
pub async fn send_channel_magic<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&CHANNEL_MAGIC).await.map_err(map_short)?;
    stream.flush().await.map_err(map_short)?;
    Ok(())
}

/// Client side: run the raw-socket open and wait for the ack.
///
/// Only the 2-byte ack is verified; the server never echoes the id back.
pub async fn open_raw_socket<S>(stream: &mut S) -> Result<ConnectionId, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = new_connection_id();
    let mut packet = [0u8; 2 + CONNECTION_ID_LEN];
    packet[..2].copy_from_slice(&RAW_SOCKET_MAGIC);
    packet[2..].copy_from_slice(&id);
    stream.write_all(&packet).await.map_err(map_short)?;
    stream.flush().await.map_err(map_short)?;

    let mut ack = [0u8; 2];
    stream.read_exact(&mut ack).await.map_err(map_short)?;
    if ack != RAW_SOCKET_ACK {
        return Err(HandshakeError::BadAck);
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_greeting() {
        let (mut client, mut server) = tokio::io::duplex(64);
        send_channel_magic(&mut client).await.unwrap();
        let greeting = read_greeting(&mut server).await.unwrap();
        assert_eq!(greeting, Greeting::Channel);
    }

    #[tokio::test]
    async fn raw_socket_exchange() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let server_task = tokio::spawn(async move {
            let g = read_greeting(&mut server).await.unwrap();
            match g {
                Greeting::RawSocket(id) => id,
                other => panic!("unexpected greeting {:?}", other),
            }
        });
        let client_id = open_raw_socket(&mut client).await.unwrap();
        let server_id = server_task.await.unwrap();
        assert_eq!(client_id, server_id);
        assert_eq!(client_id.len(), 16);
    }

    #[tokio::test]
    async fn unknown_magic_is_reported() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x00, 0x00])
            .await
            .unwrap();
        let greeting = read_greeting(&mut server).await.unwrap();
        assert_eq!(greeting, Greeting::Unknown([0x00, 0x00]));
    }

    #[tokio::test]
    async fn short_greeting_fails() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x4e])
            .await
            .unwrap();
        drop(client);
        match read_greeting(&mut server).await {
            Err(HandshakeError::Short) => {}
            other => panic!("expected short handshake, got {:?}", other),
        }
    }
}
