//! Framed, bidirectional data channel carrying RPC traffic.
//!
//! A channel wraps an accepted or connected byte stream in length-prefixed
//! packet framing (4-byte big-endian length, payload bounded by the
//! channel's maximum packet size) and carries a role marker plus a
//! string-keyed property bag. TLS-derived peer identity lands in the bag
//! under [`PEER_CERTIFICATE`] / [`PEER_CERTIFICATE_HASH`].

use std::collections::HashMap;

use bytes::Bytes;
use log::*;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::error::ChannelError;
use crate::net::stream::RpcStream;

/// Property key for the PEM-encoded peer leaf certificate.
pub const PEER_CERTIFICATE: &str = "peer_certificate";
/// Property key for the SHA-256 digest of the peer certificate's DER form.
pub const PEER_CERTIFICATE_HASH: &str = "peer_certificate_hash";

/// Fallback maximum packet size when no owner has applied its own.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Role marker breaking symmetry between the two ends of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pole {
    /// Initiator side.
    Positive,
    /// Acceptor side.
    Negative,
}

/// A framed message stream over one transport connection.
pub struct DataChannel {
    stream: RpcStream,
    pole: Pole,
    max_packet_size: usize,
    properties: HashMap<String, Vec<u8>>,
}

impl DataChannel {
    pub fn new(stream: RpcStream, pole: Pole) -> Self {
        Self {
            stream,
            pole,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            properties: HashMap::new(),
        }
    }

    pub fn pole(&self) -> Pole {
        self.pole
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size;
    }

    pub fn property(&self, key: &str) -> Option<&[u8]> {
        self.properties.get(key).map(|v| v.as_slice())
    }

    pub fn set_property(&mut self, key: &str, value: Vec<u8>) {
        self.properties.insert(key.to_string(), value);
    }

    /// Copy the underlying stream's TLS identity into the property bag.
    ///
    /// Both properties are attached only when the stream completed a TLS
    /// handshake with a non-empty peer certificate; plain transports simply
    /// leave the bag empty.
    pub fn attach_peer_certificate(&mut self) {
        let Some(der) = self.stream.peer_certificate() else {
            return;
        };
        let pem_text = pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec()));
        let digest = Sha256::digest(der);
        if pem_text.is_empty() || digest.is_empty() {
            return;
        }
        self.properties
            .insert(PEER_CERTIFICATE.to_string(), pem_text.into_bytes());
        self.properties
            .insert(PEER_CERTIFICATE_HASH.to_string(), digest.to_vec());
    }

    /// Send one packet, framed with a 4-byte big-endian length prefix.
    pub async fn send_packet(&mut self, packet: &[u8]) -> Result<(), ChannelError> {
        if packet.len() > self.max_packet_size {
            return Err(ChannelError::PacketTooLarge(packet.len()));
        }
        self.stream.write_u32(packet.len() as u32).await?;
        self.stream.write_all(packet).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one packet, rejecting frames beyond the maximum packet size.
    pub async fn recv_packet(&mut self) -> Result<Bytes, ChannelError> {
        let len = self.stream.read_u32().await? as usize;
        if len > self.max_packet_size {
            debug!("dropping oversized frame of {} bytes", len);
            return Err(ChannelError::PacketTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        Ok(Bytes::from(payload))
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr()
    }
}
