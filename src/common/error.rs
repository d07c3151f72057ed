//! Unified error types for the lafrpc transport layer.

use std::fmt;
use std::io;

/// Error type for address parsing.
#[derive(Debug, PartialEq, Eq)]
pub enum AddressError {
    /// No registered scheme matches the address
    UnsupportedScheme,
    /// The URI failed to parse
    Malformed,
    /// Host component is missing or empty
    MissingHost,
    /// Port component is missing or zero
    MissingPort,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::UnsupportedScheme => write!(f, "unsupported address scheme"),
            AddressError::Malformed => write!(f, "malformed address"),
            AddressError::MissingHost => write!(f, "address has no host"),
            AddressError::MissingPort => write!(f, "address has no usable port"),
        }
    }
}

impl std::error::Error for AddressError {}

/// Error type for the magic-byte handshake at the head of every stream.
#[derive(Debug)]
pub enum HandshakeError {
    /// Fewer bytes than requested were sent or received
    Short,
    /// The peer sent a magic value we do not recognize
    UnknownMagic([u8; 2]),
    /// The raw-socket ack did not match
    BadAck,
    /// Underlying stream error
    Io(io::Error),
}

impl From<io::Error> for HandshakeError {
    fn from(e: io::Error) -> Self {
        HandshakeError::Io(e)
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Short => write!(f, "short handshake read/write"),
            HandshakeError::UnknownMagic(m) => {
                write!(f, "unknown magic bytes {:02x} {:02x}", m[0], m[1])
            }
            HandshakeError::BadAck => write!(f, "bad raw socket ack"),
            HandshakeError::Io(e) => write!(f, "handshake I/O error: {}", e),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Error type for channel framing operations.
#[derive(Debug)]
pub enum ChannelError {
    /// Packet exceeds the negotiated maximum packet size
    PacketTooLarge(usize),
    /// I/O error on the underlying stream
    Io(io::Error),
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(e)
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::PacketTooLarge(n) => write!(f, "packet of {} bytes too large", n),
            ChannelError::Io(e) => write!(f, "channel I/O error: {}", e),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(e) => Some(e),
            _ => None,
        }
    }
}
