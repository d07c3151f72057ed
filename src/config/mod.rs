//! Configuration module for the transport layer.
//!
//! This module provides all configuration types and parsing logic:
//! - `Config` - Root configuration container
//! - `RpcSettings` - Packet size and connect timeout
//! - `TlsSettings` - Certificate material and verification mode
//! - `KcpSettings` - Reliable-UDP tuning knobs
//! - `HttpSettings` - Document root for the dual-use HTTP port

mod parser;
mod types;

pub use parser::load_config;
pub use types::*;
