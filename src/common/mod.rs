//! Common utilities shared across the codebase.
//!
//! This module provides foundational pieces used by every transport:
//! - Error types for unified error handling
//! - Address parsing and formatting

pub mod addr;
pub mod error;

// Re-export commonly used items for convenience
pub use addr::{format_address, has_scheme, parse_address, ParsedAddress};
pub use error::{AddressError, ChannelError, HandshakeError};
