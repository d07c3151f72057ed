//! Address parsing and formatting shared by all transports.
//!
//! Addresses are URI-shaped: `tcp://host:port`, `ssl://host:port`,
//! `kcp://host:port`, `kcp+ssl://host:port` (alias `ssl+kcp://`),
//! `http://host:port/path`, `https://host:port/path`. Custom schemes match
//! case-sensitively, HTTP/HTTPS case-insensitively.

use std::net::Ipv6Addr;

use url::Url;

use super::error::AddressError;

/// A successfully parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub scheme: String,
    /// Host without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// Path component; `/` when absent. Only meaningful for HTTP addresses.
    pub path: String,
}

/// Check whether `address` starts with `scheme://`.
///
/// HTTP and HTTPS match case-insensitively, every other scheme matches
/// case-sensitively, mirroring how peers advertise addresses.
pub fn has_scheme(address: &str, scheme: &str) -> bool {
    let prefix_len = scheme.len() + 3;
    if address.len() < prefix_len {
        return false;
    }
    let (head, _) = address.split_at(prefix_len);
    if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") {
        head.eq_ignore_ascii_case(&format!("{}://", scheme))
    } else {
        head == format!("{}://", scheme)
    }
}

/// Parse `address` against the accepted `schemes`.
///
/// Succeeds iff one of `schemes` matches, the URI is valid, the host is
/// non-empty and the port is present and strictly positive. HTTP/HTTPS fall
/// back to their well-known default ports.
pub fn parse_address(schemes: &[&str], address: &str) -> Result<ParsedAddress, AddressError> {
    let scheme = schemes
        .iter()
        .find(|s| has_scheme(address, s))
        .ok_or(AddressError::UnsupportedScheme)?;

    let url = Url::parse(address).map_err(|_| AddressError::Malformed)?;

    let host = match url.host_str() {
        Some(h) if !h.is_empty() => strip_brackets(h).to_string(),
        _ => return Err(AddressError::MissingHost),
    };

    let is_http = scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https");
    let port = if is_http {
        url.port_or_known_default()
    } else {
        url.port()
    };
    let port = match port {
        Some(p) if p > 0 => p,
        _ => return Err(AddressError::MissingPort),
    };

    let path = if url.path().is_empty() {
        "/".to_string()
    } else {
        url.path().to_string()
    };

    Ok(ParsedAddress {
        scheme: url.scheme().to_ascii_lowercase(),
        host,
        port,
        path,
    })
}

/// Fill a `scheme://{}:{}` template with host and port, bracketing IPv6
/// hosts. Used both for canonical addresses and for logged peer addresses.
pub fn format_address(template: &str, host: &str, port: u16) -> String {
    let host = if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    template
        .replacen("{}", &host, 1)
        .replacen("{}", &port.to_string(), 1)
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
