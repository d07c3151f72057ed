//! Configuration file parser.
//!
//! Parses TOML-style configuration files with a custom lightweight parser:
//! `section.key = value` lines, `#` comments, no nesting.

use std::{fs, io};

use super::types::*;

/// Load configuration from a file path.
pub fn load_config(path: &str) -> io::Result<Config> {
    let s = fs::read_to_string(path)?;
    parse_config(&s)
}

fn parse_config(s: &str) -> io::Result<Config> {
    let mut cfg = Config::default();

    for (lineno, line) in s.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((lhs, rhs)) = line.split_once('=') else {
            continue;
        };
        let lhs = lhs.trim();
        let mut val = rhs.trim();
        if val.contains('#') {
            val = val.split('#').next().unwrap_or_default().trim();
        }

        let (section, key) = if let Some((a, b)) = lhs.split_once('.') {
            (a.trim(), b.trim())
        } else {
            ("", lhs)
        };

        if section.is_empty() {
            continue;
        }

        set_config_value(section, key, val, &mut cfg).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line {}: {}", lineno + 1, e),
            )
        })?;
    }

    Ok(cfg)
}

fn set_config_value(section: &str, key: &str, val: &str, cfg: &mut Config) -> Result<(), String> {
    macro_rules! parse {
        (s) => {
            val.trim_matches('"').to_string()
        };
        (b) => {
            match val {
                "true" => true,
                "false" => false,
                _ => return Err(format!("bad bool {val}")),
            }
        };
        (u) => {
            val.parse::<u64>().map_err(|e| e.to_string())?
        };
        (usize_) => {
            val.parse::<usize>().map_err(|e| e.to_string())?
        };
        (i32_) => {
            val.parse::<i32>().map_err(|e| e.to_string())?
        };
        (u16_) => {
            val.parse::<u16>().map_err(|e| e.to_string())?
        };
    }

    match (section, key) {
        ("rpc", "max_packet_size") => cfg.rpc.max_packet_size = parse!(usize_),
        ("rpc", "connect_timeout_ms") => cfg.rpc.connect_timeout_ms = parse!(u),

        ("tls", "cert_path") => cfg.tls.get_or_insert_with(Default::default).cert_path = parse!(s),
        ("tls", "key_path") => cfg.tls.get_or_insert_with(Default::default).key_path = parse!(s),
        ("tls", "ca_path") => cfg.tls.get_or_insert_with(Default::default).ca_path = parse!(s),
        ("tls", "insecure_skip_verify") => {
            cfg.tls.get_or_insert_with(Default::default).insecure_skip_verify = parse!(b)
        }

        ("kcp", "mtu") => cfg.kcp.mtu = parse!(usize_),
        ("kcp", "interval_ms") => cfg.kcp.interval_ms = parse!(i32_),
        ("kcp", "resend") => cfg.kcp.resend = parse!(i32_),
        ("kcp", "nodelay") => cfg.kcp.nodelay = parse!(b),
        ("kcp", "congestion_off") => cfg.kcp.congestion_off = parse!(b),
        ("kcp", "snd_wnd") => cfg.kcp.snd_wnd = parse!(u16_),
        ("kcp", "rcv_wnd") => cfg.kcp.rcv_wnd = parse!(u16_),
        ("kcp", "session_expire_ms") => cfg.kcp.session_expire_ms = parse!(u),

        ("http", "root_dir") => cfg.http.root_dir = parse!(s),

        _ => return Err(format!("unknown key {section}.{key}")),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_file() {
        let cfg = parse_config(
            r#"
# transport settings
rpc.max_packet_size = 65536
rpc.connect_timeout_ms = 2000

tls.cert_path = "certs/server.pem"   # chain
tls.key_path = "certs/server.key"
tls.insecure_skip_verify = true

kcp.mtu = 1200
kcp.nodelay = false

http.root_dir = "/var/www"
"#,
        )
        .unwrap();

        assert_eq!(cfg.rpc.max_packet_size, 65536);
        assert_eq!(cfg.rpc.connect_timeout_ms, 2000);
        let tls = cfg.tls.unwrap();
        assert_eq!(tls.cert_path, "certs/server.pem");
        assert!(tls.insecure_skip_verify);
        assert_eq!(cfg.kcp.mtu, 1200);
        assert!(!cfg.kcp.nodelay);
        assert_eq!(cfg.http.root_dir, "/var/www");
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(parse_config("rpc.bogus = 1").is_err());
    }

    #[test]
    fn defaults_without_tls_section() {
        let cfg = parse_config("rpc.max_packet_size = 100").unwrap();
        assert!(cfg.tls.is_none());
        assert_eq!(cfg.kcp.mtu, 1400);
    }
}
