//! Registry of adopted raw side-band sockets.
//!
//! Server handler tasks insert streams keyed by the 16-byte connection id
//! the client announced; the RPC core later adopts them with `take`. Take
//! removes the entry, so a second take for the same id returns `None`.
//! Entries that were never taken expire after [`RAW_SOCKET_TTL`], checked
//! lazily whenever the registry is touched.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::*;

use super::handshake::ConnectionId;
use super::stream::RpcStream;

/// How long an adopted raw socket waits to be taken.
pub const RAW_SOCKET_TTL: Duration = Duration::from_secs(300);

struct Entry {
    stream: RpcStream,
    arrived: Instant,
}

/// Shared map from connection id to adopted stream.
#[derive(Default)]
pub struct RawSocketRegistry {
    entries: Mutex<HashMap<ConnectionId, Entry>>,
}

impl RawSocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a stream under `id`, overwriting any existing entry.
    pub fn insert(&self, id: ConnectionId, stream: RpcStream) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        Self::evict_expired(&mut entries);
        if entries
            .insert(
                id,
                Entry {
                    stream,
                    arrived: Instant::now(),
                },
            )
            .is_some()
        {
            debug!("raw socket id reused, previous stream dropped");
        }
    }

    /// Adopt and remove the stream stored under `id`.
    pub fn take(&self, id: &ConnectionId) -> Option<RpcStream> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        Self::evict_expired(&mut entries);
        entries.remove(id).map(|e| e.stream)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(entries: &mut HashMap<ConnectionId, Entry>) {
        let before = entries.len();
        entries.retain(|_, e| e.arrived.elapsed() < RAW_SOCKET_TTL);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("evicted {} expired raw socket(s)", evicted);
        }
    }
}
