use std::net::SocketAddrV4;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::processor::AddressResolver;

#[derive(Debug, Clone, Copy)]
struct ConnEntry {
    addr: SocketAddrV4,
    last_seen: Instant,
}

/// Peer addresses learned from connect events, keyed by `(pid, fd)`.
///
/// Entries not refreshed within the configured idle timeout are dropped by
/// [`ConnTable::evict_idle`].
#[derive(Debug, Default)]
pub struct ConnTable {
    conns: DashMap<(u32, u32), ConnEntry>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the peer of `(pid, fd)`, replacing any earlier connection on
    /// the same descriptor.
    pub fn insert(&self, pid: u32, fd: u32, addr: SocketAddrV4) {
        let entry = ConnEntry {
            addr,
            last_seen: Instant::now(),
        };
        if let Some(prev) = self.conns.insert((pid, fd), entry) {
            if prev.addr != addr {
                tracing::debug!(pid, fd, prev = %prev.addr, %addr, "descriptor reused for new peer");
            }
        }
    }

    /// Mark `(pid, fd)` as still carrying traffic.
    pub fn touch(&self, pid: u32, fd: u32) {
        if let Some(mut entry) = self.conns.get_mut(&(pid, fd)) {
            entry.last_seen = Instant::now();
        }
    }

    /// Drop entries idle for at least `idle_timeout`. Returns how many were removed.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;

        self.conns.retain(|_, entry| {
            let keep = now.duration_since(entry.last_seen) < idle_timeout;
            if !keep {
                evicted += 1;
            }
            keep
        });

        evicted
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl AddressResolver for ConnTable {
    fn lookup(&self, pid: u32, fd: u32) -> Option<SocketAddrV4> {
        self.conns.get(&(pid, fd)).map(|entry| entry.addr)
    }
}
