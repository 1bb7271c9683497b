//! Session table for UDP demultiplexing.
//!
//! Each source address gets a dedicated upstream connection; the table maps
//! the address's string form to a handle for that connection. Entries are
//! created by the demux loop on first datagram and removed only by the
//! session's reader task when the upstream side ends. Locking is per-entry
//! and never held across I/O.

use dashmap::DashMap;

/// Map from a peer address key to an upstream connection handle.
pub struct SessionTable<T> {
    entries: DashMap<String, T>,
}

impl<T: Clone> SessionTable<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Look up the upstream handle for a peer, if a session exists.
    pub fn get(&self, key: &str) -> Option<T> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Record a new session for a peer.
    pub fn insert(&self, key: String, upstream: T) {
        self.entries.insert(key, upstream);
    }

    /// Remove a peer's session, returning its handle if present.
    pub fn remove(&self, key: &str) -> Option<T> {
        self.entries.remove(key).map(|(_, upstream)| upstream)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> Default for SessionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
