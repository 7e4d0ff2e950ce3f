//! Bounded reverse-lookup cache for CONNECT target substitution.
//!
//! Maps destination IP strings to the hostname a reverse DNS lookup
//! produced, so repeat connections to the same address skip the lookup.
//! Storage is a fixed ring of 65 536 keys plus a hashmap: storing into an
//! occupied slot evicts the oldest-inserted key from both structures.
//! Replacement is FIFO, not LRU; hostnames rarely change within the one-hour
//! entry lifetime, so recency tracking would buy nothing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Ring capacity; the cache never holds more entries than this.
pub const CACHE_SLOTS: usize = 65_536;

/// Entries expire this long after insertion.
const ENTRY_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct CacheEntry {
    hostname: String,
    expires: Instant,
}

#[derive(Debug)]
struct CacheInner {
    hostnames: HashMap<String, CacheEntry>,
    keys: Vec<String>,
    next: usize,
}

/// Mutexed IP-to-hostname cache with FIFO replacement and TTL expiry.
#[derive(Debug)]
pub struct ReverseLookupCache {
    inner: Mutex<CacheInner>,
}

impl ReverseLookupCache {
    pub fn new() -> Self {
        Self::with_slots(CACHE_SLOTS)
    }

    fn with_slots(slots: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                hostnames: HashMap::new(),
                keys: vec![String::new(); slots],
                next: 0,
            }),
        }
    }

    /// Look up the hostname for an IP string.
    ///
    /// Expired entries are dropped on the way out and reported as misses.
    pub fn lookup(&self, ipv4: &str) -> Option<String> {
        // Use unwrap_or_else to recover from a poisoned lock - the data is still valid
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let expired = matches!(inner.hostnames.get(ipv4), Some(entry) if entry.expires <= now);
        if expired {
            inner.hostnames.remove(ipv4);
            return None;
        }
        inner.hostnames.get(ipv4).map(|entry| entry.hostname.clone())
    }

    /// Store a resolved hostname, evicting the oldest-inserted key if the
    /// ring slot is occupied.
    pub fn store(&self, ipv4: &str, hostname: &str) {
        self.store_until(ipv4, hostname, Instant::now() + ENTRY_TTL);
    }

    fn store_until(&self, ipv4: &str, hostname: &str, expires: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = inner.next;
        let evicted = std::mem::replace(&mut inner.keys[slot], ipv4.to_string());
        inner.hostnames.remove(&evicted);
        inner.next = (slot + 1) % inner.keys.len();
        inner.hostnames.insert(
            ipv4.to_string(),
            CacheEntry {
                hostname: hostname.to_string(),
                expires,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .hostnames
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReverseLookupCache {
    fn default() -> Self {
        Self::new()
    }
}
