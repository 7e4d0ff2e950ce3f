//! Increment-only counters covering every connection outcome.
//!
//! All counters use relaxed atomic increments; nothing ever reads a counter
//! together with another under a lock. [`Stats::snapshot`] takes a loose
//! point-in-time copy for the signal-driven dump.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter block, one instance per server.
#[derive(Debug, Default)]
pub struct Stats {
    pub accept_errors: AtomicU64,
    pub accept_successes: AtomicU64,
    pub direct_connections: AtomicU64,
    pub proxied_connections: AtomicU64,
    pub proxy_server_read_err: AtomicU64,
    pub proxy_server_write_err: AtomicU64,
    pub direct_server_read_err: AtomicU64,
    pub direct_server_write_err: AtomicU64,
    pub proxy_200_responses: AtomicU64,
    pub proxy_300_responses: AtomicU64,
    pub proxy_400_responses: AtomicU64,
    pub proxy_non_200_responses: AtomicU64,
    pub proxy_no_connect_responses: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy all counters. Values are loaded one by one, so the snapshot is
    /// not a consistent cut across counters; it does not need to be.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            accept_errors: load(&self.accept_errors),
            accept_successes: load(&self.accept_successes),
            direct_connections: load(&self.direct_connections),
            proxied_connections: load(&self.proxied_connections),
            proxy_server_read_err: load(&self.proxy_server_read_err),
            proxy_server_write_err: load(&self.proxy_server_write_err),
            direct_server_read_err: load(&self.direct_server_read_err),
            direct_server_write_err: load(&self.direct_server_write_err),
            proxy_200_responses: load(&self.proxy_200_responses),
            proxy_300_responses: load(&self.proxy_300_responses),
            proxy_400_responses: load(&self.proxy_400_responses),
            proxy_non_200_responses: load(&self.proxy_non_200_responses),
            proxy_no_connect_responses: load(&self.proxy_no_connect_responses),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accept_errors: u64,
    pub accept_successes: u64,
    pub direct_connections: u64,
    pub proxied_connections: u64,
    pub proxy_server_read_err: u64,
    pub proxy_server_write_err: u64,
    pub direct_server_read_err: u64,
    pub direct_server_write_err: u64,
    pub proxy_200_responses: u64,
    pub proxy_300_responses: u64,
    pub proxy_400_responses: u64,
    pub proxy_non_200_responses: u64,
    pub proxy_no_connect_responses: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accepts={} accept_errors={} direct={} proxied={} \
             proxy_read_err={} proxy_write_err={} direct_read_err={} direct_write_err={} \
             connect_200={} connect_300={} connect_400={} connect_other={} connect_no_response={}",
            self.accept_successes,
            self.accept_errors,
            self.direct_connections,
            self.proxied_connections,
            self.proxy_server_read_err,
            self.proxy_server_write_err,
            self.direct_server_read_err,
            self.direct_server_write_err,
            self.proxy_200_responses,
            self.proxy_300_responses,
            self.proxy_400_responses,
            self.proxy_non_200_responses,
            self.proxy_no_connect_responses,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_starts_at_zero() {
        let stats = Stats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = Stats::new();
        stats.accept_successes.fetch_add(3, Ordering::Relaxed);
        stats.proxy_200_responses.fetch_add(2, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.accept_successes, 3);
        assert_eq!(snap.proxy_200_responses, 2);
        assert_eq!(snap.accept_errors, 0);
    }

    #[test]
    fn test_display_names_every_counter() {
        let stats = Stats::new();
        stats.proxy_no_connect_responses.fetch_add(7, Ordering::Relaxed);
        let line = stats.snapshot().to_string();
        assert!(line.contains("connect_no_response=7"));
        assert!(line.contains("accepts=0"));
        assert!(line.contains("direct_write_err=0"));
    }
}
