//! Connection-pool admission controller.
//!
//! Every socket the proxy holds open, client-side or upstream-side, is
//! registered here under a unique id. When the pool grows past its ceiling,
//! [`ConnectionPool::gc`] force-closes uniformly random victims until the
//! count drops to `max - 512`. The hysteresis band keeps a burst of accepts
//! from re-triggering eviction on every new connection.
//!
//! The pool never owns the sockets. Entries are closers: eviction shuts the
//! socket down so its owning tasks observe EOF or an I/O error and unwind
//! on their own. Owners deregister before they actually close a descriptor
//! (del-before-close), so an id present in the map always refers to a live
//! socket and eviction can never touch a recycled descriptor.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::warn;

/// How far below `max` an eviction pass shrinks the pool.
pub const GC_HEADROOM: usize = 512;

/// A pooled connection that eviction can tear down.
///
/// `force_close` must be idempotent and must not release the descriptor;
/// the owning tasks remain responsible for the final close.
pub trait PoolConn: Send + Sync {
    fn force_close(&self);
}

/// [`PoolConn`] over a borrowed descriptor.
///
/// Shuts both directions down with `shutdown(2)`. The descriptor itself
/// stays open until its owner drops the socket, which the del-before-close
/// protocol orders after deregistration.
#[derive(Debug, Clone, Copy)]
pub struct SocketRef(RawFd);

impl SocketRef {
    pub fn of(socket: &impl AsRawFd) -> Self {
        Self(socket.as_raw_fd())
    }
}

impl PoolConn for SocketRef {
    fn force_close(&self) {
        unsafe {
            libc::shutdown(self.0, libc::SHUT_RDWR);
        }
    }
}

/// Bounded registry of live connections keyed by monotonically increasing id.
pub struct ConnectionPool {
    conns: Mutex<HashMap<u64, Box<dyn PoolConn>>>,
    next_id: AtomicU64,
    max: usize,
}

impl ConnectionPool {
    /// Create a pool with the given eviction ceiling.
    ///
    /// The ceiling is validated by the server configuration, not here.
    pub fn new(max: usize) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            max,
        }
    }

    /// Register a connection and return its id. Ids are never reused.
    pub fn add(&self, conn: impl PoolConn + 'static) -> u64 {
        // Use unwrap_or_else to recover from a poisoned lock - the map is still valid
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        conns.insert(id, Box::new(conn));
        id
    }

    /// Deregister an id. Idempotent; never closes the socket.
    pub fn del(&self, id: u64) {
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.conns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict random victims if the pool has reached its ceiling.
    pub fn gc(&self) {
        self.gc_with(&mut rand::thread_rng());
    }

    /// [`ConnectionPool::gc`] with an injected RNG so tests can seed the shuffle.
    ///
    /// No-op while `len() < max`. Otherwise closes `len() - (max - 512)`
    /// connections chosen by a uniform shuffle of all current ids. Uniform
    /// selection matters: old connections may be long-lived downloads worth
    /// keeping while the newest may be the abusive ones, and the pool has no
    /// way to tell them apart.
    pub fn gc_with<R: Rng>(&self, rng: &mut R) {
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        if conns.len() < self.max {
            return;
        }

        let mut ids: Vec<u64> = conns.keys().copied().collect();
        ids.shuffle(rng);

        let floor = self.max.saturating_sub(GC_HEADROOM);
        let excess = conns.len() - floor;
        warn!(closing = excess, "too many connections, evicting at random");
        for id in ids.into_iter().take(excess) {
            if let Some(conn) = conns.get(&id) {
                conn.force_close();
            }
            conns.remove(&id);
        }
        warn!(remaining = conns.len(), "eviction pass complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Pool entry that records whether it was force-closed.
    struct FakeConn(Arc<AtomicBool>);

    impl PoolConn for FakeConn {
        fn force_close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn tracked(pool: &ConnectionPool) -> (u64, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let id = pool.add(FakeConn(Arc::clone(&closed)));
        (id, closed)
    }

    #[test]
    fn test_add_assigns_monotonic_ids() {
        let pool = ConnectionPool::new(1024);
        let (a, _) = tracked(&pool);
        let (b, _) = tracked(&pool);
        let (c, _) = tracked(&pool);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_ids_not_reused_after_del() {
        let pool = ConnectionPool::new(1024);
        let (a, _) = tracked(&pool);
        pool.del(a);
        let (b, _) = tracked(&pool);
        assert!(b > a);
    }

    #[test]
    fn test_del_is_idempotent() {
        let pool = ConnectionPool::new(1024);
        let (a, _) = tracked(&pool);
        let (_b, _) = tracked(&pool);
        pool.del(a);
        assert_eq!(pool.len(), 1);
        pool.del(a);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_del_never_closes() {
        let pool = ConnectionPool::new(1024);
        let (a, closed) = tracked(&pool);
        pool.del(a);
        assert!(!closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_gc_noop_below_max() {
        let pool = ConnectionPool::new(1024);
        let entries: Vec<_> = (0..1023).map(|_| tracked(&pool)).collect();
        pool.gc();
        assert_eq!(pool.len(), 1023);
        assert!(entries.iter().all(|(_, c)| !c.load(Ordering::SeqCst)));
    }

    #[test]
    fn test_gc_shrinks_to_hysteresis_floor() {
        let pool = ConnectionPool::new(1024);
        let entries: Vec<_> = (0..1025).map(|_| tracked(&pool)).collect();

        let mut rng = StdRng::seed_from_u64(7);
        pool.gc_with(&mut rng);

        assert_eq!(pool.len(), 1024 - GC_HEADROOM);
        let closed = entries
            .iter()
            .filter(|(_, c)| c.load(Ordering::SeqCst))
            .count();
        assert_eq!(closed, 1025 - (1024 - GC_HEADROOM));
    }

    #[test]
    fn test_gc_triggers_exactly_at_max() {
        let pool = ConnectionPool::new(1024);
        for _ in 0..1024 {
            tracked(&pool);
        }
        let mut rng = StdRng::seed_from_u64(1);
        pool.gc_with(&mut rng);
        assert_eq!(pool.len(), 1024 - GC_HEADROOM);
    }

    #[test]
    fn test_gc_victims_removed_and_closed_together() {
        let pool = ConnectionPool::new(1024);
        let entries: Vec<_> = (0..1024).map(|_| tracked(&pool)).collect();

        let mut rng = StdRng::seed_from_u64(42);
        pool.gc_with(&mut rng);

        // Survivors untouched, victims both closed and deregistered.
        let mut survivors = 0;
        for (id, closed) in &entries {
            let still_pooled = {
                let conns = pool.conns.lock().unwrap();
                conns.contains_key(id)
            };
            assert_eq!(still_pooled, !closed.load(Ordering::SeqCst));
            if still_pooled {
                survivors += 1;
            }
        }
        assert_eq!(survivors, 1024 - GC_HEADROOM);
    }

    #[test]
    fn test_gc_shuffle_is_seed_deterministic() {
        let survivors = |seed: u64| {
            let pool = ConnectionPool::new(1024);
            for _ in 0..1024 {
                tracked(&pool);
            }
            let mut rng = StdRng::seed_from_u64(seed);
            pool.gc_with(&mut rng);
            let conns = pool.conns.lock().unwrap();
            let mut ids: Vec<u64> = conns.keys().copied().collect();
            ids.sort_unstable();
            ids
        };
        assert_eq!(survivors(3), survivors(3));
        assert_ne!(survivors(3), survivors(4));
    }

    #[test]
    fn test_concurrent_adds_yield_unique_ids() {
        use std::thread;

        let pool = Arc::new(ConnectionPool::new(100_000));
        let mut handles = vec![];
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                let mut ids = Vec::with_capacity(500);
                for _ in 0..500 {
                    let closed = Arc::new(AtomicBool::new(false));
                    ids.push(pool.add(FakeConn(closed)));
                }
                ids
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8 * 500);
        assert_eq!(pool.len(), 8 * 500);
    }
}
