//! Bidirectional splicing between an established client/remote pair.
//!
//! Each pair runs two independent half-duplex copiers. A copier that
//! finishes, for any reason, deregisters its tagged pool id and forces both
//! sockets shut; its peer then observes EOF or an I/O error on its next
//! operation and unwinds the same way. No cancellation channel is needed,
//! and pool eviction terminates a pair through exactly the same path.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::debug;

use crate::pool::ConnectionPool;
use crate::stats::Stats;
use crate::stream::{self, CopyOp};

/// Which peer a copier reads from; selects the error counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Leg {
    Client,
    DirectServer,
    ProxyServer,
}

impl Leg {
    fn name(self) -> &'static str {
        match self {
            Leg::Client => "client",
            Leg::DirectServer => "directserver",
            Leg::ProxyServer => "proxyserver",
        }
    }
}

/// Bump the counter for a failed copy. Client-sourced errors have no
/// counter; only the server-side legs are tracked.
pub(crate) fn record_copy_error(stats: &Stats, source: Leg, op: CopyOp) {
    use std::sync::atomic::Ordering::Relaxed;
    let counter = match (source, op) {
        (Leg::ProxyServer, CopyOp::Read) => &stats.proxy_server_read_err,
        (Leg::ProxyServer, CopyOp::Write) => &stats.proxy_server_write_err,
        (Leg::DirectServer, CopyOp::Read) => &stats.direct_server_read_err,
        (Leg::DirectServer, CopyOp::Write) => &stats.direct_server_write_err,
        (Leg::Client, _) => return,
    };
    counter.fetch_add(1, Relaxed);
}

/// Run one half-duplex copy to completion, then tear the pair down:
/// classify and count the error, deregister the tagged id, and shut both
/// sockets so the peer copier unblocks.
async fn copy_half(
    pool: Arc<ConnectionPool>,
    stats: Arc<Stats>,
    src: Arc<TcpStream>,
    dst: Arc<TcpStream>,
    source: Leg,
    tag: u64,
) {
    match stream::copy(&src, &dst).await {
        Ok(bytes) => debug!(from = source.name(), bytes, "stream drained"),
        Err((op, err)) => {
            record_copy_error(&stats, source, op);
            debug!(from = source.name(), ?op, error = %err, "stream copy ended");
        }
    }
    pool.del(tag);
    stream::force_close(&src);
    stream::force_close(&dst);
}

/// Spawn the two copiers for an established pair.
///
/// Copier A reads the client and is tagged with the client's pool id;
/// copier B reads the remote end and is tagged with the remote's id. Both
/// ids leave the pool before the descriptors close: each copier
/// deregisters its own tag first, and the sockets only close once every
/// shared handle has dropped.
pub(crate) fn spawn_pair(
    pool: &Arc<ConnectionPool>,
    stats: &Arc<Stats>,
    client: Arc<TcpStream>,
    client_id: u64,
    remote: Arc<TcpStream>,
    remote_id: u64,
    remote_leg: Leg,
) {
    tokio::spawn(copy_half(
        Arc::clone(pool),
        Arc::clone(stats),
        Arc::clone(&client),
        Arc::clone(&remote),
        Leg::Client,
        client_id,
    ));
    tokio::spawn(copy_half(
        Arc::clone(pool),
        Arc::clone(stats),
        remote,
        client,
        remote_leg,
        remote_id,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SocketRef;
    use std::io;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn tcp_pair() -> Option<(TcpStream, TcpStream)> {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return None,
            Err(e) => panic!("Failed to bind listener for test: {e}"),
        };
        let addr = listener.local_addr().unwrap();
        let (a, b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        Some((a.unwrap(), b.unwrap().0))
    }

    async fn wait_for_empty(pool: &ConnectionPool) {
        for _ in 0..200 {
            if pool.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never drained: {} entries left", pool.len());
    }

    #[tokio::test]
    async fn test_pair_relays_both_directions() {
        let Some((mut app, client_side)) = tcp_pair().await else { return };
        let Some((remote_side, mut origin)) = tcp_pair().await else { return };

        let pool = Arc::new(ConnectionPool::new(1024));
        let stats = Arc::new(Stats::new());
        let client = Arc::new(client_side);
        let remote = Arc::new(remote_side);
        let cid = pool.add(SocketRef::of(client.as_ref()));
        let rid = pool.add(SocketRef::of(remote.as_ref()));

        spawn_pair(&pool, &stats, client, cid, remote, rid, Leg::DirectServer);

        app.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"pong").await.unwrap();
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_client_close_tears_down_pair_and_pool() {
        let Some((app, client_side)) = tcp_pair().await else { return };
        let Some((remote_side, mut origin)) = tcp_pair().await else { return };

        let pool = Arc::new(ConnectionPool::new(1024));
        let stats = Arc::new(Stats::new());
        let client = Arc::new(client_side);
        let remote = Arc::new(remote_side);
        let cid = pool.add(SocketRef::of(client.as_ref()));
        let rid = pool.add(SocketRef::of(remote.as_ref()));

        spawn_pair(&pool, &stats, client, cid, remote, rid, Leg::ProxyServer);

        drop(app);

        wait_for_empty(&pool).await;
        // The remote end observes the propagated close as EOF.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), origin.read(&mut buf))
            .await
            .expect("origin never observed the close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_remote_close_tears_down_pair_and_pool() {
        let Some((mut app, client_side)) = tcp_pair().await else { return };
        let Some((remote_side, origin)) = tcp_pair().await else { return };

        let pool = Arc::new(ConnectionPool::new(1024));
        let stats = Arc::new(Stats::new());
        let client = Arc::new(client_side);
        let remote = Arc::new(remote_side);
        let cid = pool.add(SocketRef::of(client.as_ref()));
        let rid = pool.add(SocketRef::of(remote.as_ref()));

        spawn_pair(&pool, &stats, client, cid, remote, rid, Leg::DirectServer);

        drop(origin);

        wait_for_empty(&pool).await;
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), app.read(&mut buf))
            .await
            .expect("app never observed the close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_record_copy_error_counter_selection() {
        use std::sync::atomic::Ordering::Relaxed;

        let stats = Stats::new();
        record_copy_error(&stats, Leg::ProxyServer, CopyOp::Read);
        record_copy_error(&stats, Leg::ProxyServer, CopyOp::Write);
        record_copy_error(&stats, Leg::DirectServer, CopyOp::Read);
        record_copy_error(&stats, Leg::DirectServer, CopyOp::Write);
        record_copy_error(&stats, Leg::Client, CopyOp::Read);
        record_copy_error(&stats, Leg::Client, CopyOp::Write);

        assert_eq!(stats.proxy_server_read_err.load(Relaxed), 1);
        assert_eq!(stats.proxy_server_write_err.load(Relaxed), 1);
        assert_eq!(stats.direct_server_read_err.load(Relaxed), 1);
        assert_eq!(stats.direct_server_write_err.load(Relaxed), 1);
        // Client-sourced errors increment nothing.
        let snap = stats.snapshot();
        assert_eq!(
            snap.proxy_server_read_err
                + snap.proxy_server_write_err
                + snap.direct_server_read_err
                + snap.direct_server_write_err,
            4
        );
    }
}
