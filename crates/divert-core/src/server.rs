//! Accept loop and per-connection orchestration.
//!
//! One task per accepted connection. The orchestrator recovers the original
//! destination, consults the director, and either dials it directly or
//! walks the upstream CONNECT proxies in failover order; an established
//! tunnel hands off to the splicer. Pool admission runs before every accept
//! and every dial.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::cache::ReverseLookupCache;
use crate::connect::{self, ConnectStatus, Upstream};
use crate::director::{DirectRule, Director};
use crate::origdst;
use crate::pool::{ConnectionPool, SocketRef};
use crate::sni;
use crate::splice::{self, Leg};
use crate::stats::Stats;
use crate::stream;
use crate::{ProxyError, Result};

/// Smallest accepted connection ceiling; anything lower would starve the
/// eviction hysteresis band.
pub const MIN_MAX_CONNECTIONS: usize = 1024;

/// Written to the client when every upstream candidate failed.
const ERR_NO_PROXIES: &[u8] = b"HTTP/1.0 503 Service Unavailable\r\nServer: go-any-proxy\r\nX-AnyProxy-Error: ERR_NO_PROXIES\r\n\r\n";

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the redirected listener binds to.
    pub listen_addr: SocketAddr,

    /// Upstream CONNECT proxies in failover order. Empty means every
    /// connection goes direct.
    pub upstreams: Vec<Upstream>,

    /// Destinations that bypass the upstream chain.
    pub direct_rules: Vec<DirectRule>,

    /// Pool ceiling; eviction starts once this many connections are live.
    /// Must be at least [`MIN_MAX_CONNECTIONS`].
    pub max_connections: usize,

    /// Relay upstream 302 responses to clients.
    pub relay_redirects: bool,

    /// Reverse-resolve destination IPs and CONNECT to the hostname.
    pub reverse_lookups: bool,

    /// Parse the TLS ClientHello and CONNECT to the SNI name.
    pub sni_parsing: bool,

    /// Skip the startup reachability probe of upstreams.
    pub skip_upstream_healthcheck: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3128".parse().expect("hardcoded loopback address"),
            upstreams: vec![],
            direct_rules: vec![],
            max_connections: 4096,
            relay_redirects: false,
            reverse_lookups: false,
            sni_parsing: false,
            skip_upstream_healthcheck: false,
        }
    }
}

/// State shared by the accept loop, orchestrators, and copiers.
struct Shared {
    pool: Arc<ConnectionPool>,
    stats: Arc<Stats>,
    upstreams: Vec<Upstream>,
    director: Director,
    cache: Option<ReverseLookupCache>,
    relay_redirects: bool,
    sni_parsing: bool,
}

/// Transparent forwarding proxy server.
#[derive(Debug)]
pub struct ProxyServer {
    config: ProxyConfig,
    stats: Arc<Stats>,
}

impl ProxyServer {
    /// Validate the configuration and create a server.
    ///
    /// # Errors
    /// * `ProxyError::Config` - `max_connections` below [`MIN_MAX_CONNECTIONS`].
    pub fn new(config: ProxyConfig) -> Result<Self> {
        if config.max_connections < MIN_MAX_CONNECTIONS {
            return Err(ProxyError::Config(format!(
                "max_connections must be at least {MIN_MAX_CONNECTIONS}, got {}",
                config.max_connections
            )));
        }
        Ok(Self {
            config,
            stats: Arc::new(Stats::new()),
        })
    }

    /// Counter block, shared with the caller for the signal-driven dump.
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Bind the configured address and serve until process termination.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        self.run_on(listener).await
    }

    /// Serve on a pre-bound listener.
    ///
    /// Lets callers learn the OS-assigned port before the loop starts.
    /// Health-checks the upstream list first; the accept loop itself never
    /// exits.
    pub async fn run_on(self, listener: TcpListener) -> Result<()> {
        let shared = Arc::new(self.prepare().await?);
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, upstreams = shared.upstreams.len(), "listening for redirected connections");
        }

        loop {
            shared.pool.gc();

            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    shared.stats.accept_errors.fetch_add(1, Relaxed);
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let client = Arc::new(stream);
            let cid = shared.pool.add(SocketRef::of(client.as_ref()));
            shared.stats.accept_successes.fetch_add(1, Relaxed);
            tokio::spawn(handle_connection(Arc::clone(&shared), client, cid, peer));
        }
    }

    /// Health-check upstreams and assemble the shared state.
    async fn prepare(&self) -> Result<Shared> {
        let pool = Arc::new(ConnectionPool::new(self.config.max_connections));

        let mut upstreams = self.config.upstreams.clone();
        if !upstreams.is_empty() && !self.config.skip_upstream_healthcheck {
            upstreams = check_upstreams(&pool, upstreams).await?;
        }
        for upstream in &upstreams {
            info!(proxy = %upstream.addr(), auth = upstream.credentials.is_some(), "upstream proxy configured");
        }

        Ok(Shared {
            pool,
            stats: Arc::clone(&self.stats),
            upstreams,
            director: Director::new(self.config.direct_rules.clone()),
            cache: self.config.reverse_lookups.then(ReverseLookupCache::new),
            relay_redirects: self.config.relay_redirects,
            sni_parsing: self.config.sni_parsing,
        })
    }
}

/// Probe each upstream with a TCP connect, dropping unreachable ones.
///
/// # Errors
/// * `ProxyError::Config` - the probe emptied the list.
async fn check_upstreams(
    pool: &Arc<ConnectionPool>,
    upstreams: Vec<Upstream>,
) -> Result<Vec<Upstream>> {
    let mut reachable = Vec::with_capacity(upstreams.len());
    for upstream in upstreams {
        match dial(pool, &upstream.addr()).await {
            Ok((conn, id)) => {
                pool.del(id);
                stream::force_close(&conn);
                reachable.push(upstream);
            }
            Err(e) => {
                warn!(proxy = %upstream.addr(), error = %e, "upstream unreachable, removing from failover list");
            }
        }
    }
    if reachable.is_empty() {
        return Err(ProxyError::Config(
            "none of the configured upstream proxies are reachable".to_string(),
        ));
    }
    Ok(reachable)
}

/// Resolve a `host:port` spec, connect, and register the socket.
///
/// Runs a gc pass first so dialing is subject to the same admission
/// pressure as accepting.
async fn dial(pool: &Arc<ConnectionPool>, spec: &str) -> Result<(Arc<TcpStream>, u64)> {
    let addr = resolve(spec).await?;
    pool.gc();
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ProxyError::DialConnect {
            addr: spec.to_string(),
            source,
        })?;
    let conn = Arc::new(stream);
    let id = pool.add(SocketRef::of(conn.as_ref()));
    Ok((conn, id))
}

/// Resolve a spec to one address, preferring IPv4.
async fn resolve(spec: &str) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(spec)
        .await
        .map_err(|source| ProxyError::DialResolve {
            host: spec.to_string(),
            source,
        })?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ProxyError::DialResolve {
            host: spec.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
        })
}

/// Should this destination bypass the upstream chain?
fn wants_direct(shared: &Shared, ip: Ipv4Addr) -> bool {
    shared.upstreams.is_empty() || shared.director.evaluate(ip).0
}

/// Per-connection orchestrator.
async fn handle_connection(
    shared: Arc<Shared>,
    client: Arc<TcpStream>,
    cid: u64,
    peer: SocketAddr,
) {
    let (dst_ip, dst_port) = match origdst::original_dst(&client) {
        Ok(dst) => dst,
        Err(e) => {
            info!(client = %peer, error = %e, "cannot recover original destination, dropping connection");
            shared.stats.accept_errors.fetch_add(1, Relaxed);
            shared.pool.del(cid);
            stream::force_close(&client);
            return;
        }
    };
    debug!(client = %peer, dst = %format_args!("{dst_ip}:{dst_port}"), "recovered original destination");

    if wants_direct(&shared, dst_ip) {
        handle_direct(shared, client, cid, dst_ip, dst_port).await;
    } else {
        handle_proxied(shared, client, cid, dst_ip, dst_port, peer).await;
    }
}

/// Direct route: dial the original destination and splice.
async fn handle_direct(
    shared: Arc<Shared>,
    client: Arc<TcpStream>,
    cid: u64,
    dst_ip: Ipv4Addr,
    dst_port: u16,
) {
    let target = format!("{dst_ip}:{dst_port}");
    let (remote, rid) = match dial(&shared.pool, &target).await {
        Ok(dialed) => dialed,
        Err(e) => {
            info!(%target, error = %e, "direct connect failed, giving up");
            shared.pool.del(cid);
            stream::force_close(&client);
            return;
        }
    };
    shared.stats.direct_connections.fetch_add(1, Relaxed);
    debug!(%target, "direct tunnel up");
    splice::spawn_pair(
        &shared.pool,
        &shared.stats,
        client,
        cid,
        remote,
        rid,
        Leg::DirectServer,
    );
}

/// Proxied route: walk the upstreams in order until one tunnel sticks.
async fn handle_proxied(
    shared: Arc<Shared>,
    client: Arc<TcpStream>,
    cid: u64,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    peer: SocketAddr,
) {
    let client_ip = peer.ip().to_string();

    let mut connect_host = dst_ip.to_string();
    if let Some(cache) = &shared.cache {
        if let Some(hostname) = reverse_hostname(cache, dst_ip).await {
            connect_host = hostname;
        }
    }

    // The ClientHello is peeked at most once; later candidates reuse the
    // cached name and replay the same buffered bytes.
    let mut peeked: Option<(Option<String>, Vec<u8>)> = None;

    for upstream in &shared.upstreams {
        let (remote, rid) = match dial(&shared.pool, &upstream.addr()).await {
            Ok(dialed) => dialed,
            Err(e) => {
                debug!(proxy = %upstream.addr(), error = %e, "upstream dial failed, trying next");
                continue;
            }
        };

        let mut host = connect_host.clone();
        if shared.sni_parsing {
            if peeked.is_none() {
                let mut buf = Vec::new();
                let name = match sni::peek_server_name(&client, &mut buf).await {
                    Ok(name) => name,
                    Err(e) => {
                        debug!(error = %e, "client handshake peek failed");
                        None
                    }
                };
                peeked = Some((name, buf));
            }
            if let Some((Some(name), _)) = &peeked {
                host = name.clone();
            }
        }

        let request =
            connect::connect_request(&host, dst_port, upstream.credentials.as_deref(), Some(&client_ip));
        debug!(proxy = %upstream.addr(), dst = %format_args!("{host}:{dst_port}"), "sending CONNECT");
        if let Err(e) = stream::write_all(&remote, request.as_bytes()).await {
            debug!(proxy = %upstream.addr(), error = %e, "could not send CONNECT, trying next");
            abandon(&shared.pool, &remote, rid);
            continue;
        }

        if let Some((_, handshake)) = &peeked {
            if !handshake.is_empty() {
                if let Err(e) = stream::write_all(&remote, handshake).await {
                    debug!(proxy = %upstream.addr(), error = %e, "could not replay handshake, trying next");
                    abandon(&shared.pool, &remote, rid);
                    continue;
                }
            }
        }

        let (status_line, leftover) = match stream::read_line(&remote).await {
            Ok(line) => line,
            Err(e) => {
                shared.stats.proxy_no_connect_responses.fetch_add(1, Relaxed);
                info!(proxy = %upstream.addr(), error = %e, "no response to CONNECT, trying next");
                abandon(&shared.pool, &remote, rid);
                continue;
            }
        };
        let status = String::from_utf8_lossy(&status_line).into_owned();

        match connect::classify_status(&status, shared.relay_redirects) {
            ConnectStatus::BadRequest => {
                shared.stats.proxy_400_responses.fetch_add(1, Relaxed);
                debug!(proxy = %upstream.addr(), "CONNECT answered 400, relaying error body");
                relay_and_finish(&shared, &client, cid, &remote, rid, None, &leftover).await;
                return;
            }
            ConnectStatus::Redirect => {
                shared.stats.proxy_300_responses.fetch_add(1, Relaxed);
                debug!(proxy = %upstream.addr(), status = status.trim(), "relaying redirect");
                relay_and_finish(&shared, &client, cid, &remote, rid, Some(&status_line), &leftover)
                    .await;
                return;
            }
            ConnectStatus::Established => {
                shared.stats.proxy_200_responses.fetch_add(1, Relaxed);
                shared.stats.proxied_connections.fetch_add(1, Relaxed);
                debug!(proxy = %upstream.addr(), dst = %format_args!("{host}:{dst_port}"), "tunnel established");
                splice::spawn_pair(
                    &shared.pool,
                    &shared.stats,
                    client,
                    cid,
                    remote,
                    rid,
                    Leg::ProxyServer,
                );
                return;
            }
            ConnectStatus::Refused => {
                shared.stats.proxy_non_200_responses.fetch_add(1, Relaxed);
                info!(proxy = %upstream.addr(), status = status.trim(), "CONNECT refused, trying next");
                abandon(&shared.pool, &remote, rid);
            }
        }
    }

    info!(dst = %format_args!("{dst_ip}:{dst_port}"), "all upstream proxies failed, giving up");
    let _ = stream::write_all(&client, ERR_NO_PROXIES).await;
    shared.pool.del(cid);
    stream::force_close(&client);
}

/// Relay the rest of an upstream response to the client, then terminate the
/// pair: both ids leave the pool before either socket shuts.
async fn relay_and_finish(
    shared: &Shared,
    client: &Arc<TcpStream>,
    cid: u64,
    remote: &Arc<TcpStream>,
    rid: u64,
    prefix: Option<&[u8]>,
    leftover: &[u8],
) {
    // Best-effort writes: the pair is terminating either way.
    let mut intro = Vec::new();
    if let Some(prefix) = prefix {
        intro.extend_from_slice(prefix);
    }
    intro.extend_from_slice(leftover);
    if stream::write_all(client, &intro).await.is_ok() {
        if let Err((op, err)) = stream::copy(remote, client).await {
            splice::record_copy_error(&shared.stats, Leg::ProxyServer, op);
            debug!(?op, error = %err, "relay to client ended");
        }
    }
    shared.pool.del(cid);
    shared.pool.del(rid);
    stream::force_close(client);
    stream::force_close(remote);
}

/// Drop an upstream candidate: deregister, then shut it down.
fn abandon(pool: &ConnectionPool, conn: &TcpStream, id: u64) {
    pool.del(id);
    stream::force_close(conn);
}

/// Cache-backed reverse DNS for the CONNECT hostname.
///
/// Stores only successful non-empty answers.
async fn reverse_hostname(cache: &ReverseLookupCache, ip: Ipv4Addr) -> Option<String> {
    let key = ip.to_string();
    if let Some(hostname) = cache.lookup(&key) {
        return Some(hostname);
    }
    let hostname = tokio::task::spawn_blocking(move || lookup_ptr(ip))
        .await
        .ok()
        .flatten()?;
    if hostname.is_empty() {
        return None;
    }
    cache.store(&key, &hostname);
    Some(hostname)
}

/// Reverse-resolve through the system resolver with `getnameinfo(3)`.
/// `NI_NAMEREQD` makes the call fail outright when no PTR record exists.
fn lookup_ptr(ip: Ipv4Addr) -> Option<String> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from_be_bytes(ip.octets()).to_be();

    let mut host = [0u8; 1025]; // NI_MAXHOST
    let rc = unsafe {
        libc::getnameinfo(
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            host.as_mut_ptr() as *mut libc::c_char,
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return None;
    }
    let end = host.iter().position(|&b| b == 0)?;
    String::from_utf8(host[..end].to_vec()).ok()
}
