//! Transparent TCP forwarding engine.
//!
//! `divert-core` sits behind a netfilter REDIRECT rule: clients open TCP
//! connections to arbitrary destinations, the kernel diverts them to the
//! proxy's listener, and the engine recovers where each connection was
//! actually headed before deciding how to get it there.
//!
//! # Connection flow
//!
//! ```text
//! Client connects (redirected by the firewall)
//!       |
//!       v
//! Recover original destination (SO_ORIGINAL_DST)
//!       |
//!       +-- no upstreams, or director matches --> direct TCP connect
//!       |
//!       +-- otherwise --> walk upstream CONNECT proxies in order
//!              |
//!              +-- 200 --> tunnel established
//!              +-- 400 / relayable 3xx --> relay response, terminate
//!              +-- anything else --> try next upstream
//!       |
//!       v
//! Splice bytes both ways until either side closes
//! ```
//!
//! # Components
//!
//! - [`ProxyServer`]: accept loop and per-connection orchestration
//! - [`ConnectionPool`]: bounds live connections, evicting at random
//! - [`Director`]: routes destination IPs past the upstream chain
//! - [`Upstream`]: one CONNECT proxy candidate in failover order
//! - [`ReverseLookupCache`]: bounded IP-to-hostname cache for CONNECT targets
//! - [`Stats`]: increment-only counters for every interesting outcome

mod cache;
mod connect;
mod director;
mod origdst;
mod pool;
mod server;
mod sni;
mod splice;
mod stats;
mod stream;

pub use cache::ReverseLookupCache;
pub use connect::{classify_status, connect_request, ConnectStatus, Upstream};
pub use director::{DirectRule, Director};
pub use pool::{ConnectionPool, PoolConn, SocketRef};
pub use server::{ProxyConfig, ProxyServer, MIN_MAX_CONNECTIONS};
pub use stats::{Stats, StatsSnapshot};

use std::net::SocketAddr;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Configuration rejected at startup.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A direct-route rule could not be parsed.
    #[error("Invalid direct rule `{rule}`: {reason}")]
    DirectRule { rule: String, reason: String },

    /// An upstream proxy spec could not be parsed.
    #[error("Invalid upstream spec `{spec}`: {reason}")]
    UpstreamSpec { spec: String, reason: String },

    /// The kernel held no redirect state for an accepted socket.
    #[error("Original destination unavailable: {reason}")]
    OriginalDstUnavailable { reason: String },

    /// The host part of a dial spec did not resolve.
    #[error("Could not resolve {host}: {source}")]
    DialResolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect to a resolved address failed.
    #[error("Could not connect to {addr}: {source}")]
    DialConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
