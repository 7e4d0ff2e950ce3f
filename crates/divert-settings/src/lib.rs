//! TOML configuration for the divert proxy.
//!
//! Mirrors the command-line surface: every key here has a flag counterpart,
//! and flags win when both are given.
//!
//! # Example
//!
//! ```toml
//! listen = "0.0.0.0:3128"
//! proxies = ["squid.internal:3128", "ops:hunter2@fallback.internal:8080"]
//! directs = ["10.0.0.0/8", "192.168.1.1"]
//! max_connections = 4096
//! relay_redirects = false
//! reverse_lookups = true
//! sni_parsing = true
//! skip_upstream_healthcheck = false
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};

/// Errors from settings operations.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// I/O error reading a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// File-backed configuration, all fields optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address and port the redirected listener binds to.
    pub listen: Option<String>,

    /// Upstream CONNECT proxies in failover order
    /// (`host:port` or `user:password@host:port`).
    pub proxies: Vec<String>,

    /// Destination IPs and CIDR blocks that bypass the upstream chain.
    pub directs: Vec<String>,

    /// Connection-pool ceiling.
    pub max_connections: Option<usize>,

    /// Relay upstream 302 responses to clients.
    pub relay_redirects: bool,

    /// Reverse-resolve destination IPs for CONNECT.
    pub reverse_lookups: bool,

    /// Parse TLS ClientHello SNI for CONNECT.
    pub sni_parsing: bool,

    /// Skip the startup reachability probe of upstreams.
    pub skip_upstream_healthcheck: bool,
}

impl Settings {
    /// Parse a settings file.
    pub fn load(path: &std::path::Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
