//! HTTP/1.0 CONNECT handshake: upstream specs, request bytes, status
//! classification.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::{ProxyError, Result};

/// One upstream CONNECT proxy, in failover order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    /// Pre-encoded HTTP Basic token, when the spec carried credentials.
    pub credentials: Option<String>,
}

impl Upstream {
    /// Parse `host:port` or `user:password@host:port`.
    ///
    /// Credentials are encoded into the Basic token here, at parse time;
    /// nothing downstream sees the cleartext.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| ProxyError::UpstreamSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (credentials, hostport) = match spec.split_once('@') {
            Some((creds, rest)) => (Some(BASE64.encode(creds)), rest),
            None => (None, spec),
        };

        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            credentials,
        })
    }

    /// The dialable `host:port` form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Compose the CONNECT request exactly as written to the wire.
///
/// `CONNECT <host>:<port> HTTP/1.0<auth>\r\n<xff>\r\n`, where the auth
/// fragment carries the pre-encoded Basic token and the XFF header names
/// the client's own address.
pub fn connect_request(
    host: &str,
    port: u16,
    credentials: Option<&str>,
    client_ip: Option<&str>,
) -> String {
    let auth = match credentials {
        Some(token) => format!("\r\nProxy-Authorization: Basic {token}"),
        None => String::new(),
    };
    let xff = match client_ip {
        Some(ip) => format!("X-Forwarded-For: {ip}\r\n"),
        None => String::new(),
    };
    format!("CONNECT {host}:{port} HTTP/1.0{auth}\r\n{xff}\r\n")
}

/// Outcome of one CONNECT status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// Upstream said 400; its error body is relayed to the client.
    BadRequest,
    /// A redirect to relay: any 301, or a 302 when relaying is enabled.
    Redirect,
    /// Tunnel established.
    Established,
    /// Anything else; the candidate is abandoned.
    Refused,
}

/// Classify a status line by substring, in evaluation order.
///
/// A `301` relays regardless of the toggle; only `302` consults it. That
/// asymmetry is deliberate, frozen from the deployed behavior.
pub fn classify_status(line: &str, relay_redirects: bool) -> ConnectStatus {
    if line.contains("400") {
        return ConnectStatus::BadRequest;
    }
    if line.contains("301") || (line.contains("302") && relay_redirects) {
        return ConnectStatus::Redirect;
    }
    if line.contains("200") {
        ConnectStatus::Established
    } else {
        ConnectStatus::Refused
    }
}
