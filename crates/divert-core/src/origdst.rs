//! Original-destination recovery for firewall-redirected sockets.
//!
//! A netfilter REDIRECT rule rewrites the destination of a client's SYN to
//! the proxy's listener but remembers the real destination in conntrack
//! state, retrievable per socket with `getsockopt(SOL_IP, SO_ORIGINAL_DST)`.
//! The option fills a `sockaddr_in`: port in bytes 2-3 (big-endian), IPv4
//! address in bytes 4-7.
//!
//! The query needs the raw descriptor. Runtimes whose sockets fall back to
//! blocking mode when their fd is borrowed have to rebuild a non-blocking
//! handle afterwards; tokio's `as_raw_fd` has no such side effect, so the
//! query runs against the borrowed fd and the accepted stream stays usable
//! as-is.

use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};

use tokio::net::TcpStream;

use crate::{ProxyError, Result};

/// `IPPROTO_IP` option number for the pre-NAT destination.
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Recover the pre-NAT destination of a redirected connection.
///
/// Every failure maps to [`ProxyError::OriginalDstUnavailable`].
pub fn original_dst(stream: &TcpStream) -> Result<(Ipv4Addr, u16)> {
    if stream.peer_addr().is_err() {
        return Err(unavailable("accepted socket has no remote address"));
    }
    query_original_dst(stream.as_raw_fd())
}

fn query_original_dst(fd: RawFd) -> Result<(Ipv4Addr, u16)> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(unavailable(&format!("getsockopt(SO_ORIGINAL_DST): {err}")));
    }
    Ok(decode_sockaddr(&addr))
}

/// Pull `(address, port)` out of the kernel's sockaddr, both big-endian.
fn decode_sockaddr(addr: &libc::sockaddr_in) -> (Ipv4Addr, u16) {
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    (ip, port)
}

fn unavailable(reason: &str) -> ProxyError {
    ProxyError::OriginalDstUnavailable {
        reason: reason.to_string(),
    }
}
