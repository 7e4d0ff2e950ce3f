//! Byte-level I/O over shared stream handles.
//!
//! Splicing, eviction, and the CONNECT handshake all hold `Arc<TcpStream>`
//! clones of the same socket, so everything here works through `&TcpStream`
//! with tokio's readiness API instead of `&mut` ownership. Termination is
//! signalled by [`force_close`]: shutting a socket down wakes every task
//! parked on it with EOF or an I/O error.

use std::io;

use tokio::net::TcpStream;

/// Which half of a copy operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOp {
    Read,
    Write,
}

/// Shut both directions of the socket down.
///
/// Does not release the descriptor; owners drop their handles afterwards.
/// Safe to call any number of times.
pub fn force_close(stream: &TcpStream) {
    use std::os::fd::AsRawFd;
    unsafe {
        libc::shutdown(stream.as_raw_fd(), libc::SHUT_RDWR);
    }
}

/// Write the whole buffer.
pub async fn write_all(stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read up to and including the next `\n`.
///
/// Returns the line (terminator included) and any bytes that arrived past
/// it in the same read. The line grows without bound until the terminator
/// shows up; EOF before that is an error.
pub async fn read_line(stream: &TcpStream) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut line = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        stream.readable().await?;
        match stream.try_read(&mut chunk) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before end of line",
                ))
            }
            Ok(n) => {
                if let Some(pos) = chunk[..n].iter().position(|&b| b == b'\n') {
                    line.extend_from_slice(&chunk[..=pos]);
                    return Ok((line, chunk[pos + 1..n].to_vec()));
                }
                line.extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read exactly `n` more bytes, appending them to `buf`.
pub async fn read_exact_into(stream: &TcpStream, buf: &mut Vec<u8>, n: usize) -> io::Result<()> {
    let mut remaining = n;
    let mut chunk = [0u8; 4096];
    while remaining > 0 {
        stream.readable().await?;
        let want = remaining.min(chunk.len());
        match stream.try_read(&mut chunk[..want]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-read",
                ))
            }
            Ok(k) => {
                buf.extend_from_slice(&chunk[..k]);
                remaining -= k;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Copy from `src` to `dst` until EOF.
///
/// Returns bytes copied, or the operation that failed. A forced shutdown on
/// either socket ends the copy: the read side sees EOF, the write side an
/// error.
pub async fn copy(src: &TcpStream, dst: &TcpStream) -> Result<u64, (CopyOp, io::Error)> {
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        if let Err(e) = src.readable().await {
            return Err((CopyOp::Read, e));
        }
        match src.try_read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                write_all(dst, &buf[..n])
                    .await
                    .map_err(|e| (CopyOp::Write, e))?;
                total += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err((CopyOp::Read, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Connected loopback pair, or None when the environment forbids binding.
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

    #[tokio::test]
    async fn test_write_all_then_read_line() {
        let Some((a, b)) = tcp_pair().await else { return };
        write_all(&a, b"HTTP/1.0 200 Connection established\r\n\r\n")
            .await
            .unwrap();

        let (line, leftover) = read_line(&b).await.unwrap();
        assert_eq!(line, b"HTTP/1.0 200 Connection established\r\n");
        assert_eq!(leftover, b"\r\n");
    }

    #[tokio::test]
    async fn test_read_line_across_chunks() {
        let Some((mut a, b)) = tcp_pair().await else { return };
        tokio::spawn(async move {
            a.write_all(b"HTTP/1.0 502 ").await.unwrap();
            a.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            a.write_all(b"Bad Gateway\r\n").await.unwrap();
        });

        let (line, leftover) = read_line(&b).await.unwrap();
        assert_eq!(line, b"HTTP/1.0 502 Bad Gateway\r\n");
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_read_line_longer_than_chunk_buffer() {
        let Some((mut a, b)) = tcp_pair().await else { return };
        let mut long = vec![b'x'; 8 * 1024];
        long.push(b'\n');
        let expected = long.clone();
        tokio::spawn(async move {
            a.write_all(&long).await.unwrap();
        });

        let (line, _) = read_line(&b).await.unwrap();
        assert_eq!(line, expected);
    }

    #[tokio::test]
    async fn test_read_line_eof_is_error() {
        let Some((a, b)) = tcp_pair().await else { return };
        drop(a);
        assert!(read_line(&b).await.is_err());
    }

    #[tokio::test]
    async fn test_copy_to_eof() {
        let Some((mut a, b)) = tcp_pair().await else { return };
        let Some((c, mut d)) = tcp_pair().await else { return };

        tokio::spawn(async move {
            a.write_all(b"payload bytes").await.unwrap();
            // dropping `a` sends FIN, which ends the copy
        });

        let copied = tokio::spawn(async move {
            let n = copy(&b, &c).await;
            force_close(&c);
            n
        });

        let mut out = Vec::new();
        d.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload bytes");
        assert_eq!(copied.await.unwrap().unwrap(), 13);
    }

    #[tokio::test]
    async fn test_force_close_unblocks_reader() {
        let Some((a, b)) = tcp_pair().await else { return };
        let a = Arc::new(a);
        let closer = Arc::clone(&a);

        let reader = tokio::spawn(async move {
            let mut chunk = [0u8; 64];
            loop {
                a.readable().await.unwrap();
                match a.try_read(&mut chunk) {
                    Ok(0) => return true,
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(_) => return true,
                }
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        force_close(&closer);
        let unblocked = tokio::time::timeout(std::time::Duration::from_secs(2), reader)
            .await
            .expect("reader did not unblock after forced shutdown")
            .unwrap();
        assert!(unblocked);
        drop(b);
    }

    #[tokio::test]
    async fn test_read_exact_into_appends() {
        let Some((mut a, b)) = tcp_pair().await else { return };
        tokio::spawn(async move {
            a.write_all(b"abcdef").await.unwrap();
        });

        let mut buf = vec![b'!'];
        read_exact_into(&b, &mut buf, 3).await.unwrap();
        assert_eq!(buf, b"!abc");
        read_exact_into(&b, &mut buf, 3).await.unwrap();
        assert_eq!(buf, b"!abcdef");
    }
}
