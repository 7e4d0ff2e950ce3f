//! TLS ClientHello inspection for CONNECT target substitution.
//!
//! Reads the client's opening TLS record and pulls out the SNI host name so
//! the CONNECT request can carry a hostname instead of a bare IP. Every
//! byte consumed here is retained by the caller and replayed verbatim to
//! the upstream once the tunnel is up.

use std::io;

use tls_parser::{
    parse_tls_extensions, parse_tls_plaintext, TlsExtension, TlsMessage, TlsMessageHandshake,
};
use tokio::net::TcpStream;

use crate::stream;

const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 22;

/// RFC record ceiling; anything larger is not a ClientHello we care about.
const MAX_RECORD_LEN: usize = 16 * 1024;

/// Read the client's first TLS record and extract the server name.
///
/// Consumed bytes are appended to `buf` whether or not parsing succeeds, so
/// the handshake can always be replayed. Returns `None` when the first
/// bytes are not a TLS handshake record or carry no SNI extension.
pub async fn peek_server_name(stream: &TcpStream, buf: &mut Vec<u8>) -> io::Result<Option<String>> {
    let start = buf.len();
    stream::read_exact_into(stream, buf, 5).await?;
    if buf[start] != TLS_HANDSHAKE_CONTENT_TYPE {
        return Ok(None);
    }
    let record_len = u16::from_be_bytes([buf[start + 3], buf[start + 4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return Ok(None);
    }
    stream::read_exact_into(stream, buf, record_len).await?;
    Ok(extract_server_name(&buf[start..]))
}

/// Parse a complete TLS plaintext record and return its SNI host name.
fn extract_server_name(record: &[u8]) -> Option<String> {
    let (_, plaintext) = parse_tls_plaintext(record).ok()?;
    let hello = plaintext.msg.iter().find_map(|msg| match msg {
        TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello)) => Some(hello),
        _ => None,
    })?;

    let (_, extensions) = parse_tls_extensions(hello.ext?).ok()?;
    extensions.iter().find_map(|ext| match ext {
        TlsExtension::SNI(names) => names
            .first()
            .and_then(|(_, name)| std::str::from_utf8(name).ok())
            .filter(|name| !name.is_empty())
            .map(str::to_string),
        _ => None,
    })
}

/// Minimal TLS 1.2 ClientHello record carrying a single SNI entry.
#[cfg(test)]
pub(crate) fn client_hello_record(server_name: &str) -> Vec<u8> {
    let name = server_name.as_bytes();

    // extension: server_name (type 0)
    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // server_name_list length
    sni.push(0); // name_type: host_name
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0u16.to_be_bytes()); // extension type: SNI
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // client_version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session_id length
    body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites length
    body.extend_from_slice(&[0x00, 0x2f]); // TLS_RSA_WITH_AES_128_CBC_SHA
    body.push(1); // compression_methods length
    body.push(0); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(1); // handshake type: client_hello
    let len = body.len() as u32;
    handshake.extend_from_slice(&len.to_be_bytes()[1..]); // 24-bit length
    handshake.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(TLS_HANDSHAKE_CONTENT_TYPE);
    record.extend_from_slice(&[0x03, 0x01]); // record version
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
