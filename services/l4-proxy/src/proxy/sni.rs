//! SNI (Server Name Indication) extraction from a TLS ClientHello.
//!
//! The L4 forwarder reads the first handshake record into a bounded buffer
//! without terminating TLS, parses the `server_name` extension out of it,
//! and later replays the buffered bytes to the chosen backend so the real
//! handshake proceeds end to end.
//!
//! The extension payload is parsed at the RFC 6066 offsets:
//! `list_length:u16`, then entries of `name_type:u8, name_length:u16,
//! name[name_length]`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on the handshake bytes buffered before routing.
pub const MAX_PEEK_BYTES: usize = 8192;

/// Parse failures, ordered by how far into the record they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SniError {
    /// Fewer bytes available than the structure declared so far requires.
    #[error("short read while parsing ClientHello")]
    ShortRead,
    /// Record type is not Handshake (0x16).
    #[error("not a TLS handshake record")]
    NotHandshake,
    /// Record version is not 3.1 through 3.3.
    #[error("unsupported TLS record version")]
    UnsupportedVersion,
    /// Handshake message is not a ClientHello (0x01).
    #[error("not a ClientHello message")]
    NotClientHello,
    /// A declared length overruns the record or an inner structure.
    #[error("malformed ClientHello")]
    Malformed,
    /// The extension walk completed without a server_name entry.
    #[error("no server_name extension in ClientHello")]
    NoSni,
}

/// Extract the first host_name entry of the first server_name extension.
///
/// Returns the hostname exactly as it appears on the wire; callers
/// normalize it into a routing selector. A truncated input yields
/// `ShortRead` or `Malformed`, never a truncated hostname.
pub fn parse_client_hello(data: &[u8]) -> Result<&str, SniError> {
    if data.len() < 5 {
        return Err(SniError::ShortRead);
    }
    if data[0] != 0x16 {
        return Err(SniError::NotHandshake);
    }
    if data[1] != 0x03 || !(0x01..=0x03).contains(&data[2]) {
        return Err(SniError::UnsupportedVersion);
    }

    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let record_end = 5 + record_len;

    // Bounds check against both the record's declared end and the bytes we
    // actually hold; running past the former is corruption, past the
    // latter an incomplete peek.
    let need = |end: usize| -> Result<(), SniError> {
        if end > record_end {
            return Err(SniError::Malformed);
        }
        if end > data.len() {
            return Err(SniError::ShortRead);
        }
        Ok(())
    };

    need(6)?;
    if data[5] != 0x01 {
        return Err(SniError::NotClientHello);
    }

    // Fixed prefix: record header 5 + handshake header 4 + legacy_version 2
    // + random 32 puts the session_id length at offset 43.
    let mut pos = 43;
    need(pos + 1)?;
    let session_id_len = data[pos] as usize;
    pos += 1 + session_id_len;

    need(pos + 2)?;
    let cipher_suites_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    need(pos + 1)?;
    let compression_len = data[pos] as usize;
    pos += 1 + compression_len;

    need(pos + 2)?;
    let extensions_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = pos + extensions_len;
    if extensions_end > record_end {
        return Err(SniError::Malformed);
    }

    while pos + 4 <= extensions_end {
        need(pos + 4)?;
        let ext_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        let ext_end = pos + ext_len;
        if ext_end > extensions_end {
            return Err(SniError::Malformed);
        }

        if ext_type == 0x0000 {
            need(ext_end)?;
            return parse_server_name_list(&data[pos..ext_end]);
        }
        pos = ext_end;
    }

    if extensions_end > data.len() {
        // The peek stopped inside the extension block; the server_name
        // extension may live in the bytes we never saw.
        return Err(SniError::ShortRead);
    }
    Err(SniError::NoSni)
}

/// Parse the server_name extension payload (RFC 6066 §3).
fn parse_server_name_list(data: &[u8]) -> Result<&str, SniError> {
    if data.len() < 2 {
        return Err(SniError::Malformed);
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if 2 + list_len > data.len() {
        return Err(SniError::Malformed);
    }

    let mut pos = 2;
    let list_end = 2 + list_len;
    while pos + 3 <= list_end {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;

        if pos + name_len > list_end {
            return Err(SniError::Malformed);
        }
        if name_type == 0 {
            return std::str::from_utf8(&data[pos..pos + name_len])
                .map_err(|_| SniError::Malformed);
        }
        pos += name_len;
    }

    Err(SniError::NoSni)
}

/// Read the first TLS record into `buffer` without interpreting it.
///
/// Reads the 5-byte record header, then up to `5 + record_length` bytes,
/// capped at [`MAX_PEEK_BYTES`]. Returns the number of bytes read; the
/// caller parses them and forwards them to the backend unchanged.
pub async fn read_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut Vec<u8>,
) -> io::Result<usize> {
    buffer.clear();
    buffer.resize(MAX_PEEK_BYTES, 0);

    // Read the record header alone first so no bytes past the record are
    // consumed from the stream.
    let mut total_read = 0;
    while total_read < 5 {
        let n = stream.read(&mut buffer[total_read..5]).await?;
        if n == 0 {
            buffer.truncate(total_read);
            return Ok(total_read);
        }
        total_read += n;
    }

    if buffer[0] != 0x16 {
        // Not a handshake record; let the parser report it.
        buffer.truncate(total_read);
        return Ok(total_read);
    }

    let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
    let target = (5 + record_len).min(MAX_PEEK_BYTES);
    while total_read < target {
        let n = stream.read(&mut buffer[total_read..target]).await?;
        if n == 0 {
            break;
        }
        total_read += n;
    }

    buffer.truncate(total_read);
    Ok(total_read)
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal TLS 1.2 ClientHello with SNI "example.com" followed by a
    // padding extension.
    const EXAMPLE_CLIENT_HELLO: &[u8] = &[
        // TLS record header
        0x16, // Handshake
        0x03, 0x01, // TLS 1.0 (for compatibility)
        0x00, 0x5f, // Record length: 95 bytes
        // Handshake header
        0x01, // ClientHello
        0x00, 0x00, 0x5b, // Length: 91 bytes
        // Client version
        0x03, 0x03, // TLS 1.2
        // Random (32 bytes)
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, // Session ID length
        0x00, // Cipher suites length
        0x00, 0x02, // Cipher suite
        0x00, 0x2f, // TLS_RSA_WITH_AES_128_CBC_SHA
        // Compression methods
        0x01, 0x00, // null compression
        // Extensions length
        0x00, 0x28, // 40 bytes
        // SNI extension
        0x00, 0x00, // type: server_name
        0x00, 0x10, // length: 16 bytes
        0x00, 0x0e, // list length: 14 bytes
        0x00, // name type: host_name
        0x00, 0x0b, // name length: 11 bytes
        b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm',
        // Padding extension to fill the declared length
        0x00, 0x15, // type: padding
        0x00, 0x10, // length
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];

    /// Build a well-formed ClientHello carrying a single SNI entry.
    pub(crate) fn build_client_hello(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let sni_payload_len = 2 + 1 + 2 + name.len();

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0x00); // session_id
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]); // cipher_suites
        body.extend_from_slice(&[0x01, 0x00]); // compression_methods
        body.extend_from_slice(&((4 + sni_payload_len) as u16).to_be_bytes());
        body.extend_from_slice(&[0x00, 0x00]);
        body.extend_from_slice(&(sni_payload_len as u16).to_be_bytes());
        body.extend_from_slice(&((3 + name.len()) as u16).to_be_bytes());
        body.push(0x00);
        body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        body.extend_from_slice(name);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        record.push(0x01);
        record.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        record.extend_from_slice(&body);
        record
    }

    #[test]
    fn test_parse_example_hello() {
        assert_eq!(parse_client_hello(EXAMPLE_CLIENT_HELLO), Ok("example.com"));
    }

    #[test]
    fn test_parse_built_hello_round_trips() {
        for host in ["svc.test", "a.b.c.d.example.org", "x", "MiXeD.Case.Test"] {
            let hello = build_client_hello(host);
            assert_eq!(parse_client_hello(&hello), Ok(host));
        }
    }

    #[test]
    fn test_not_handshake() {
        // Alert record type
        let mut hello = build_client_hello("svc.test");
        hello[0] = 0x15;
        assert_eq!(parse_client_hello(&hello), Err(SniError::NotHandshake));

        let http = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(parse_client_hello(http), Err(SniError::NotHandshake));
    }

    #[test]
    fn test_unsupported_version() {
        let mut hello = build_client_hello("svc.test");
        hello[2] = 0x04;
        assert_eq!(
            parse_client_hello(&hello),
            Err(SniError::UnsupportedVersion)
        );
    }

    #[test]
    fn test_not_client_hello() {
        let mut hello = build_client_hello("svc.test");
        hello[5] = 0x02; // ServerHello
        assert_eq!(parse_client_hello(&hello), Err(SniError::NotClientHello));
    }

    #[test]
    fn test_short_read() {
        assert_eq!(parse_client_hello(&[]), Err(SniError::ShortRead));
        assert_eq!(
            parse_client_hello(&[0x16, 0x03, 0x01]),
            Err(SniError::ShortRead)
        );
    }

    #[test]
    fn test_truncation_never_yields_partial_name() {
        let hello = build_client_hello("svc.test");
        for cut in 0..hello.len() {
            match parse_client_hello(&hello[..cut]) {
                Err(SniError::ShortRead) | Err(SniError::Malformed) => {}
                other => panic!("prefix of {cut} bytes parsed as {other:?}"),
            }
        }
    }

    #[test]
    fn test_no_sni_extension() {
        // Rewrite the SNI extension type so the walk finds nothing.
        let mut hello = build_client_hello("svc.test");
        let ext_type_at = hello.len() - (2 + 2 + 2 + 1 + 2 + "svc.test".len());
        hello[ext_type_at] = 0x00;
        hello[ext_type_at + 1] = 0x17; // extended_master_secret-ish
        assert_eq!(parse_client_hello(&hello), Err(SniError::NoSni));
    }

    #[test]
    fn test_inner_length_overrun_is_malformed() {
        let mut hello = build_client_hello("svc.test");
        // Inflate the name length beyond the list.
        let name_len_at = hello.len() - "svc.test".len() - 2;
        hello[name_len_at] = 0xff;
        assert_eq!(parse_client_hello(&hello), Err(SniError::Malformed));
    }

    #[tokio::test]
    async fn test_read_client_hello_stops_at_record_end() {
        let hello = build_client_hello("svc.test");
        let mut wire = hello.clone();
        wire.extend_from_slice(b"application data after the hello");

        let mut stream = std::io::Cursor::new(wire);
        let mut buffer = Vec::new();
        let n = read_client_hello(&mut stream, &mut buffer).await.unwrap();

        assert_eq!(n, hello.len());
        assert_eq!(&buffer[..n], &hello[..]);
    }

    #[tokio::test]
    async fn test_read_client_hello_non_tls_returns_prefix() {
        let mut stream = std::io::Cursor::new(b"PING\r\n".to_vec());
        let mut buffer = Vec::new();
        let n = read_client_hello(&mut stream, &mut buffer).await.unwrap();

        assert!(n >= 5);
        assert_eq!(parse_client_hello(&buffer[..n]), Err(SniError::NotHandshake));
    }
}
