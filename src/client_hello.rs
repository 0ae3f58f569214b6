//! ClientHello inspection
//!
//! Decodes the first flight of a TLS connection far enough to extract the
//! SNI host and the offered ALPN protocols, without consuming any bytes:
//! the record must still reach the TLS terminator or, in passthrough
//! mode, the upstream verbatim. The data is observed with `MSG_PEEK`
//! through `Conn::peek`.

use std::time::Duration;

use crate::conn::Conn;

/// Upper bound for a peeked ClientHello. Large hellos exist (post-quantum
/// key shares, many extensions) but a full TLS record never exceeds 16 KiB
/// plus the header.
const MAX_CLIENT_HELLO: usize = 16 * 1024 + 5;

/// Delay between peek attempts while the record is still arriving.
const PEEK_RETRY: Duration = Duration::from_millis(10);

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;

/// Fields extracted from a ClientHello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    /// SNI host, lowercased, trailing dot removed. None when the
    /// extension is absent.
    pub server_name: Option<String>,
    /// ALPN protocols in client preference order.
    pub alpn_protos: Vec<String>,
}

impl ClientHello {
    /// True when the hello is an ACME TLS-ALPN-01 challenge probe.
    pub fn is_acme_alpn(&self) -> bool {
        self.alpn_protos.len() == 1
            && self.alpn_protos[0] == crate::cert_manager::ACME_TLS_ALPN_PROTO
            && self.server_name.is_some()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// More bytes are needed before a verdict is possible.
    Incomplete,
    /// The data is not a TLS ClientHello.
    Invalid(&'static str),
}

/// Peek the ClientHello off an accepted connection.
///
/// Returns once a complete ClientHello has been decoded or the data is
/// recognizably not one. The caller bounds the overall wait with its own
/// timeout; this loop only paces the retries while the record trickles in.
pub async fn peek_client_hello(conn: &Conn) -> std::io::Result<Result<ClientHello, ParseError>> {
    let mut buf = vec![0u8; MAX_CLIENT_HELLO];
    let mut last_len = 0usize;
    loop {
        let n = conn.peek(&mut buf).await?;
        if n == 0 {
            return Ok(Err(ParseError::Invalid("EOF before ClientHello")));
        }
        match parse_client_hello(&buf[..n]) {
            Ok(hello) => return Ok(Ok(hello)),
            Err(ParseError::Incomplete) if n < MAX_CLIENT_HELLO => {
                // Same bytes as last time means the peer is still sending;
                // yield before peeking again.
                if n == last_len {
                    tokio::time::sleep(PEEK_RETRY).await;
                }
                last_len = n;
            }
            Err(e) => return Ok(Err(e)),
        }
    }
}

/// Decode SNI and ALPN from raw ClientHello bytes.
///
/// Record layout: 1 byte content type (0x16 handshake), 2 bytes version,
/// 2 bytes record length, then the handshake message: 1 byte type (0x01
/// ClientHello), 3 bytes length, 2 bytes version, 32 bytes random,
/// session id, cipher suites, compression methods, extensions.
pub fn parse_client_hello(data: &[u8]) -> Result<ClientHello, ParseError> {
    if data.len() < 5 {
        return Err(ParseError::Incomplete);
    }
    if data[0] != 0x16 {
        return Err(ParseError::Invalid("not a TLS handshake record"));
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if record_len < 4 {
        return Err(ParseError::Invalid("record too short"));
    }
    if data.len() < 5 + record_len {
        return Err(ParseError::Incomplete);
    }
    let hs = &data[5..5 + record_len];

    if hs[0] != 0x01 {
        return Err(ParseError::Invalid("not a ClientHello"));
    }
    let hs_len = ((hs[1] as usize) << 16) | ((hs[2] as usize) << 8) | hs[3] as usize;
    if hs.len() < 4 + hs_len {
        // Hellos spanning multiple records are not reassembled; the peek
        // keeps waiting until the bound and the dispatcher gives up.
        return Err(ParseError::Incomplete);
    }
    let body = &hs[4..4 + hs_len];

    // version (2) + random (32)
    let mut pos = 34usize;
    if body.len() < pos + 1 {
        return Err(ParseError::Invalid("truncated ClientHello"));
    }

    let session_id_len = body[pos] as usize;
    pos += 1 + session_id_len;

    if body.len() < pos + 2 {
        return Err(ParseError::Invalid("truncated cipher suites"));
    }
    let cipher_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2 + cipher_len;

    if body.len() < pos + 1 {
        return Err(ParseError::Invalid("truncated compression methods"));
    }
    let compression_len = body[pos] as usize;
    pos += 1 + compression_len;

    let mut hello = ClientHello::default();

    if body.len() < pos + 2 {
        // Legal: a ClientHello without extensions.
        return Ok(hello);
    }
    let ext_total = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2;
    let ext_end = pos + ext_total;
    if body.len() < ext_end {
        return Err(ParseError::Invalid("truncated extensions"));
    }

    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
        let ext_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > ext_end {
            return Err(ParseError::Invalid("extension overruns message"));
        }
        let ext = &body[pos..pos + ext_len];
        match ext_type {
            EXT_SERVER_NAME => hello.server_name = parse_sni_ext(ext)?,
            EXT_ALPN => hello.alpn_protos = parse_alpn_ext(ext)?,
            _ => {}
        }
        pos += ext_len;
    }

    Ok(hello)
}

/// server_name extension: 2-byte list length, then entries of
/// 1-byte type (0 = host_name), 2-byte length, name bytes.
fn parse_sni_ext(data: &[u8]) -> Result<Option<String>, ParseError> {
    if data.len() < 2 {
        return Err(ParseError::Invalid("truncated SNI"));
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + list_len {
        return Err(ParseError::Invalid("truncated SNI list"));
    }
    let mut pos = 2;
    while pos + 3 <= 2 + list_len {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;
        if pos + name_len > data.len() {
            return Err(ParseError::Invalid("truncated SNI name"));
        }
        if name_type == 0 {
            let host = std::str::from_utf8(&data[pos..pos + name_len])
                .map_err(|_| ParseError::Invalid("SNI not UTF-8"))?;
            let host = host.to_lowercase().trim_end_matches('.').to_string();
            if host.is_empty() {
                return Ok(None);
            }
            return Ok(Some(host));
        }
        pos += name_len;
    }
    Ok(None)
}

/// ALPN extension: 2-byte list length, then entries of 1-byte length +
/// protocol name bytes.
fn parse_alpn_ext(data: &[u8]) -> Result<Vec<String>, ParseError> {
    if data.len() < 2 {
        return Err(ParseError::Invalid("truncated ALPN"));
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + list_len {
        return Err(ParseError::Invalid("truncated ALPN list"));
    }
    let mut protos = Vec::new();
    let mut pos = 2;
    while pos < 2 + list_len {
        let len = data[pos] as usize;
        pos += 1;
        if pos + len > data.len() || len == 0 {
            return Err(ParseError::Invalid("truncated ALPN entry"));
        }
        let proto = std::str::from_utf8(&data[pos..pos + len])
            .map_err(|_| ParseError::Invalid("ALPN not UTF-8"))?;
        protos.push(proto.to_string());
        pos += len;
    }
    Ok(protos)
}
