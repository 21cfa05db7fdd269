//! HTTP upgrade handshake.
//!
//! Buffers the request until the blank line, validates the upgrade
//! headers, and produces the 101 response with the accept token.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A request that grows past this without finishing its headers is junk.
const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_token(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[derive(Debug, PartialEq)]
pub enum Handshake {
    /// Headers not finished; consume nothing and wait.
    Incomplete,
    /// Valid upgrade: the 101 response and the request bytes consumed.
    Complete { response: Vec<u8>, consumed: usize },
    /// Complete headers that are not a WebSocket upgrade.
    Invalid(String),
}

/// Try to complete the upgrade against the buffered request bytes.
pub fn process(buf: &[u8]) -> Handshake {
    let Some(header_end) = find_double_crlf(buf) else {
        if buf.len() > MAX_HANDSHAKE_BYTES {
            return Handshake::Invalid("handshake headers never ended".to_string());
        }
        return Handshake::Incomplete;
    };

    let head = String::from_utf8_lossy(&buf[..header_end]);
    if !head.starts_with("GET ") {
        return Handshake::Invalid("not a GET request".to_string());
    }

    let mut upgrade_ok = false;
    let mut client_key: Option<String> = None;
    for line in head.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("upgrade")
            && value.to_ascii_lowercase().contains("websocket")
        {
            upgrade_ok = true;
        } else if name.eq_ignore_ascii_case("sec-websocket-key") {
            client_key = Some(value.to_string());
        }
    }

    if !upgrade_ok {
        return Handshake::Invalid("missing 'Upgrade: websocket' header".to_string());
    }
    let Some(client_key) = client_key else {
        return Handshake::Invalid("missing Sec-WebSocket-Key header".to_string());
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_token(&client_key)
    );

    Handshake::Complete {
        response: response.into_bytes(),
        consumed: header_end + 4,
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
         Host: localhost:8888\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n";

    #[test]
    fn test_accept_token_known_vector() {
        // The RFC 6455 sample key and its published accept value.
        assert_eq!(
            accept_token("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_complete_handshake() {
        match process(SAMPLE_REQUEST.as_bytes()) {
            Handshake::Complete { response, consumed } => {
                let text = String::from_utf8(response).unwrap();
                assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
                assert!(text.contains("Upgrade: websocket\r\n"));
                assert!(text.contains("Connection: Upgrade\r\n"));
                assert!(text
                    .contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
                assert!(text.ends_with("\r\n\r\n"));
                assert_eq!(consumed, SAMPLE_REQUEST.len());
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_headers_are_incomplete() {
        // Every split point mid-header must park and wait.
        let bytes = SAMPLE_REQUEST.as_bytes();
        for cut in 0..bytes.len() - 4 {
            assert_eq!(
                process(&bytes[..cut]),
                Handshake::Incomplete,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_case_insensitive_headers() {
        let request = "GET / HTTP/1.1\r\n\
             upgrade: WebSocket\r\n\
             sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             \r\n";
        assert!(matches!(
            process(request.as_bytes()),
            Handshake::Complete { .. }
        ));
    }

    #[test]
    fn test_non_get_request_is_invalid() {
        let request = "POST / HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             \r\n";
        assert!(matches!(process(request.as_bytes()), Handshake::Invalid(_)));
    }

    #[test]
    fn test_missing_upgrade_header_is_invalid() {
        let request = "GET / HTTP/1.1\r\n\
             Host: localhost\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             \r\n";
        assert!(matches!(process(request.as_bytes()), Handshake::Invalid(_)));
    }

    #[test]
    fn test_missing_key_is_invalid() {
        let request = "GET / HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             \r\n";
        assert!(matches!(process(request.as_bytes()), Handshake::Invalid(_)));
    }

    #[test]
    fn test_oversized_headers_are_invalid() {
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        request.extend(std::iter::repeat(b'x').take(MAX_HANDSHAKE_BYTES + 1));
        assert!(matches!(process(&request), Handshake::Invalid(_)));
    }
}
