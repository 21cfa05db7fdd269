//! RESP wire format: command decoding and reply encoding.
//!
//! Inbound traffic accepts only the array-of-bulk-strings form
//! (`*N\r\n$L\r\n...\r\n`), which is what every real client sends for
//! commands. Replies use the full sigil set.

/// A reply to encode onto the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:1000\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`, or `$-1\r\n` for nil
    Bulk(Option<Vec<u8>>),
    /// `*2\r\n...`
    Array(Vec<Reply>),
}

impl Reply {
    pub fn simple<S: Into<String>>(s: S) -> Reply {
        Reply::Simple(s.into())
    }

    pub fn error<S: Into<String>>(s: S) -> Reply {
        Reply::Error(s.into())
    }

    pub fn bulk<B: Into<Vec<u8>>>(data: B) -> Reply {
        Reply::Bulk(Some(data.into()))
    }

    pub fn nil() -> Reply {
        Reply::Bulk(None)
    }

    pub fn integer(n: i64) -> Reply {
        Reply::Integer(n)
    }

    pub fn array(items: Vec<Reply>) -> Reply {
        Reply::Array(items)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Bulk(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            Reply::Bulk(Some(data)) => {
                buf.push(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Array(items) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode_into(buf);
                }
            }
        }
    }
}

/// Result of decoding one command.
#[derive(Debug, PartialEq)]
pub enum Decode {
    /// One complete command and the bytes it occupied.
    Complete(Vec<Vec<u8>>, usize),
    /// The buffer does not hold a whole command yet; nothing consumed.
    Incomplete,
    /// The stream is not valid RESP. Fatal for the connection.
    Malformed(String),
}

/// Upper bound on a single bulk string, matching the conventional RESP
/// limit. Anything bigger is a corrupt length.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Decode one `*N\r\n$L\r\n...` command from the front of `buf`.
pub fn decode_command(buf: &[u8]) -> Decode {
    if buf.is_empty() {
        return Decode::Incomplete;
    }
    if buf[0] != b'*' {
        return Decode::Malformed(format!("expected '*', got 0x{:02x}", buf[0]));
    }

    let (count, mut pos) = match decode_length(&buf[1..]) {
        LengthParse::Complete(n, used) => (n, 1 + used),
        LengthParse::Incomplete => return Decode::Incomplete,
        LengthParse::Malformed(e) => return Decode::Malformed(e),
    };
    if count < 0 {
        return Decode::Malformed(format!("invalid array length {count}"));
    }

    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() {
            return Decode::Incomplete;
        }
        if buf[pos] != b'$' {
            return Decode::Malformed(format!("expected '$', got 0x{:02x}", buf[pos]));
        }

        let (len, used) = match decode_length(&buf[pos + 1..]) {
            LengthParse::Complete(n, used) => (n, used),
            LengthParse::Incomplete => return Decode::Incomplete,
            LengthParse::Malformed(e) => return Decode::Malformed(e),
        };
        if len < 0 || len > MAX_BULK_LEN {
            return Decode::Malformed(format!("invalid bulk length {len}"));
        }
        pos += 1 + used;

        let len = len as usize;
        if buf.len() < pos + len + 2 {
            return Decode::Incomplete;
        }
        if &buf[pos + len..pos + len + 2] != b"\r\n" {
            return Decode::Malformed("bulk string missing trailing CRLF".to_string());
        }
        args.push(buf[pos..pos + len].to_vec());
        pos += len + 2;
    }

    Decode::Complete(args, pos)
}

enum LengthParse {
    /// Parsed value and bytes consumed including the CRLF.
    Complete(i64, usize),
    Incomplete,
    Malformed(String),
}

/// Parse a decimal length terminated by CRLF.
fn decode_length(buf: &[u8]) -> LengthParse {
    let Some(crlf) = buf.windows(2).position(|w| w == b"\r\n") else {
        // Unterminated lengths are only "incomplete" while they are short
        // enough to plausibly still be a number.
        if buf.len() > 20 {
            return LengthParse::Malformed("unterminated length".to_string());
        }
        return LengthParse::Incomplete;
    };

    let digits = &buf[..crlf];
    if digits.is_empty() {
        return LengthParse::Malformed("empty length".to_string());
    }
    let text = match std::str::from_utf8(digits) {
        Ok(s) => s,
        Err(_) => return LengthParse::Malformed("non-ASCII length".to_string()),
    };
    match text.parse::<i64>() {
        Ok(n) => LengthParse::Complete(n, crlf + 2),
        Err(_) => LengthParse::Malformed(format!("invalid length '{text}'")),
    }
}
