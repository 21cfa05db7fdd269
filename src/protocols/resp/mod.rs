//! RESP request decoding as a per-connection protocol instance.
//!
//! Commands arrive as arrays of bulk strings and are handed to the
//! application as argument lists; the application encodes replies with
//! the types in [`parser`]. The inbound stream is preprocessed for two
//! legacy client quirks: heartbeat magics between commands and stray NUL
//! bytes anywhere.

pub mod parser;

pub use parser::{decode_command, Decode, Reply};

use super::{strip_keepalive_magic, CloseReason, Outcome, Protocol, ProtocolEvent};

pub struct RespProtocol {
    buf: Vec<u8>,
}

impl RespProtocol {
    pub fn new() -> Self {
        RespProtocol { buf: Vec::new() }
    }
}

impl Default for RespProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for RespProtocol {
    fn name(&self) -> &'static str {
        "resp"
    }

    fn on_data(&mut self, input: &[u8]) -> Outcome {
        let mut outcome = Outcome {
            // Input moves into the internal buffer wholesale; unparsed
            // tails wait there for the next read.
            consumed: input.len(),
            ..Outcome::default()
        };

        self.buf.extend(input.iter().filter(|&&b| b != 0));

        // Drain every pipelined command already in the buffer.
        loop {
            let skip = strip_keepalive_magic(&self.buf);
            if skip > 0 {
                self.buf.drain(..skip);
            }
            if self.buf.is_empty() {
                break;
            }

            match decode_command(&self.buf) {
                Decode::Complete(args, used) => {
                    self.buf.drain(..used);
                    if !args.is_empty() {
                        outcome.events.push(ProtocolEvent::Command(args));
                    }
                }
                Decode::Incomplete => break,
                Decode::Malformed(reason) => {
                    outcome.close = Some(CloseReason::ProtocolError(format!(
                        "malformed RESP: {reason}"
                    )));
                    break;
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::KEEPALIVE_MAGIC;

    fn command(parts: &[&[u8]]) -> ProtocolEvent {
        ProtocolEvent::Command(parts.iter().map(|p| p.to_vec()).collect())
    }

    #[test]
    fn test_single_command() {
        let mut proto = RespProtocol::new();
        let outcome = proto.on_data(b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(outcome.consumed, 14);
        assert_eq!(outcome.events, vec![command(&[b"PING"])]);
        assert!(outcome.close.is_none());
    }

    #[test]
    fn test_pipelined_commands_drain_in_one_read() {
        let mut proto = RespProtocol::new();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
        buf.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");

        let outcome = proto.on_data(&buf);
        assert_eq!(
            outcome.events,
            vec![command(&[b"SET", b"k", b"v"]), command(&[b"GET", b"k"])]
        );
    }

    #[test]
    fn test_command_split_across_reads() {
        let mut proto = RespProtocol::new();
        let full = b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n";

        let first = proto.on_data(&full[..9]);
        assert_eq!(first.consumed, 9);
        assert!(first.events.is_empty());

        let second = proto.on_data(&full[9..]);
        assert_eq!(second.events, vec![command(&[b"GET", b"k"])]);
    }

    #[test]
    fn test_heartbeat_magic_prefix_is_stripped() {
        let mut proto = RespProtocol::new();
        let mut buf = Vec::new();
        buf.extend_from_slice(&KEEPALIVE_MAGIC);
        buf.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");

        let outcome = proto.on_data(&buf);
        assert_eq!(outcome.events, vec![command(&[b"PING"])]);
        assert!(outcome.close.is_none());
    }

    #[test]
    fn test_heartbeat_magic_between_commands() {
        let mut proto = RespProtocol::new();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        buf.extend_from_slice(&KEEPALIVE_MAGIC);
        buf.extend_from_slice(&KEEPALIVE_MAGIC);
        buf.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");

        let outcome = proto.on_data(&buf);
        assert_eq!(outcome.events.len(), 2);
    }

    #[test]
    fn test_stray_nul_bytes_are_dropped() {
        let mut proto = RespProtocol::new();
        let mut buf = Vec::new();
        buf.push(0x00);
        buf.extend_from_slice(b"*1\r\n$4\r\n");
        buf.push(0x00);
        buf.extend_from_slice(b"PING\r\n");

        let outcome = proto.on_data(&buf);
        assert_eq!(outcome.events, vec![command(&[b"PING"])]);
    }

    #[test]
    fn test_malformed_stream_is_fatal() {
        let mut proto = RespProtocol::new();
        let outcome = proto.on_data(b"*oops\r\n");
        assert!(matches!(
            outcome.close,
            Some(CloseReason::ProtocolError(_))
        ));
    }

    #[test]
    fn test_garbage_after_valid_command_is_fatal() {
        let mut proto = RespProtocol::new();
        let mut buf = b"*1\r\n$4\r\nPING\r\n".to_vec();
        buf.extend_from_slice(b"hello there\r\n");

        let outcome = proto.on_data(&buf);
        // The pipelined PING still decodes before the stream dies.
        assert_eq!(outcome.events, vec![command(&[b"PING"])]);
        assert!(outcome.close.is_some());
    }

    #[test]
    fn test_empty_array_produces_no_event() {
        let mut proto = RespProtocol::new();
        let outcome = proto.on_data(b"*0\r\n");
        assert!(outcome.events.is_empty());
        assert!(outcome.close.is_none());
    }
}
