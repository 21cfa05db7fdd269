//! Per-connection WebSocket state machine.
//!
//! CONNECTING until the upgrade completes, then OPEN for framed traffic.
//! A server-initiated close moves to CLOSING until the peer echoes the
//! CLOSE; every fatal condition (bad handshake, unmasked or oversized
//! frame, invalid UTF-8, unknown opcode) goes straight to CLOSED with the
//! matching close code on the wire.
//!
//! Every connection gets a fresh instance. Sharing one across
//! connections would cross-contaminate fragment state and outbound
//! framing, so nothing here is globally visible.

pub mod frame;
pub mod handshake;

use super::{CloseReason, Outcome, Protocol, ProtocolEvent};
use frame::{
    FrameParse, Opcode, CLOSE_INVALID_PAYLOAD, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR,
    CLOSE_TOO_LARGE, CLOSE_UNSUPPORTED, MAX_FRAME_SIZE,
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct Fragment {
    text: bool,
    data: Vec<u8>,
}

pub struct WebSocketProtocol {
    state: State,
    fragment: Option<Fragment>,
}

impl WebSocketProtocol {
    pub fn new() -> Self {
        WebSocketProtocol {
            state: State::Connecting,
            fragment: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Tear down with a close frame and record why.
    fn fail(&mut self, outcome: &mut Outcome, code: u16, reason: &str) {
        outcome.outbound.push(frame::close(code, reason));
        outcome.close = Some(CloseReason::ProtocolError(reason.to_string()));
        self.state = State::Closed;
    }

    fn deliver(&mut self, outcome: &mut Outcome, text: bool, payload: Vec<u8>) {
        if text {
            match String::from_utf8(payload) {
                Ok(message) => outcome.events.push(ProtocolEvent::Text(message)),
                Err(_) => {
                    self.fail(outcome, CLOSE_INVALID_PAYLOAD, "invalid UTF-8 in TEXT frame")
                }
            }
        } else {
            outcome.events.push(ProtocolEvent::Binary(payload));
        }
    }

    /// Handle one parsed frame. Returns false once the connection is done.
    fn handle_frame(&mut self, f: frame::Frame, outcome: &mut Outcome) -> bool {
        if self.state == State::Closing {
            // Waiting for the peer to echo our CLOSE; drop everything else.
            if f.opcode == Opcode::Close.bits() {
                outcome.close = Some(CloseReason::PeerClosed);
                self.state = State::Closed;
                return false;
            }
            return true;
        }

        // Client-to-server frames must be masked.
        if !f.masked {
            self.fail(outcome, CLOSE_PROTOCOL_ERROR, "unmasked client frame");
            return false;
        }

        let Some(opcode) = Opcode::from_bits(f.opcode) else {
            self.fail(outcome, CLOSE_UNSUPPORTED, "unsupported opcode");
            return false;
        };

        match opcode {
            Opcode::Text | Opcode::Binary => {
                if self.fragment.is_some() {
                    self.fail(outcome, CLOSE_PROTOCOL_ERROR, "data frame inside fragmented message");
                    return false;
                }
                let text = opcode == Opcode::Text;
                if f.fin {
                    self.deliver(outcome, text, f.payload);
                } else {
                    self.fragment = Some(Fragment {
                        text,
                        data: f.payload,
                    });
                }
            }

            Opcode::Continuation => {
                let Some(fragment) = self.fragment.as_mut() else {
                    self.fail(outcome, CLOSE_PROTOCOL_ERROR, "continuation without a message");
                    return false;
                };
                if fragment.data.len() + f.payload.len() > MAX_FRAME_SIZE {
                    self.fragment = None;
                    self.fail(outcome, CLOSE_TOO_LARGE, "fragmented message too large");
                    return false;
                }
                fragment.data.extend_from_slice(&f.payload);
                if f.fin {
                    let fragment = self.fragment.take().unwrap();
                    self.deliver(outcome, fragment.text, fragment.data);
                }
            }

            Opcode::Ping => {
                // Answered right here, before the application sees anything.
                trace!(len = f.payload.len(), "ping received");
                outcome.outbound.push(frame::pong(&f.payload));
            }

            Opcode::Pong => {
                debug!(len = f.payload.len(), "pong received");
            }

            Opcode::Close => {
                let code = if f.payload.len() >= 2 {
                    u16::from_be_bytes([f.payload[0], f.payload[1]])
                } else {
                    CLOSE_NORMAL
                };
                outcome.outbound.push(frame::close(code, ""));
                outcome.close = Some(CloseReason::PeerClosed);
                self.state = State::Closed;
                return false;
            }
        }

        self.state != State::Closed
    }
}

impl Default for WebSocketProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for WebSocketProtocol {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn on_data(&mut self, input: &[u8]) -> Outcome {
        let mut outcome = Outcome::default();
        let mut pos = 0;

        if self.state == State::Connecting {
            match handshake::process(input) {
                handshake::Handshake::Incomplete => return outcome,
                handshake::Handshake::Invalid(reason) => {
                    outcome.consumed = input.len();
                    outcome.close = Some(CloseReason::ProtocolError(reason));
                    self.state = State::Closed;
                    return outcome;
                }
                handshake::Handshake::Complete { response, consumed } => {
                    outcome.outbound.push(response);
                    outcome.events.push(ProtocolEvent::Opened);
                    self.state = State::Open;
                    pos = consumed;
                }
            }
        }

        if self.state == State::Closed {
            // Late bytes after teardown are discarded.
            outcome.consumed = input.len();
            return outcome;
        }

        while pos < input.len() {
            match frame::parse_frame(&input[pos..]) {
                FrameParse::Incomplete => break,
                FrameParse::TooLarge(len) => {
                    self.fail(
                        &mut outcome,
                        CLOSE_TOO_LARGE,
                        &format!("frame of {len} bytes exceeds limit"),
                    );
                    pos = input.len();
                    break;
                }
                FrameParse::Complete(f, used) => {
                    pos += used;
                    if !self.handle_frame(f, &mut outcome) {
                        break;
                    }
                }
            }
        }

        outcome.consumed = pos;
        outcome
    }

    fn shutdown(&mut self) -> Option<Vec<u8>> {
        if self.state == State::Open {
            self.state = State::Closing;
            Some(frame::close(CLOSE_NORMAL, "server closing"))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::frame::client_frame;

    const KEY: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    const UPGRADE: &str = "GET /chat HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         \r\n";

    fn open_protocol() -> WebSocketProtocol {
        let mut proto = WebSocketProtocol::new();
        let outcome = proto.on_data(UPGRADE.as_bytes());
        assert_eq!(proto.state(), State::Open);
        assert_eq!(outcome.events, vec![ProtocolEvent::Opened]);
        proto
    }

    fn close_code(wire: &[u8]) -> u16 {
        match frame::parse_frame(wire) {
            FrameParse::Complete(f, _) => {
                assert_eq!(f.opcode, Opcode::Close.bits());
                u16::from_be_bytes([f.payload[0], f.payload[1]])
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_emits_response_and_opened() {
        let mut proto = WebSocketProtocol::new();
        let outcome = proto.on_data(UPGRADE.as_bytes());
        assert_eq!(outcome.consumed, UPGRADE.len());
        assert_eq!(outcome.outbound.len(), 1);
        let response = String::from_utf8(outcome.outbound[0].clone()).unwrap();
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn test_handshake_split_across_reads() {
        let mut proto = WebSocketProtocol::new();
        let bytes = UPGRADE.as_bytes();
        // First delivery cuts mid-header.
        let outcome = proto.on_data(&bytes[..40]);
        assert_eq!(outcome.consumed, 0);
        assert_eq!(proto.state(), State::Connecting);

        let outcome = proto.on_data(bytes);
        assert_eq!(proto.state(), State::Open);
        assert_eq!(outcome.events, vec![ProtocolEvent::Opened]);
    }

    #[test]
    fn test_bad_handshake_closes() {
        let mut proto = WebSocketProtocol::new();
        let request = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let outcome = proto.on_data(request.as_bytes());
        assert!(matches!(outcome.close, Some(CloseReason::ProtocolError(_))));
        assert_eq!(proto.state(), State::Closed);
    }

    #[test]
    fn test_text_frame_after_handshake_in_one_read() {
        let mut proto = WebSocketProtocol::new();
        let mut wire = UPGRADE.as_bytes().to_vec();
        wire.extend(client_frame(true, Opcode::Text.bits(), b"Hello", KEY));

        let outcome = proto.on_data(&wire);
        assert_eq!(outcome.consumed, wire.len());
        assert_eq!(
            outcome.events,
            vec![
                ProtocolEvent::Opened,
                ProtocolEvent::Text("Hello".to_string())
            ]
        );
    }

    #[test]
    fn test_text_round_trip() {
        let mut proto = open_protocol();
        let wire = client_frame(true, Opcode::Text.bits(), "caf\u{e9}".as_bytes(), KEY);
        let outcome = proto.on_data(&wire);
        assert_eq!(
            outcome.events,
            vec![ProtocolEvent::Text("caf\u{e9}".to_string())]
        );
    }

    #[test]
    fn test_invalid_utf8_text_closes_1007() {
        let mut proto = open_protocol();
        // 0xC3 0x28 is an illegal two-byte sequence.
        let wire = client_frame(true, Opcode::Text.bits(), &[0xC3, 0x28], KEY);
        let outcome = proto.on_data(&wire);
        assert!(outcome.events.is_empty());
        assert_eq!(outcome.outbound.len(), 1);
        assert_eq!(close_code(&outcome.outbound[0]), 1007);
        assert_eq!(proto.state(), State::Closed);
    }

    #[test]
    fn test_binary_frames_skip_utf8_validation() {
        let mut proto = open_protocol();
        let wire = client_frame(true, Opcode::Binary.bits(), &[0xC3, 0x28], KEY);
        let outcome = proto.on_data(&wire);
        assert_eq!(
            outcome.events,
            vec![ProtocolEvent::Binary(vec![0xC3, 0x28])]
        );
    }

    #[test]
    fn test_ping_gets_immediate_pong() {
        let mut proto = open_protocol();
        let wire = client_frame(true, Opcode::Ping.bits(), b"probe", KEY);
        let outcome = proto.on_data(&wire);
        assert!(outcome.events.is_empty());
        assert_eq!(outcome.outbound, vec![frame::pong(b"probe")]);
        assert_eq!(proto.state(), State::Open);
    }

    #[test]
    fn test_unmasked_client_frame_closes_1002() {
        let mut proto = open_protocol();
        let outcome = proto.on_data(&frame::text("cheeky"));
        assert_eq!(close_code(&outcome.outbound[0]), 1002);
        assert_eq!(proto.state(), State::Closed);
    }

    #[test]
    fn test_unknown_opcode_closes_1003() {
        let mut proto = open_protocol();
        let wire = client_frame(true, 0x3, b"", KEY);
        let outcome = proto.on_data(&wire);
        assert_eq!(close_code(&outcome.outbound[0]), 1003);
        assert_eq!(proto.state(), State::Closed);
    }

    #[test]
    fn test_oversized_frame_closes_1009() {
        let mut proto = open_protocol();
        let mut wire = vec![0x81, 0x80 | 127];
        wire.extend_from_slice(&(frame::MAX_FRAME_SIZE as u64 + 1).to_be_bytes());
        let outcome = proto.on_data(&wire);
        assert_eq!(close_code(&outcome.outbound[0]), 1009);
        assert_eq!(proto.state(), State::Closed);
    }

    #[test]
    fn test_close_frame_is_echoed() {
        let mut proto = open_protocol();
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let wire = client_frame(true, Opcode::Close.bits(), &payload, KEY);
        let outcome = proto.on_data(&wire);
        assert_eq!(close_code(&outcome.outbound[0]), 1000);
        assert_eq!(outcome.close, Some(CloseReason::PeerClosed));
        assert_eq!(proto.state(), State::Closed);
    }

    #[test]
    fn test_fragmented_text_is_assembled() {
        let mut proto = open_protocol();
        let mut wire = Vec::new();
        wire.extend(client_frame(false, Opcode::Text.bits(), b"Hello, ", KEY));
        // A control frame may interleave with the fragments.
        wire.extend(client_frame(true, Opcode::Ping.bits(), b"", KEY));
        wire.extend(client_frame(true, Opcode::Continuation.bits(), b"world", KEY));

        let outcome = proto.on_data(&wire);
        assert_eq!(
            outcome.events,
            vec![ProtocolEvent::Text("Hello, world".to_string())]
        );
        assert_eq!(outcome.outbound, vec![frame::pong(b"")]);
    }

    #[test]
    fn test_continuation_without_start_closes() {
        let mut proto = open_protocol();
        let wire = client_frame(true, Opcode::Continuation.bits(), b"orphan", KEY);
        let outcome = proto.on_data(&wire);
        assert_eq!(close_code(&outcome.outbound[0]), 1002);
    }

    #[test]
    fn test_partial_frame_consumes_nothing() {
        let mut proto = open_protocol();
        let wire = client_frame(true, Opcode::Text.bits(), b"payload", KEY);
        let outcome = proto.on_data(&wire[..5]);
        assert_eq!(outcome.consumed, 0);
        assert!(outcome.events.is_empty());

        // The full frame then parses from scratch.
        let outcome = proto.on_data(&wire);
        assert_eq!(
            outcome.events,
            vec![ProtocolEvent::Text("payload".to_string())]
        );
    }

    #[test]
    fn test_pipelined_frames_in_one_read() {
        let mut proto = open_protocol();
        let mut wire = Vec::new();
        wire.extend(client_frame(true, Opcode::Text.bits(), b"one", KEY));
        wire.extend(client_frame(true, Opcode::Text.bits(), b"two", KEY));
        let outcome = proto.on_data(&wire);
        assert_eq!(
            outcome.events,
            vec![
                ProtocolEvent::Text("one".to_string()),
                ProtocolEvent::Text("two".to_string())
            ]
        );
    }

    #[test]
    fn test_shutdown_sends_close_and_enters_closing() {
        let mut proto = open_protocol();
        let close = proto.shutdown().expect("open connection has a close frame");
        assert_eq!(close_code(&close), 1000);
        assert_eq!(proto.state(), State::Closing);

        // Peer's echo finishes the exchange.
        let wire = client_frame(true, Opcode::Close.bits(), &1000u16.to_be_bytes(), KEY);
        let outcome = proto.on_data(&wire);
        assert_eq!(outcome.close, Some(CloseReason::PeerClosed));
        assert_eq!(proto.state(), State::Closed);
    }

    #[test]
    fn test_shutdown_before_open_has_no_frame() {
        let mut proto = WebSocketProtocol::new();
        assert!(proto.shutdown().is_none());
    }

    #[test]
    fn test_data_after_close_is_discarded() {
        let mut proto = open_protocol();
        let wire = client_frame(true, Opcode::Close.bits(), &[], KEY);
        proto.on_data(&wire);
        assert_eq!(proto.state(), State::Closed);

        let late = client_frame(true, Opcode::Text.bits(), b"late", KEY);
        let outcome = proto.on_data(&late);
        assert_eq!(outcome.consumed, late.len());
        assert!(outcome.events.is_empty());
        assert!(outcome.outbound.is_empty());
    }
}
