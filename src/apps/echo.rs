//! Raw TCP echo application.
//!
//! No framing at all: whatever arrives goes straight back. Engine
//! heartbeats stay on, so clients of this application must tolerate the
//! 4-byte magic showing up between echoes.

use crate::engine::{Application, Engine};
use crate::protocols::{ProtocolChoice, ProtocolEvent};
use std::os::fd::RawFd;
use tracing::trace;

pub struct EchoApp;

impl Application for EchoApp {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn select_protocol(&self, _preview: &[u8]) -> ProtocolChoice {
        ProtocolChoice::Raw
    }

    fn on_event(&self, engine: &Engine, fd: RawFd, event: ProtocolEvent) {
        if let ProtocolEvent::Binary(bytes) = event {
            trace!(fd, len = bytes.len(), "echoing");
            let _ = engine.send(fd, &bytes);
        }
    }
}
