//! WebSocket chat application.
//!
//! Keeps the broadcast set: every connection whose handshake completed.
//! Incoming text is rebroadcast to the whole set tagged with the sender,
//! `[client<fd>]: <text>`. The application owns its PING cadence on a
//! private timer thread; engine-level heartbeats are off because raw
//! magic bytes inside a framed stream would be parsed as a bogus frame
//! header.

use crate::config::WebSocketOptions;
use crate::engine::{Application, Engine};
use crate::protocols::websocket::frame;
use crate::protocols::ProtocolEvent;
use std::collections::HashSet;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct WebSocketApp {
    options: WebSocketOptions,
    clients: Arc<Mutex<HashSet<RawFd>>>,
    pinger: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

impl WebSocketApp {
    pub fn new(options: WebSocketOptions) -> Self {
        WebSocketApp {
            options,
            clients: Arc::new(Mutex::new(HashSet::new())),
            pinger: Mutex::new(None),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    fn broadcast(&self, engine: &Engine, message: &str) {
        if message.len() > self.options.max_frame_size {
            warn!(
                len = message.len(),
                cap = self.options.max_frame_size,
                "broadcast message over the frame cap, dropped"
            );
            return;
        }

        // One frame, encoded once. The set lock is held only to copy the
        // member list; each send then takes that connection's own lock.
        let wire = frame::text(message);
        let targets: Vec<RawFd> = self.clients.lock().unwrap().iter().copied().collect();
        for fd in targets {
            if engine.send(fd, &wire).is_err() {
                debug!(fd, "broadcast skipped, client gone");
            }
        }
    }
}

impl Application for WebSocketApp {
    fn name(&self) -> &'static str {
        "websocket"
    }

    // The protocol owns PING/PONG; magic bytes would corrupt framing.
    fn heartbeat_enabled(&self) -> bool {
        false
    }

    fn on_start(&self, engine: &Engine) {
        info!(
            enable_ping = self.options.enable_ping,
            ping_interval = self.options.ping_interval,
            max_frame_size = self.options.max_frame_size,
            "websocket application started"
        );
        if !self.options.enable_ping {
            return;
        }

        let engine = engine.clone();
        let clients = Arc::clone(&self.clients);
        let stop = Arc::clone(&self.stop);
        let interval = Duration::from_secs(self.options.ping_interval.max(1));

        let handle = thread::Builder::new()
            .name("ws-pinger".to_string())
            .spawn(move || {
                let (flag, cv) = &*stop;
                loop {
                    {
                        let guard = flag.lock().unwrap();
                        let (guard, _) = cv.wait_timeout(guard, interval).unwrap();
                        if *guard {
                            break;
                        }
                    }
                    let wire = frame::ping(b"");
                    let targets: Vec<RawFd> =
                        clients.lock().unwrap().iter().copied().collect();
                    for fd in targets {
                        let _ = engine.send(fd, &wire);
                    }
                }
            })
            .expect("failed to spawn pinger thread");
        *self.pinger.lock().unwrap() = Some(handle);
    }

    fn on_event(&self, engine: &Engine, fd: RawFd, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Opened => {
                let total = {
                    let mut clients = self.clients.lock().unwrap();
                    clients.insert(fd);
                    clients.len()
                };
                info!(fd, total, "client joined broadcast set");
            }
            ProtocolEvent::Text(message) => {
                info!(fd, len = message.len(), "message received");
                let tagged = format!("[client{fd}]: {message}");
                self.broadcast(engine, &tagged);
            }
            ProtocolEvent::Binary(bytes) => {
                debug!(fd, len = bytes.len(), "binary frame ignored");
            }
            ProtocolEvent::Command(_) => {}
        }
    }

    fn on_disconnect(&self, _engine: &Engine, fd: RawFd) {
        // Membership goes before the connection record does.
        if self.clients.lock().unwrap().remove(&fd) {
            debug!(fd, "client left broadcast set");
        }
    }

    fn on_stop(&self) {
        {
            let (flag, cv) = &*self.stop;
            *flag.lock().unwrap() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.pinger.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
