//! The connection engine.
//!
//! A single reactor thread drives the multiplexer: it accepts in batches,
//! reads into per-connection staging buffers, and flushes send queues on
//! WRITE readiness. Protocol parsing and command execution run on the
//! worker pool, one in-flight task per connection so bytes stay ordered.
//! `send` may be called from any thread; all bytes of one frame are
//! enqueued under a single acquisition of that connection's send lock, so
//! concurrent broadcasts never interleave frames on the wire.

use super::connection::Connection;
use super::keepalive;
use super::multiplexer::{Event, Interest, Multiplexer, MultiplexerKind};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocols::{
    self, CloseReason, Protocol, ProtocolChoice, ProtocolEvent, RawProtocol,
};
use crate::protocols::resp::RespProtocol;
use crate::protocols::websocket::WebSocketProtocol;
use crate::worker::WorkerPool;
use socket2::{Domain, Protocol as SockProtocol, SockRef, Socket, Type};
use std::collections::HashMap;
use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Reactor wait timeout; also the stop-latency bound.
const REACTOR_TICK: Duration = Duration::from_millis(100);
/// Connections accepted per readiness pass, bounding tail latency for
/// everyone else.
const ACCEPT_BATCH: usize = 32;
/// Read scratch size per recv call.
const READ_CHUNK: usize = 4096;
/// Kernel send/recv buffer size per socket; sized for broadcast bursts.
const SOCKET_BUFFER: usize = 512 * 1024;

/// A server behavior plugged into the engine: protocol policy, keepalive
/// policy, and the callbacks fed by decoded protocol events.
pub trait Application: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the engine's magic-byte heartbeat applies to this
    /// application's connections. Framed protocols keep their own
    /// keepalive and turn this off.
    fn heartbeat_enabled(&self) -> bool {
        true
    }

    /// Choose a protocol from the connection's first bytes. The default
    /// recognizes RESP and WebSocket upgrades.
    fn select_protocol(&self, preview: &[u8]) -> ProtocolChoice {
        protocols::detect(preview)
    }

    fn on_start(&self, _engine: &Engine) {}

    fn on_connect(&self, _engine: &Engine, _fd: RawFd) {}

    fn on_event(&self, engine: &Engine, fd: RawFd, event: ProtocolEvent);

    fn on_disconnect(&self, _engine: &Engine, _fd: RawFd) {}

    fn on_stop(&self) {}
}

/// Engine tuning, resolved from the loaded configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ip: String,
    pub port: u16,
    pub io_type: MultiplexerKind,
    pub worker_threads: usize,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
    /// Operator override for the application's heartbeat policy.
    pub heartbeat_override: Option<bool>,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        EngineConfig {
            ip: config.ip.clone(),
            port: config.port,
            io_type: config.io_type,
            worker_threads: config.worker_threads,
            keepalive_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(config.idle_timeout_seconds),
            heartbeat_override: config.heartbeat_enabled,
        }
    }
}

pub(crate) struct Core {
    pub(crate) config: EngineConfig,
    pub(crate) app: Arc<dyn Application>,
    pub(crate) mux: Box<dyn Multiplexer>,
    pub(crate) connections: Mutex<HashMap<RawFd, Arc<Connection>>>,
    pub(crate) workers: WorkerPool,
    pub(crate) running: AtomicBool,
    /// Application policy combined with the operator override.
    pub(crate) heartbeat_enabled: bool,
    local_addr: Mutex<Option<SocketAddr>>,
    reactor: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    pub(crate) shutdown_flag: Mutex<bool>,
    pub(crate) shutdown_cv: Condvar,
}

#[derive(Clone)]
pub struct Engine {
    pub(crate) core: Arc<Core>,
}

impl Engine {
    pub fn new(config: EngineConfig, app: Arc<dyn Application>) -> Result<Engine> {
        let mux = config.io_type.build()?;
        let workers = WorkerPool::new(config.worker_threads);
        // The application's policy stands unless the operator disables.
        let heartbeat_enabled =
            app.heartbeat_enabled() && config.heartbeat_override.unwrap_or(true);

        Ok(Engine {
            core: Arc::new(Core {
                config,
                app,
                mux,
                connections: Mutex::new(HashMap::new()),
                workers,
                running: AtomicBool::new(false),
                heartbeat_enabled,
                local_addr: Mutex::new(None),
                reactor: Mutex::new(None),
                keepalive: Mutex::new(None),
                shutdown_flag: Mutex::new(false),
                shutdown_cv: Condvar::new(),
            }),
        })
    }

    /// Bind, listen, and spawn the reactor and keepalive threads. Any
    /// socket failure here is fatal and returned to the caller.
    pub fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.core.config.ip, self.core.config.port)
            .parse()
            .map_err(|_| {
                Error::InvalidAddress(format!(
                    "{}:{}",
                    self.core.config.ip, self.core.config.port
                ))
            })?;

        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
        socket.set_reuse_address(true)?;
        if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER) {
            warn!(error = %e, "could not size the listen send buffer");
        }
        if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER) {
            warn!(error = %e, "could not size the listen recv buffer");
        }
        socket.bind(&addr.into())?;
        socket.listen(libc::SOMAXCONN)?;
        socket.set_nonblocking(true)?;

        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;
        self.core.mux.add(listener.as_raw_fd(), Interest::READ)?;

        *self.core.local_addr.lock().unwrap() = Some(local_addr);
        self.core.running.store(true, Ordering::SeqCst);

        let reactor = {
            let engine = self.clone();
            thread::Builder::new()
                .name("reactor".to_string())
                .spawn(move || reactor_loop(engine, listener))?
        };
        *self.core.reactor.lock().unwrap() = Some(reactor);

        let supervisor = {
            let engine = self.clone();
            thread::Builder::new()
                .name("keepalive".to_string())
                .spawn(move || keepalive::supervise(engine))?
        };
        *self.core.keepalive.lock().unwrap() = Some(supervisor);

        self.core.app.on_start(self);

        info!(
            addr = %local_addr,
            io = ?self.core.config.io_type,
            app = self.core.app.name(),
            "server started"
        );
        Ok(())
    }

    /// Signal the reactor, join both service threads, drain the worker
    /// pool, and close every connection. Bounded time: nothing here waits
    /// on client bytes.
    pub fn stop(&self) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }

        {
            let mut flag = self.core.shutdown_flag.lock().unwrap();
            *flag = true;
            self.core.shutdown_cv.notify_all();
        }

        if let Some(handle) = self.core.reactor.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.core.keepalive.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.core.workers.shutdown();
        self.core.app.on_stop();

        let drained: Vec<(RawFd, Arc<Connection>)> =
            self.core.connections.lock().unwrap().drain().collect();
        for (fd, conn) in drained {
            let _ = self.core.mux.remove(fd);
            drop(conn);
        }

        info!("server stopped");
    }

    /// The bound address, once `start` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.core.local_addr.lock().unwrap()
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.lock().unwrap().len()
    }

    /// Enqueue one outbound frame for `fd` and flush as much as the
    /// kernel takes. Success means enqueued, not flushed: leftovers wait
    /// for WRITE readiness. The whole frame goes under one send-lock
    /// acquisition.
    pub fn send(&self, fd: RawFd, bytes: &[u8]) -> Result<()> {
        let conn = self
            .core
            .connections
            .lock()
            .unwrap()
            .get(&fd)
            .cloned()
            .ok_or(Error::ConnectionClosed(fd))?;

        let flush = {
            let mut queue = conn.send.lock().unwrap();
            queue.push(bytes.to_vec());
            let mut writer = &conn.stream;
            let flush = queue.drain(&mut writer);
            if let Ok(false) = flush {
                trace!(fd, pending = queue.pending_bytes(), "partial send queued");
                let _ = self.core.mux.modify(fd, Interest::READ | Interest::WRITE);
            }
            flush
        };

        if let Err(e) = flush {
            debug!(fd, error = %e, "send failed, closing connection");
            self.close_connection(fd);
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove a connection from every engine structure and close it.
    /// Broadcast membership (and any other application state) is torn
    /// down via `on_disconnect` before the record drops.
    pub(crate) fn close_connection(&self, fd: RawFd) {
        let conn = self.core.connections.lock().unwrap().remove(&fd);
        let Some(conn) = conn else {
            return;
        };
        let _ = self.core.mux.remove(fd);
        self.core.app.on_disconnect(self, fd);
        info!(fd, peer = %conn.peer, "client disconnected");
        drop(conn);
    }

    pub(crate) fn snapshot_connections(&self) -> Vec<Arc<Connection>> {
        self.core.connections.lock().unwrap().values().cloned().collect()
    }

    /// Queue a decode task unless one is already in flight for this
    /// connection. One task at a time keeps per-connection byte order.
    fn schedule_dispatch(&self, conn: &Arc<Connection>) {
        let should_submit = {
            let mut inbound = conn.inbound.lock().unwrap();
            if inbound.dispatch_queued || inbound.staging.is_empty() {
                false
            } else {
                inbound.dispatch_queued = true;
                true
            }
        };

        if should_submit {
            let engine = self.clone();
            let conn = Arc::clone(conn);
            self.core.workers.submit(Box::new(move || {
                dispatch_task(engine, conn);
            }));
        }
    }
}

/// Drain staged bytes through the connection's protocol instance until
/// no new bytes remain, then release the in-flight slot. Runs on a
/// worker thread; the `working` lock is uncontended because only one
/// task per connection exists.
fn dispatch_task(engine: Engine, conn: Arc<Connection>) {
    let mut work = conn.working.lock().unwrap();
    loop {
        {
            let mut inbound = conn.inbound.lock().unwrap();
            if inbound.staging.is_empty() {
                inbound.dispatch_queued = false;
                return;
            }
            work.buf.extend_from_slice(&inbound.staging);
            inbound.staging.clear();
        }

        if !process_working(&engine, &conn, &mut work) {
            conn.inbound.lock().unwrap().dispatch_queued = false;
            return;
        }
    }
}

/// Run detection and the protocol over the working buffer. Returns false
/// once the connection has been closed.
fn process_working(
    engine: &Engine,
    conn: &Arc<Connection>,
    work: &mut super::connection::Working,
) -> bool {
    let fd = conn.fd;
    loop {
        if work.protocol.is_none() {
            // Heartbeat magics may precede the first command bytes.
            let stripped = protocols::strip_keepalive_magic(&work.buf);
            if stripped > 0 {
                let _ = work.buf.split_to(stripped);
            }

            match engine.core.app.select_protocol(&work.buf) {
                ProtocolChoice::Undecided => return true,
                ProtocolChoice::Resp => {
                    debug!(fd, "protocol selected: resp");
                    work.protocol = Some(Box::new(RespProtocol::new()));
                }
                ProtocolChoice::WebSocket => {
                    debug!(fd, "protocol selected: websocket");
                    work.protocol = Some(Box::new(WebSocketProtocol::new()));
                }
                ProtocolChoice::Raw => {
                    work.protocol = Some(Box::new(RawProtocol));
                }
                ProtocolChoice::Reject => {
                    warn!(fd, "unrecognized protocol, closing");
                    engine.close_connection(fd);
                    return false;
                }
            }
        }

        let outcome = work
            .protocol
            .as_mut()
            .expect("protocol instance just selected")
            .on_data(&work.buf);

        let progressed = outcome.consumed > 0
            || !outcome.outbound.is_empty()
            || !outcome.events.is_empty()
            || outcome.close.is_some();
        let _ = work.buf.split_to(outcome.consumed);

        for frame in outcome.outbound {
            if engine.send(fd, &frame).is_err() {
                return false;
            }
        }
        for event in outcome.events {
            engine.core.app.on_event(engine, fd, event);
        }

        if let Some(reason) = outcome.close {
            match reason {
                CloseReason::PeerClosed => debug!(fd, "protocol session closed by peer"),
                CloseReason::ProtocolError(e) => warn!(fd, error = %e, "protocol error"),
            }
            engine.close_connection(fd);
            return false;
        }

        if !progressed || work.buf.is_empty() {
            return true;
        }
    }
}

/// The reactor: one thread, one multiplexer, every socket.
fn reactor_loop(engine: Engine, listener: TcpListener) {
    let core = &engine.core;
    let listen_fd = listener.as_raw_fd();
    let mut events: Vec<Event> = Vec::with_capacity(1024);
    let mut scratch = [0u8; READ_CHUNK];
    // Set when an accept pass filled its batch; the backlog may hold
    // more, and edge-triggered backends will not re-announce it.
    let mut accept_pending = false;

    while core.running.load(Ordering::SeqCst) {
        if accept_pending {
            accept_pending = accept_batch(&engine, &listener);
        }

        let n = match core.mux.wait(REACTOR_TICK, &mut events) {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "multiplexer wait failed");
                continue;
            }
        };
        if n == 0 {
            continue;
        }

        let mut to_close: Vec<RawFd> = Vec::new();

        for ev in events.iter() {
            if ev.fd == listen_fd {
                if ev.is_readable() {
                    accept_pending = accept_batch(&engine, &listener);
                }
                continue;
            }

            let conn = core.connections.lock().unwrap().get(&ev.fd).cloned();
            let Some(conn) = conn else {
                continue;
            };

            if ev.is_error() {
                to_close.push(ev.fd);
                continue;
            }
            if ev.is_readable() && handle_readable(&engine, &conn, &mut scratch) {
                to_close.push(ev.fd);
                continue;
            }
            if ev.is_writable() && handle_writable(&engine, &conn) {
                to_close.push(ev.fd);
            }
        }

        // Closes are deferred to the end of the tick so a protocol still
        // gets its close frame flushed ahead of the FIN.
        for fd in to_close {
            engine.close_connection(fd);
        }
    }

    debug!("reactor exited");
}

/// Accept up to one batch. Returns true when the batch filled, meaning
/// the backlog may still hold connections.
fn accept_batch(engine: &Engine, listener: &TcpListener) -> bool {
    let core = &engine.core;
    for i in 0..ACCEPT_BATCH {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    error!(peer = %peer, error = %e, "could not make client non-blocking");
                    continue;
                }
                let sock = SockRef::from(&stream);
                if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER) {
                    warn!(peer = %peer, error = %e, "could not size client send buffer");
                }
                if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER) {
                    warn!(peer = %peer, error = %e, "could not size client recv buffer");
                }

                let fd = stream.as_raw_fd();
                let conn = Arc::new(Connection::new(fd, stream, peer));
                core.connections.lock().unwrap().insert(fd, conn);

                if let Err(e) = core.mux.add(fd, Interest::READ) {
                    error!(fd, error = %e, "could not register client");
                    core.connections.lock().unwrap().remove(&fd);
                    continue;
                }

                core.app.on_connect(engine, fd);
                info!(fd, peer = %peer, "client connected");
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if core.running.load(Ordering::SeqCst) {
                    error!(error = %e, "accept failed");
                }
                return false;
            }
        }
        if i == ACCEPT_BATCH - 1 {
            return true;
        }
    }
    false
}

/// Drain the socket into the staging buffer. Returns true when the
/// connection must close (EOF or hard error).
fn handle_readable(engine: &Engine, conn: &Arc<Connection>, scratch: &mut [u8]) -> bool {
    let mut got_data = false;
    loop {
        match (&conn.stream).read(scratch) {
            Ok(0) => {
                trace!(fd = conn.fd, "connection closed by client");
                if got_data {
                    engine.schedule_dispatch(conn);
                }
                return true;
            }
            Ok(n) => {
                conn.touch();
                let mut inbound = conn.inbound.lock().unwrap();
                inbound.staging.extend_from_slice(&scratch[..n]);
                got_data = true;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(fd = conn.fd, error = %e, "read failed");
                return true;
            }
        }
    }

    if got_data {
        engine.schedule_dispatch(conn);
    }
    false
}

/// Flush the send queue on WRITE readiness; drop WRITE interest once
/// empty. Returns true when the connection must close.
fn handle_writable(engine: &Engine, conn: &Arc<Connection>) -> bool {
    let mut queue = conn.send.lock().unwrap();
    let mut writer = &conn.stream;
    match queue.drain(&mut writer) {
        Ok(true) => {
            let _ = engine.core.mux.modify(conn.fd, Interest::READ);
            false
        }
        Ok(false) => false,
        Err(e) => {
            debug!(fd = conn.fd, error = %e, "flush failed");
            true
        }
    }
}
