//! The event-driven connection engine.
//!
//! A readiness multiplexer (select, poll, or epoll behind one trait)
//! feeds a single reactor thread; per-connection records carry the
//! buffers, the send lock, and the protocol instance; a keepalive
//! supervisor handles idle eviction and heartbeats.

mod connection;
mod epoll;
mod keepalive;
mod multiplexer;
mod poll;
mod select;
mod server;

pub use multiplexer::{Event, Interest, Multiplexer, MultiplexerKind};
pub use server::{Application, Engine, EngineConfig};
