//! Server applications pluggable into the engine.

mod echo;
mod redis;
mod websocket;

pub use echo::EchoApp;
pub use redis::RedisApp;
pub use websocket::WebSocketApp;
