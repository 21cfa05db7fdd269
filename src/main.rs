//! polyserve: a multi-protocol TCP server framework.
//!
//! An event-driven connection engine with pluggable readiness backends
//! (select, poll, epoll) routes each connection's byte stream into a
//! per-connection protocol instance. Ships with:
//! - a WebSocket chat server (RFC 6455 subset) with broadcast
//! - a RESP key/value server over an in-memory store
//! - a raw TCP echo server
//!
//! The application is selected by `application.type` in the TOML config;
//! SIGINT/SIGTERM shut the server down gracefully.

mod apps;
mod config;
mod engine;
mod error;
mod protocols;
mod registry;
mod store;
mod worker;

use clap::Parser;
use config::{CliArgs, Config, DEFAULT_CONFIG_PATH};
use engine::{Engine, EngineConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signum: libc::c_int) {
    // Only an atomic store: anything more is not async-signal-safe.
    STOP.store(true, Ordering::SeqCst);
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = CliArgs::parse();
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 1;
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    info!(
        app = %config.application,
        addr = format!("{}:{}", config.ip, config.port),
        io = ?config.io_type,
        workers = config.worker_threads,
        "starting polyserve"
    );

    let store = store::Store::new();
    let registry = registry::defaults();
    info!(available = ?registry.available(), "registered applications");

    let app = match registry.create(&config.application, &config, &store) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "could not create application");
            return -1;
        }
    };

    let engine = match Engine::new(EngineConfig::from_config(&config), app) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "could not build engine");
            return -1;
        }
    };
    if let Err(e) = engine.start() {
        error!(error = %e, "server start failed");
        return -1;
    }

    while !STOP.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
    }

    info!("shutting down");
    engine.stop();
    0
}
