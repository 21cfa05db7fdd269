//! Keepalive supervisor.
//!
//! A dedicated thread ticking on a fixed interval. Each tick it walks
//! the connection table: connections idle past the timeout are evicted
//! (close frame first when the protocol has one), the rest get the
//! heartbeat magic when the application's keepalive policy is on.
//! Framed applications own their ping cadence and keep this off.

use super::server::Engine;
use crate::protocols::{Protocol, KEEPALIVE_MAGIC};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

pub(crate) fn supervise(engine: Engine) {
    let core = &engine.core;

    loop {
        {
            let guard = core.shutdown_flag.lock().unwrap();
            let (guard, _timeout) = core
                .shutdown_cv
                .wait_timeout(guard, core.config.keepalive_interval)
                .unwrap();
            if *guard {
                break;
            }
        }
        if !core.running.load(Ordering::SeqCst) {
            break;
        }

        for conn in engine.snapshot_connections() {
            if conn.idle_for() > core.config.idle_timeout {
                info!(fd = conn.fd, peer = %conn.peer, "evicting idle connection");
                let close_frame = {
                    let mut work = conn.working.lock().unwrap();
                    work.protocol.as_mut().and_then(|p| p.shutdown())
                };
                if let Some(frame) = close_frame {
                    let _ = engine.send(conn.fd, &frame);
                }
                engine.close_connection(conn.fd);
            } else if core.heartbeat_enabled {
                debug!(fd = conn.fd, "heartbeat queued");
                let _ = engine.send(conn.fd, &KEEPALIVE_MAGIC);
            }
        }
    }

    debug!("keepalive supervisor exited");
}
