//! RESP application: decoded commands against the shared store.
//!
//! Replies are encoded with the RESP reply types and written through the
//! engine's send path, so they get the same frame-atomicity and
//! backpressure handling as every other protocol. Engine heartbeats are
//! off; RESP clients would choke on magic bytes in the reply stream.

use crate::engine::{Application, Engine};
use crate::protocols::resp::Reply;
use crate::protocols::ProtocolEvent;
use crate::store::Store;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, trace};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

pub struct RedisApp {
    store: Arc<Store>,
}

impl RedisApp {
    pub fn new(store: Arc<Store>) -> Self {
        RedisApp { store }
    }

    fn execute(&self, args: &[Vec<u8>]) -> Reply {
        let cmd = String::from_utf8_lossy(&args[0]).to_uppercase();
        trace!(cmd = %cmd, argc = args.len(), "executing");

        match cmd.as_str() {
            "PING" => match args.len() {
                1 => Reply::simple("PONG"),
                2 => Reply::bulk(args[1].clone()),
                _ => wrong_arity("ping"),
            },

            "COMMAND" => Reply::array(vec![]),

            "SET" => {
                if args.len() != 3 {
                    return wrong_arity("set");
                }
                self.store.set(&args[1], args[2].clone());
                Reply::simple("OK")
            }

            "GET" => {
                if args.len() != 2 {
                    return wrong_arity("get");
                }
                match self.store.get(&args[1]) {
                    Ok(Some(value)) => Reply::bulk(value),
                    Ok(None) => Reply::nil(),
                    Err(_) => Reply::error(WRONGTYPE),
                }
            }

            "DEL" => {
                if args.len() < 2 {
                    return wrong_arity("del");
                }
                let deleted = args[1..].iter().filter(|key| self.store.del(key)).count();
                Reply::integer(deleted as i64)
            }

            // The pattern argument is required but not matched against:
            // every key comes back.
            "KEYS" => {
                if args.len() != 2 {
                    return wrong_arity("keys");
                }
                Reply::array(self.store.keys().into_iter().map(Reply::bulk).collect())
            }

            "LPUSH" => {
                if args.len() < 3 {
                    return wrong_arity("lpush");
                }
                match self.store.lpush(&args[1], args[2..].to_vec()) {
                    Ok(len) => Reply::integer(len as i64),
                    Err(_) => Reply::error(WRONGTYPE),
                }
            }

            "LPOP" => {
                if args.len() != 2 {
                    return wrong_arity("lpop");
                }
                match self.store.lpop(&args[1]) {
                    Ok(Some(value)) => Reply::bulk(value),
                    Ok(None) => Reply::nil(),
                    Err(_) => Reply::error(WRONGTYPE),
                }
            }

            "LRANGE" => {
                if args.len() != 4 {
                    return wrong_arity("lrange");
                }
                let (Some(start), Some(stop)) = (parse_index(&args[2]), parse_index(&args[3]))
                else {
                    return Reply::error("ERR value is not an integer or out of range");
                };
                match self.store.lrange(&args[1], start, stop) {
                    Ok(values) => {
                        Reply::array(values.into_iter().map(Reply::bulk).collect())
                    }
                    Err(_) => Reply::error(WRONGTYPE),
                }
            }

            "HSET" => {
                if args.len() != 4 {
                    return wrong_arity("hset");
                }
                match self.store.hset(&args[1], &args[2], args[3].clone()) {
                    Ok(new_field) => Reply::integer(new_field as i64),
                    Err(_) => Reply::error(WRONGTYPE),
                }
            }

            "HGET" => {
                if args.len() != 3 {
                    return wrong_arity("hget");
                }
                match self.store.hget(&args[1], &args[2]) {
                    Ok(Some(value)) => Reply::bulk(value),
                    Ok(None) => Reply::nil(),
                    Err(_) => Reply::error(WRONGTYPE),
                }
            }

            "HKEYS" => {
                if args.len() != 2 {
                    return wrong_arity("hkeys");
                }
                match self.store.hkeys(&args[1]) {
                    Ok(fields) => {
                        Reply::array(fields.into_iter().map(Reply::bulk).collect())
                    }
                    Err(_) => Reply::error(WRONGTYPE),
                }
            }

            _ => Reply::error(format!("ERR unknown command '{cmd}'")),
        }
    }
}

fn wrong_arity(cmd: &str) -> Reply {
    Reply::error(format!("ERR wrong number of arguments for '{cmd}' command"))
}

fn parse_index(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

impl Application for RedisApp {
    fn name(&self) -> &'static str {
        "redis"
    }

    // RESP replies and magic bytes do not mix.
    fn heartbeat_enabled(&self) -> bool {
        false
    }

    fn on_event(&self, engine: &Engine, fd: RawFd, event: ProtocolEvent) {
        let ProtocolEvent::Command(args) = event else {
            return;
        };
        if args.is_empty() {
            return;
        }
        let reply = self.execute(&args);
        if engine.send(fd, &reply.encode()).is_err() {
            debug!(fd, "reply dropped, connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> RedisApp {
        RedisApp::new(Store::new())
    }

    fn run(app: &RedisApp, parts: &[&[u8]]) -> Vec<u8> {
        let args: Vec<Vec<u8>> = parts.iter().map(|p| p.to_vec()).collect();
        app.execute(&args).encode()
    }

    #[test]
    fn test_ping() {
        let app = app();
        assert_eq!(run(&app, &[b"PING"]), b"+PONG\r\n");
        assert_eq!(run(&app, &[b"ping"]), b"+PONG\r\n");
        assert_eq!(run(&app, &[b"PING", b"hi"]), b"$2\r\nhi\r\n");
    }

    #[test]
    fn test_command_returns_empty_array() {
        assert_eq!(run(&app(), &[b"COMMAND"]), b"*0\r\n");
    }

    #[test]
    fn test_set_get_round_trip() {
        let app = app();
        assert_eq!(run(&app, &[b"SET", b"k", b"v"]), b"+OK\r\n");
        assert_eq!(run(&app, &[b"GET", b"k"]), b"$1\r\nv\r\n");
    }

    #[test]
    fn test_get_missing_is_nil() {
        assert_eq!(run(&app(), &[b"GET", b"nope"]), b"$-1\r\n");
    }

    #[test]
    fn test_del_counts_deletions() {
        let app = app();
        run(&app, &[b"SET", b"a", b"1"]);
        run(&app, &[b"SET", b"b", b"2"]);
        assert_eq!(run(&app, &[b"DEL", b"a", b"b", b"c"]), b":2\r\n");
        assert_eq!(run(&app, &[b"GET", b"a"]), b"$-1\r\n");
    }

    #[test]
    fn test_keys_ignores_pattern() {
        let app = app();
        run(&app, &[b"SET", b"alpha", b"1"]);
        run(&app, &[b"SET", b"beta", b"2"]);
        // Pattern is accepted and discarded; both keys come back.
        let encoded = run(&app, &[b"KEYS", b"alpha*"]);
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("*2\r\n"));
        assert!(text.contains("alpha"));
        assert!(text.contains("beta"));
    }

    #[test]
    fn test_list_commands() {
        let app = app();
        assert_eq!(run(&app, &[b"LPUSH", b"l", b"a", b"b"]), b":2\r\n");
        assert_eq!(
            run(&app, &[b"LRANGE", b"l", b"0", b"-1"]),
            b"*2\r\n$1\r\nb\r\n$1\r\na\r\n"
        );
        assert_eq!(run(&app, &[b"LPOP", b"l"]), b"$1\r\nb\r\n");
        assert_eq!(run(&app, &[b"LPOP", b"l"]), b"$1\r\na\r\n");
        assert_eq!(run(&app, &[b"LPOP", b"l"]), b"$-1\r\n");
    }

    #[test]
    fn test_lrange_rejects_bad_indices() {
        let app = app();
        run(&app, &[b"LPUSH", b"l", b"a"]);
        assert_eq!(
            run(&app, &[b"LRANGE", b"l", b"zero", b"-1"]),
            b"-ERR value is not an integer or out of range\r\n"
        );
    }

    #[test]
    fn test_hash_commands() {
        let app = app();
        assert_eq!(run(&app, &[b"HSET", b"h", b"f", b"v"]), b":1\r\n");
        assert_eq!(run(&app, &[b"HSET", b"h", b"f", b"v2"]), b":0\r\n");
        assert_eq!(run(&app, &[b"HGET", b"h", b"f"]), b"$2\r\nv2\r\n");
        assert_eq!(run(&app, &[b"HGET", b"h", b"nope"]), b"$-1\r\n");
        assert_eq!(run(&app, &[b"HKEYS", b"h"]), b"*1\r\n$1\r\nf\r\n");
    }

    #[test]
    fn test_wrongtype_replies() {
        let app = app();
        run(&app, &[b"SET", b"s", b"v"]);
        let reply = run(&app, &[b"LPUSH", b"s", b"x"]);
        assert!(reply.starts_with(b"-WRONGTYPE"));
        let reply = run(&app, &[b"HGET", b"s", b"f"]);
        assert!(reply.starts_with(b"-WRONGTYPE"));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            run(&app(), &[b"FLY", b"me"]),
            b"-ERR unknown command 'FLY'\r\n"
        );
    }

    #[test]
    fn test_wrong_arity() {
        let app = app();
        assert_eq!(
            run(&app, &[b"SET", b"k"]),
            b"-ERR wrong number of arguments for 'set' command\r\n"
        );
        assert_eq!(
            run(&app, &[b"GET"]),
            b"-ERR wrong number of arguments for 'get' command\r\n"
        );
    }

    mod end_to_end {
        use super::*;
        use crate::engine::{EngineConfig, MultiplexerKind};
        use crate::protocols::KEEPALIVE_MAGIC;
        use std::io::{Read, Write};
        use std::net::TcpStream;
        use std::time::Duration;

        fn start() -> Engine {
            let config = EngineConfig {
                ip: "127.0.0.1".to_string(),
                port: 0,
                io_type: MultiplexerKind::Epoll,
                worker_threads: 2,
                keepalive_interval: Duration::from_secs(10),
                idle_timeout: Duration::from_secs(60),
                heartbeat_override: None,
            };
            let engine =
                Engine::new(config, Arc::new(RedisApp::new(Store::new()))).unwrap();
            engine.start().unwrap();
            engine
        }

        fn connect(engine: &Engine) -> TcpStream {
            let stream = TcpStream::connect(engine.local_addr().unwrap()).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }

        fn read_reply(stream: &mut TcpStream, expected_len: usize) -> Vec<u8> {
            let mut buf = vec![0u8; expected_len];
            stream.read_exact(&mut buf).unwrap();
            buf
        }

        #[test]
        fn test_set_then_get_over_socket() {
            let engine = start();
            let mut client = connect(&engine);

            client
                .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
                .unwrap();
            assert_eq!(read_reply(&mut client, 5), b"+OK\r\n");

            client.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap();
            assert_eq!(read_reply(&mut client, 7), b"$1\r\nv\r\n");

            engine.stop();
        }

        #[test]
        fn test_heartbeat_magic_prefix_is_tolerated() {
            let engine = start();
            let mut client = connect(&engine);

            let mut payload = KEEPALIVE_MAGIC.to_vec();
            payload.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
            client.write_all(&payload).unwrap();

            assert_eq!(read_reply(&mut client, 7), b"+PONG\r\n");
            engine.stop();
        }

        #[test]
        fn test_pipelined_commands_get_ordered_replies() {
            let engine = start();
            let mut client = connect(&engine);

            client
                .write_all(
                    b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n",
                )
                .unwrap();
            assert_eq!(read_reply(&mut client, 12), b"+OK\r\n$1\r\nv\r\n");

            engine.stop();
        }

        #[test]
        fn test_unknown_command_keeps_connection_open() {
            let engine = start();
            let mut client = connect(&engine);

            client.write_all(b"*1\r\n$3\r\nFOO\r\n").unwrap();
            let reply = read_reply(&mut client, b"-ERR unknown command 'FOO'\r\n".len());
            assert_eq!(reply, b"-ERR unknown command 'FOO'\r\n");

            // Still alive for the next command.
            client.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
            assert_eq!(read_reply(&mut client, 7), b"+PONG\r\n");

            engine.stop();
        }

        #[test]
        fn test_malformed_resp_closes_connection() {
            let engine = start();
            let mut client = connect(&engine);

            client.write_all(b"*nonsense\r\n").unwrap();
            let mut buf = [0u8; 16];
            loop {
                match client.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) => panic!("expected clean close, got {e}"),
                }
            }

            engine.stop();
        }
    }
}
