//! Per-connection state.
//!
//! One `Connection` record per accepted descriptor owns everything the
//! engine tracks for it: the stream, the outbound queue behind the
//! per-connection send lock, the inbound staging buffer the reactor
//! appends to, and the decode state a single in-flight worker task
//! drives. The send path and the decode path never share a lock, so a
//! slow command cannot stall a broadcast to the same client.

use crate::protocols::Protocol;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub(crate) struct Connection {
    pub fd: RawFd,
    pub peer: SocketAddr,
    pub stream: TcpStream,
    /// Outbound queue; its mutex is the per-connection send lock.
    pub send: Mutex<SendQueue>,
    /// Bytes read by the reactor, not yet claimed by the decode task.
    pub inbound: Mutex<Inbound>,
    /// Decode state. Exclusively held by the one in-flight task.
    pub working: Mutex<Working>,
    last_active: Mutex<Instant>,
}

pub(crate) struct Inbound {
    pub staging: BytesMut,
    /// True while a decode task for this connection is queued or running.
    pub dispatch_queued: bool,
}

pub(crate) struct Working {
    pub buf: BytesMut,
    pub protocol: Option<Box<dyn Protocol>>,
}

impl Connection {
    pub fn new(fd: RawFd, stream: TcpStream, peer: SocketAddr) -> Self {
        Connection {
            fd,
            peer,
            stream,
            send: Mutex::new(SendQueue::new()),
            inbound: Mutex::new(Inbound {
                staging: BytesMut::with_capacity(4096),
                dispatch_queued: false,
            }),
            working: Mutex::new(Working {
                buf: BytesMut::with_capacity(4096),
                protocol: None,
            }),
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Stamp activity. Called on every successful read, never on writes.
    pub fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }
}

/// FIFO of outbound byte chunks. The head chunk is dequeued only once
/// every one of its bytes has reached the kernel; a partial write leaves
/// the remainder at the head for the next WRITE-ready event.
pub(crate) struct SendQueue {
    chunks: VecDeque<Vec<u8>>,
    head_written: usize,
}

impl SendQueue {
    pub fn new() -> Self {
        SendQueue {
            chunks: VecDeque::new(),
            head_written: 0,
        }
    }

    pub fn push(&mut self, chunk: Vec<u8>) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Bytes still queued, for logging.
    pub fn pending_bytes(&self) -> usize {
        let queued: usize = self.chunks.iter().map(|c| c.len()).sum();
        queued - self.head_written
    }

    /// Write queued chunks until the queue empties or the writer would
    /// block. Returns `Ok(true)` once the queue is empty.
    pub fn drain(&mut self, writer: &mut dyn Write) -> io::Result<bool> {
        while !self.chunks.is_empty() {
            let n = {
                let head = &self.chunks[0];
                match writer.write(&head[self.head_written..]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned 0",
                        ))
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };

            self.head_written += n;
            if self.head_written == self.chunks[0].len() {
                self.chunks.pop_front();
                self.head_written = 0;
            }
        }
        Ok(true)
    }
}
