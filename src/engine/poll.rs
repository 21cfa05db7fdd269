//! poll(2)-based multiplexer.
//!
//! Level-triggered, no descriptor-number ceiling. The pollfd array is
//! rebuilt from the interest table on every `wait`; the table lock is
//! released before the blocking syscall.

use super::multiplexer::{Event, Interest, Multiplexer};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

pub(crate) struct PollMultiplexer {
    table: Mutex<HashMap<RawFd, Interest>>,
}

impl PollMultiplexer {
    pub(crate) fn new() -> Self {
        PollMultiplexer {
            table: Mutex::new(HashMap::new()),
        }
    }
}

impl Multiplexer for PollMultiplexer {
    fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.table.lock().unwrap().insert(fd, interest);
        Ok(())
    }

    fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.table.lock().unwrap().insert(fd, interest);
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.table.lock().unwrap().remove(&fd);
        Ok(())
    }

    fn wait(&self, timeout: Duration, events: &mut Vec<Event>) -> io::Result<usize> {
        events.clear();

        let mut fds: Vec<libc::pollfd> = {
            let table = self.table.lock().unwrap();
            table
                .iter()
                .map(|(&fd, &interest)| {
                    let mut requested = 0;
                    if interest.is_readable() {
                        requested |= libc::POLLIN;
                    }
                    if interest.is_writable() {
                        requested |= libc::POLLOUT;
                    }
                    libc::pollfd {
                        fd,
                        events: requested,
                        revents: 0,
                    }
                })
                .collect()
        };

        if fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(0);
        }

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for pfd in &fds {
            if pfd.revents == 0 {
                continue;
            }
            let readable = pfd.revents & libc::POLLIN != 0;
            let writable = pfd.revents & libc::POLLOUT != 0;
            let error = pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            events.push(Event::new(pfd.fd, readable, writable, error));
        }

        Ok(events.len())
    }
}
