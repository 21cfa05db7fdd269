//! select(2)-based multiplexer.
//!
//! Level-triggered. The interest table is locked only long enough to
//! snapshot registrations; the blocking syscall runs on the snapshot, so
//! registration changes made by other threads land on the next `wait`.
//! Descriptors must stay below FD_SETSIZE.

use super::multiplexer::{Event, Interest, Multiplexer};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::time::Duration;

pub(crate) struct SelectMultiplexer {
    table: Mutex<HashMap<RawFd, Interest>>,
}

impl SelectMultiplexer {
    pub(crate) fn new() -> Self {
        SelectMultiplexer {
            table: Mutex::new(HashMap::new()),
        }
    }

    fn check_fd(fd: RawFd) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fd {fd} outside select's FD_SETSIZE range"),
            ));
        }
        Ok(())
    }
}

impl Multiplexer for SelectMultiplexer {
    fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        Self::check_fd(fd)?;
        self.table.lock().unwrap().insert(fd, interest);
        Ok(())
    }

    fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        Self::check_fd(fd)?;
        self.table.lock().unwrap().insert(fd, interest);
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.table.lock().unwrap().remove(&fd);
        Ok(())
    }

    fn wait(&self, timeout: Duration, events: &mut Vec<Event>) -> io::Result<usize> {
        events.clear();

        let snapshot: Vec<(RawFd, Interest)> = {
            let table = self.table.lock().unwrap();
            table.iter().map(|(&fd, &interest)| (fd, interest)).collect()
        };

        if snapshot.is_empty() {
            std::thread::sleep(timeout);
            return Ok(0);
        }

        let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut error_set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut error_set);
        }

        let mut max_fd = 0;
        for &(fd, interest) in &snapshot {
            unsafe {
                if interest.is_readable() {
                    libc::FD_SET(fd, &mut read_set);
                }
                if interest.is_writable() {
                    libc::FD_SET(fd, &mut write_set);
                }
                libc::FD_SET(fd, &mut error_set);
            }
            max_fd = max_fd.max(fd);
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                &mut error_set,
                &mut tv,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for &(fd, _) in &snapshot {
            let readable = unsafe { libc::FD_ISSET(fd, &read_set) };
            let writable = unsafe { libc::FD_ISSET(fd, &write_set) };
            let error = unsafe { libc::FD_ISSET(fd, &error_set) };
            if readable || writable || error {
                events.push(Event::new(fd, readable, writable, error));
            }
        }

        Ok(events.len())
    }
}
