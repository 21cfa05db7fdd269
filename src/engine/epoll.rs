//! epoll(7)-based multiplexer.
//!
//! Edge-triggered. Registration changes go straight to the kernel via
//! `epoll_ctl`, which is safe to call while another thread sits in
//! `epoll_wait`, so this variant needs no table lock. Edge semantics
//! require consumers to drain readable/writable descriptors until
//! `WouldBlock`, which is how the reactor's read and flush loops behave.

use super::multiplexer::{Event, Interest, Multiplexer};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

const MAX_EVENTS: usize = 1024;

pub(crate) struct EpollMultiplexer {
    epfd: RawFd,
}

impl EpollMultiplexer {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollMultiplexer { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let mut bits = libc::EPOLLET as u32;
        if let Some(interest) = interest {
            if interest.is_readable() {
                bits |= libc::EPOLLIN as u32;
            }
            if interest.is_writable() {
                bits |= libc::EPOLLOUT as u32;
            }
        }
        let mut ev = libc::epoll_event {
            events: bits,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Multiplexer for EpollMultiplexer {
    fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(interest))
    }

    fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    fn remove(&self, fd: RawFd) -> io::Result<()> {
        // The event argument must be non-null for kernels before 2.6.9.
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    fn wait(&self, timeout: Duration, events: &mut Vec<Event>) -> io::Result<usize> {
        events.clear();

        let mut raw: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout_ms)
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for ev in raw.iter().take(n as usize) {
            let readable = ev.events & libc::EPOLLIN as u32 != 0;
            let writable = ev.events & libc::EPOLLOUT as u32 != 0;
            let error = ev.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
            events.push(Event::new(ev.u64 as RawFd, readable, writable, error));
        }

        Ok(events.len())
    }
}

impl Drop for EpollMultiplexer {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
