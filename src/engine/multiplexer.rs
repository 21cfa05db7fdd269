//! Readiness multiplexer abstraction.
//!
//! Wraps the OS readiness primitive behind a uniform interface: register a
//! file descriptor with an interest mask, mutate or drop the registration,
//! and wait for ready descriptors with a millisecond timeout. The three
//! variants are interchangeable for correctness and differ only in how
//! they scale with the number of descriptors.

use serde::Deserialize;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::epoll::EpollMultiplexer;
use super::poll::PollMultiplexer;
use super::select::SelectMultiplexer;

/// Which events a registration wants to be woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);

    pub fn is_readable(self) -> bool {
        self.0 & Interest::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Interest::WRITE.0 != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// One ready descriptor as reported by `wait`.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    readable: bool,
    writable: bool,
    error: bool,
}

impl Event {
    pub(crate) fn new(fd: RawFd, readable: bool, writable: bool, error: bool) -> Self {
        Event {
            fd,
            readable,
            writable,
            error,
        }
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }
}

/// Uniform interface over the OS readiness primitives.
///
/// `add`/`modify`/`remove` may be called from any thread; the select and
/// poll variants serialize registration changes against `wait` with an
/// internal table lock (changes made while `wait` blocks take effect on
/// the next call), while epoll mutates the kernel set directly.
pub trait Multiplexer: Send + Sync {
    fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn remove(&self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout` and append ready descriptors to `events`
    /// (cleared first). Returns the number of ready descriptors; a signal
    /// interruption reports zero.
    fn wait(&self, timeout: Duration, events: &mut Vec<Event>) -> io::Result<usize>;
}

/// Multiplexer variant selector, chosen by `network.io_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiplexerKind {
    /// Level-triggered select(2), bounded by FD_SETSIZE
    Select,
    /// Level-triggered poll(2) over a rebuilt descriptor array
    Poll,
    /// Edge-triggered epoll(7)
    #[default]
    Epoll,
}

impl MultiplexerKind {
    /// Construct the selected variant.
    pub fn build(self) -> io::Result<Box<dyn Multiplexer>> {
        match self {
            MultiplexerKind::Select => Ok(Box::new(SelectMultiplexer::new())),
            MultiplexerKind::Poll => Ok(Box::new(PollMultiplexer::new())),
            MultiplexerKind::Epoll => Ok(Box::new(EpollMultiplexer::new()?)),
        }
    }
}
