//! Thin abstraction over the OS multiplexing primitive.
//!
//! The [`Selector`] trait unifies the platform backends: `epoll` on Linux,
//! `poll(2)` on the other unices. Both are level-triggered, so an interest
//! keeps firing until the condition is consumed.

use crate::impl_display_by_debug;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub(crate) use epoll::Epoll as Poller;
    } else if #[cfg(unix)] {
        mod poll;
        pub(crate) use poll::PollFds as Poller;
    } else {
        compile_error!("sockmux-core currently supports unix targets only");
    }
}

/// Bitset of per-socket interests and fired conditions.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// No interest.
    pub const NONE: Interest = Interest(0);
    /// The socket has data to read, or the peer closed its end.
    pub const READ: Interest = Interest(1);
    /// The socket accepts writes without blocking.
    pub const WRITE: Interest = Interest(1 << 1);
    /// The socket is in an error state.
    pub const ERROR: Interest = Interest(1 << 2);

    /// `true` if every bit of `other` is set in `self`.
    #[must_use]
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// `true` if no bit is set.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;

    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl_display_by_debug!(Interest);

/// One fired socket with the subset of conditions that fired.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Event {
    pub(crate) fd: RawFd,
    pub(crate) fired: Interest,
}

/// Reusable buffer of fired events for one `select` call.
#[derive(Debug, Default)]
pub(crate) struct Events(pub(crate) Vec<Event>);

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }
}

/// The OS multiplexing backend contract.
pub(crate) trait Selector {
    /// Start watching `fd` for `interest`. Replaces a previous
    /// registration for the same fd.
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Replace the watched interest of an already registered fd.
    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`.
    fn deregister(&self, fd: RawFd) -> io::Result<()>;

    /// Block until at least one interest fires or `timeout` elapses
    /// (`None` waits forever). Fired events are appended to `events`.
    /// EINTR is retried with the remaining time.
    fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()>;

    /// Interrupt a concurrent `select` from another thread. Best-effort.
    fn wake(&self) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_bit_algebra() {
        let mask = Interest::READ | Interest::ERROR;
        assert!(mask.contains(Interest::READ));
        assert!(mask.contains(Interest::ERROR));
        assert!(!mask.contains(Interest::WRITE));
        assert!(!mask.contains(Interest::READ | Interest::WRITE));
        assert!(Interest::NONE.is_empty());
        assert!((mask & Interest::WRITE).is_empty());
        let mut mask = Interest::READ;
        mask |= Interest::WRITE;
        assert!(mask.contains(Interest::WRITE));
    }
}
