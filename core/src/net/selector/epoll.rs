//! Linux backend using `epoll` in level-triggered mode, with an `eventfd`
//! for cross-thread wakeup.

use super::{Event, Events, Interest, Selector};
use crate::common::timeout_millis;
use crate::net::sys::cvt;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Marker carried by the eventfd registration so its wakeups are consumed
/// instead of reported.
const WAKE_TOKEN: u64 = u64::MAX;

#[derive(Debug)]
pub(crate) struct Epoll {
    epfd: OwnedFd,
    wakefd: OwnedFd,
}

fn epoll_events(interest: Interest) -> u32 {
    let mut events = 0u32;
    if interest.contains(Interest::READ) {
        events |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITE) {
        events |= libc::EPOLLOUT as u32;
    }
    if interest.contains(Interest::ERROR) {
        events |= libc::EPOLLERR as u32;
    }
    events
}

fn fired_interest(events: u32) -> Interest {
    let mut fired = Interest::NONE;
    // a hangup is readable: buffered data, then a zero-byte read
    if events & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLHUP) as u32 != 0 {
        fired |= Interest::READ;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        fired |= Interest::WRITE;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        fired |= Interest::ERROR;
    }
    fired
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };
        let wakefd = cvt(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
        let wakefd = unsafe { OwnedFd::from_raw_fd(wakefd) };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        _ = cvt(unsafe {
            libc::epoll_ctl(
                epfd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                wakefd.as_raw_fd(),
                &mut ev,
            )
        })?;
        Ok(Self { epfd, wakefd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: epoll_events(interest),
            u64: fd as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) }).map(|_| ())
    }

    fn drain_wakeups(&self) {
        let mut counter = 0u64;
        // nonblocking read; EAGAIN just means nobody rang
        _ = unsafe {
            libc::read(
                self.wakefd.as_raw_fd(),
                std::ptr::addr_of_mut!(counter).cast(),
                size_of::<u64>(),
            )
        };
    }
}

impl Selector for Epoll {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, interest) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
            }
            other => other,
        }
    }

    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut ev) })
            .map(|_| ())
    }

    fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let capacity = events.0.capacity().max(64);
        let mut buffer = vec![libc::epoll_event { events: 0, u64: 0 }; capacity];
        let fired = loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    buffer.as_mut_ptr(),
                    capacity as libc::c_int,
                    timeout_millis(remaining),
                )
            };
            match cvt(rc) {
                Ok(n) => break n as usize,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        break 0;
                    }
                }
                Err(e) => return Err(e),
            }
        };
        for ev in &buffer[..fired] {
            if ev.u64 == WAKE_TOKEN {
                self.drain_wakeups();
                continue;
            }
            let interest = fired_interest(ev.events);
            if !interest.is_empty() {
                events.0.push(Event {
                    fd: ev.u64 as RawFd,
                    fired: interest,
                });
            }
        }
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        let one = 1u64;
        let n = unsafe {
            libc::write(
                self.wakefd.as_raw_fd(),
                std::ptr::addr_of!(one).cast(),
                size_of::<u64>(),
            )
        };
        // a saturated counter already guarantees a pending wakeup
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::WouldBlock {
                return Err(e);
            }
        }
        Ok(())
    }
}
