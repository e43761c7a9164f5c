//! Portable unix backend using `poll(2)`, with a self-pipe for
//! cross-thread wakeup.

use super::{Event, Events, Interest, Selector};
use crate::common::timeout_millis;
use crate::net::sys::cvt;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) struct PollFds {
    /// Registered interests; rebuilt into a pollfd array on every select.
    table: Mutex<HashMap<RawFd, Interest>>,
    wake_reader: OwnedFd,
    wake_writer: OwnedFd,
}

fn poll_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READ) {
        events |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.contains(Interest::WRITE) {
        events |= libc::POLLOUT;
    }
    // POLLERR/POLLHUP/POLLNVAL are always reported
    events
}

fn fired_interest(revents: libc::c_short) -> Interest {
    let mut fired = Interest::NONE;
    // a hangup is readable: buffered data, then a zero-byte read
    if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLHUP) != 0 {
        fired |= Interest::READ;
    }
    if revents & libc::POLLOUT != 0 {
        fired |= Interest::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        fired |= Interest::ERROR;
    }
    fired
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(|_| ())
}

impl PollFds {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        _ = cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        let wake_reader = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let wake_writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblocking(wake_reader.as_raw_fd())?;
        set_nonblocking(wake_writer.as_raw_fd())?;
        Ok(Self {
            table: Mutex::new(HashMap::new()),
            wake_reader,
            wake_writer,
        })
    }

    fn drain_wakeups(&self) {
        let mut buffer = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_reader.as_raw_fd(),
                    buffer.as_mut_ptr().cast(),
                    buffer.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Selector for PollFds {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        _ = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fd, interest);
        Ok(())
    }

    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.register(fd, interest)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        _ = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fd);
        Ok(())
    }

    fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pollfds: Vec<libc::pollfd> = {
            let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let mut pollfds = Vec::with_capacity(table.len() + 1);
            pollfds.push(libc::pollfd {
                fd: self.wake_reader.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for (fd, interest) in table.iter() {
                pollfds.push(libc::pollfd {
                    fd: *fd,
                    events: poll_events(*interest),
                    revents: 0,
                });
            }
            pollfds
        };
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let rc = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_millis(remaining),
                )
            };
            match cvt(rc) {
                Ok(_) => break,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        for pollfd in &pollfds {
            if pollfd.revents == 0 {
                continue;
            }
            if pollfd.fd == self.wake_reader.as_raw_fd() {
                self.drain_wakeups();
                continue;
            }
            let fired = fired_interest(pollfd.revents);
            if !fired.is_empty() {
                events.0.push(Event {
                    fd: pollfd.fd,
                    fired,
                });
            }
        }
        Ok(())
    }

    fn wake(&self) -> io::Result<()> {
        let byte = 1u8;
        let n = unsafe {
            libc::write(
                self.wake_writer.as_raw_fd(),
                std::ptr::addr_of!(byte).cast(),
                1,
            )
        };
        // a full pipe already guarantees a pending wakeup
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::WouldBlock {
                return Err(e);
            }
        }
        Ok(())
    }
}
