//! Socket-to-interest table on top of the platform selector.

use crate::net::selector::{Events, Interest, Poller, Selector};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const EVENT_CAPACITY: usize = 1024;

/// A set of sockets with per-socket interest masks and a single blocking
/// [`poll`](PollSet::poll) call.
///
/// All registration calls are safe from any thread; `poll` is meant to be
/// called by one loop thread at a time. The interest table lock is never
/// held across the blocking wait.
#[derive(Debug)]
pub struct PollSet {
    selector: Poller,
    table: Mutex<HashMap<RawFd, Interest>>,
}

impl PollSet {
    /// Creates an empty poll set.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            selector: Poller::new()?,
            table: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RawFd, Interest>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `fd` with `interest`, OR-merging into any existing mask.
    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut table = self.lock();
        match table.get(&fd).copied() {
            None => {
                self.selector.register(fd, interest)?;
                _ = table.insert(fd, interest);
            }
            Some(current) => {
                let merged = current | interest;
                if merged != current {
                    self.selector.reregister(fd, merged)?;
                    _ = table.insert(fd, merged);
                }
            }
        }
        Ok(())
    }

    /// Replace the interest of `fd`, inserting it if absent.
    pub fn update(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut table = self.lock();
        match table.get(&fd).copied() {
            None => self.selector.register(fd, interest)?,
            Some(current) if current != interest => self.selector.reregister(fd, interest)?,
            Some(_) => {}
        }
        _ = table.insert(fd, interest);
        Ok(())
    }

    /// Drop `fd` from the set. Unknown fds are ignored.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let mut table = self.lock();
        if table.remove(&fd).is_some() {
            self.selector.deregister(fd)?;
        }
        Ok(())
    }

    /// `true` if `fd` is in the set.
    pub fn has(&self, fd: RawFd) -> bool {
        self.lock().contains_key(&fd)
    }

    /// Number of sockets in the set.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// `true` when no socket is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every socket from the set.
    pub fn clear(&self) -> io::Result<()> {
        let mut table = self.lock();
        for fd in table.keys().copied().collect::<Vec<_>>() {
            self.selector.deregister(fd)?;
        }
        table.clear();
        Ok(())
    }

    /// Block until at least one interest fires or `timeout` elapses
    /// (`None` waits forever). Returns the fired sockets with the subset
    /// of their interests that fired; an empty result means pure timeout
    /// or a wakeup. An empty set returns immediately.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<(RawFd, Interest)>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        self.selector.select(&mut events, timeout)?;
        let table = self.lock();
        Ok(events
            .0
            .iter()
            // a socket removed while the wait was in flight is not reported
            .filter(|event| table.contains_key(&event.fd))
            .map(|event| (event.fd, event.fired))
            .collect())
    }

    /// Interrupt a blocked [`poll`](PollSet::poll) from another thread.
    /// Best-effort: failures are reported to the error hook, not returned.
    pub fn wake_up(&self) {
        if let Err(e) = self.selector.wake() {
            crate::error::report("PollSet::wake_up", &e.to_string());
        }
    }
}
