//! Event-driven socket dispatch: the calling thread polls and
//! synchronously invokes the observers registered for each ready socket.

use crate::common::blocker::CondvarBlocker;
use crate::common::constants::{
    LoopState, RunState, DEFAULT_BACKOFF_INCREMENT, DEFAULT_MAX_TIMEOUT,
};
use crate::impl_display_by_debug;
use crate::net::poll_set::PollSet;
use crate::net::selector::Interest;
use crate::net::worker::{Work, Worker};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// The notification kinds a reactor delivers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EventKind {
    /// The socket has data to read, or the peer closed its end.
    Readable,
    /// The socket accepts writes without blocking.
    Writable,
    /// The socket is in an error state.
    Error,
    /// Nothing fired within the poll timeout.
    Timeout,
    /// The reactor is shutting down.
    Shutdown,
}

impl_display_by_debug!(EventKind);

/// One delivered notification.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SocketEvent {
    /// The socket the notification is about. `-1` for the broadcast
    /// kinds (`Timeout`, `Shutdown`) which are not tied to one socket.
    pub fd: RawFd,
    /// What happened.
    pub kind: EventKind,
}

/// Capability object registered for a socket.
///
/// `accepts` decides which notification kinds this observer wants; the
/// union of all observers' accepted kinds on a socket determines the
/// socket's interest mask in the poll set.
pub trait SocketObserver: Send + Sync {
    /// `true` if this observer wants notifications of `kind`.
    fn accepts(&self, kind: EventKind) -> bool;

    /// Handle one notification. Runs on the reactor loop thread.
    fn on_event(&self, event: &SocketEvent);
}

struct FnObserver<F> {
    kind: EventKind,
    f: F,
}

impl<F> SocketObserver for FnObserver<F>
where
    F: Fn(&SocketEvent) + Send + Sync,
{
    fn accepts(&self, kind: EventKind) -> bool {
        self.kind == kind
    }

    fn on_event(&self, event: &SocketEvent) {
        (self.f)(event);
    }
}

/// Convenience constructor for a single-kind closure observer.
pub fn observer<F>(kind: EventKind, f: F) -> Arc<dyn SocketObserver>
where
    F: Fn(&SocketEvent) + Send + Sync + 'static,
{
    Arc::new(FnObserver { kind, f })
}

/// Tuning knobs for the reactor run loop.
#[derive(Debug, Copy, Clone)]
pub struct Params {
    /// How long one `poll` call may block.
    pub poll_timeout: Duration,
    /// Initial idle sleep; grows by [`DEFAULT_BACKOFF_INCREMENT`] per idle
    /// iteration up to `sleep_limit`.
    pub sleep: Duration,
    /// Ceiling for the idle backoff sleep.
    pub sleep_limit: Duration,
    /// With a zero `poll_timeout`, start sleeping once the loop has been
    /// spinning empty for longer than `sleep_limit`.
    pub throttle: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_MAX_TIMEOUT,
            sleep: Duration::ZERO,
            sleep_limit: DEFAULT_MAX_TIMEOUT,
            throttle: true,
        }
    }
}

type ObserverList = Vec<Arc<dyn SocketObserver>>;

/// The reactor.
///
/// `run()` occupies the calling thread until [`stop`](SocketReactor::stop);
/// registration and removal are safe from any thread, including from
/// inside an observer.
pub struct SocketReactor {
    params: Params,
    poll_timeout_ms: AtomicU64,
    state: LoopState,
    poll_set: PollSet,
    handlers: Mutex<HashMap<RawFd, ObserverList>>,
    worker: Worker,
    blocker: CondvarBlocker,
    on_idle: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl std::fmt::Debug for SocketReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketReactor")
            .field("state", &self.state.get())
            .field("sockets", &self.poll_set.count())
            .finish_non_exhaustive()
    }
}

impl SocketReactor {
    /// Creates a reactor with default [`Params`].
    pub fn new() -> io::Result<Self> {
        Self::with_params(Params::default())
    }

    /// Creates a reactor with the given parameters.
    pub fn with_params(params: Params) -> io::Result<Self> {
        Ok(Self {
            params,
            poll_timeout_ms: AtomicU64::new(params.poll_timeout.as_millis() as u64),
            state: LoopState::default(),
            poll_set: PollSet::new()?,
            handlers: Mutex::new(HashMap::new()),
            worker: Worker::default(),
            blocker: CondvarBlocker::default(),
            on_idle: Mutex::new(None),
        })
    }

    fn lock_handlers(&self) -> MutexGuard<'_, HashMap<RawFd, ObserverList>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn interest_of(observers: &ObserverList) -> Interest {
        let mut interest = Interest::NONE;
        for observer in observers {
            if observer.accepts(EventKind::Readable) {
                interest |= Interest::READ;
            }
            if observer.accepts(EventKind::Writable) {
                interest |= Interest::WRITE;
            }
            if observer.accepts(EventKind::Error) {
                interest |= Interest::ERROR;
            }
        }
        interest
    }

    /// Register `observer` for `socket`. The socket joins the poll set
    /// with the union of all its observers' interests. Registering the
    /// same observer twice is a no-op.
    pub fn add_event_handler(
        &self,
        socket: RawFd,
        observer: Arc<dyn SocketObserver>,
    ) -> io::Result<()> {
        let mut handlers = self.lock_handlers();
        let observers = handlers.entry(socket).or_default();
        if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
        let interest = Self::interest_of(observers);
        drop(handlers);
        if !interest.is_empty() {
            self.poll_set.update(socket, interest)?;
        }
        self.wake_up();
        Ok(())
    }

    /// `true` if exactly this observer is registered for `socket`.
    pub fn has_event_handler(&self, socket: RawFd, observer: &Arc<dyn SocketObserver>) -> bool {
        self.lock_handlers()
            .get(&socket)
            .is_some_and(|observers| observers.iter().any(|o| Arc::ptr_eq(o, observer)))
    }

    /// Remove `observer` from `socket`. Other observers of the socket are
    /// unaffected; removing the last observer removes the socket from the
    /// poll set.
    pub fn remove_event_handler(
        &self,
        socket: RawFd,
        observer: &Arc<dyn SocketObserver>,
    ) -> io::Result<()> {
        let remaining = {
            let mut handlers = self.lock_handlers();
            let Some(observers) = handlers.get_mut(&socket) else {
                return Ok(());
            };
            let Some(index) = observers.iter().position(|o| Arc::ptr_eq(o, observer)) else {
                return Ok(());
            };
            _ = observers.remove(index);
            if observers.is_empty() {
                _ = handlers.remove(&socket);
                None
            } else {
                Some(Self::interest_of(observers))
            }
        };
        match remaining {
            None => self.poll_set.remove(socket)?,
            Some(interest) if interest.is_empty() => self.poll_set.remove(socket)?,
            Some(interest) => self.poll_set.update(socket, interest)?,
        }
        Ok(())
    }

    /// Install the callback invoked when the loop iterates with no
    /// registered observers.
    pub fn set_on_idle<F: Fn() + Send + 'static>(&self, f: F) {
        *self.on_idle.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(f));
    }

    /// Schedule deferred work on the reactor's private scheduler; see
    /// [`Worker::add_work`].
    pub fn add_completion_handler(&self, work: Work, delay: Option<Duration>) {
        self.worker.add_work(work, delay);
    }

    /// The reactor's private work scheduler.
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Replace the poll timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.poll_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// The current poll timeout.
    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.load(Ordering::Relaxed))
    }

    /// Current run-loop state.
    pub fn state(&self) -> RunState {
        self.state.get()
    }

    /// Run the dispatch loop on the calling thread until [`stop`]
    /// (SocketReactor::stop). A stop issued before `run()` makes it
    /// return after delivering the shutdown notification, without
    /// polling once.
    pub fn run(&self) {
        if !self.state.try_start() {
            // consume only a stop issued while no loop was running; a stop
            // aimed at a running loop is delivered by that loop on exit
            if self.state.try_consume_stop() {
                self.on_shutdown();
            }
            return;
        }
        tracing::info!("reactor loop started");
        let mut backoff = self.params.sleep;
        let mut spinning_since = Instant::now();
        while !self.state.stop_requested() {
            if self.has_accepting_handlers() {
                match self.poll_set.poll(Some(self.get_timeout())) {
                    Ok(fired) if fired.is_empty() => {
                        if self.state.stop_requested() {
                            break;
                        }
                        self.dispatch_to_all(EventKind::Timeout);
                        let throttled = self.params.throttle
                            && self.get_timeout().is_zero()
                            && spinning_since.elapsed() > self.params.sleep_limit;
                        if throttled {
                            self.sleep(&mut backoff);
                        }
                    }
                    Ok(fired) => {
                        if self.state.stop_requested() {
                            break;
                        }
                        for (fd, mask) in fired {
                            if mask.contains(Interest::READ) {
                                self.dispatch(fd, EventKind::Readable);
                            }
                            if mask.contains(Interest::WRITE) {
                                self.dispatch(fd, EventKind::Writable);
                            }
                            if mask.contains(Interest::ERROR) {
                                self.dispatch(fd, EventKind::Error);
                            }
                        }
                        backoff = self.params.sleep;
                        spinning_since = Instant::now();
                    }
                    Err(e) => {
                        crate::error::report("SocketReactor::run", &e.to_string());
                        self.sleep(&mut backoff);
                    }
                }
            } else {
                self.on_idle();
                self.sleep(&mut backoff);
            }
            _ = self.worker.do_work(false, false);
        }
        self.on_shutdown();
        self.state.finish();
        tracing::info!("reactor loop stopped");
    }

    /// Spawn a named thread running [`run`](SocketReactor::run).
    pub fn start(self: &Arc<Self>) -> io::Result<std::thread::JoinHandle<()>> {
        let reactor = self.clone();
        std::thread::Builder::new()
            .name(String::from("sockmux-reactor"))
            .spawn(move || reactor.run())
    }

    /// Request the loop to stop. Idempotent; callable from any thread and
    /// observed on the next iteration at latest.
    pub fn stop(&self) {
        self.state.request_stop();
        self.wake_up();
    }

    /// Interrupt a blocked poll or idle sleep.
    pub fn wake_up(&self) {
        self.poll_set.wake_up();
        self.blocker.notify();
    }

    /// The underlying poll set.
    pub fn poll_set(&self) -> &PollSet {
        &self.poll_set
    }

    fn has_accepting_handlers(&self) -> bool {
        if self.poll_set.is_empty() {
            return false;
        }
        self.lock_handlers().values().any(|observers| {
            !Self::interest_of(observers).is_empty()
        })
    }

    fn sleep(&self, backoff: &mut Duration) {
        if *backoff < self.params.sleep_limit {
            *backoff = (*backoff + DEFAULT_BACKOFF_INCREMENT).min(self.params.sleep_limit);
        }
        self.blocker.block(*backoff);
    }

    fn on_idle(&self) {
        let on_idle = self.on_idle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(f) = on_idle.as_ref() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                crate::error::report_panic("SocketReactor::on_idle", payload);
            }
        }
    }

    fn on_shutdown(&self) {
        self.dispatch_to_all(EventKind::Shutdown);
    }

    fn observers_of(&self, fd: RawFd) -> ObserverList {
        self.lock_handlers().get(&fd).cloned().unwrap_or_default()
    }

    fn dispatch(&self, fd: RawFd, kind: EventKind) {
        let event = SocketEvent { fd, kind };
        for observer in self.observers_of(fd) {
            Self::deliver(&observer, &event);
        }
    }

    fn dispatch_to_all(&self, kind: EventKind) {
        // snapshot outside the lock so observers may (de)register freely
        let snapshot: Vec<(RawFd, ObserverList)> = self
            .lock_handlers()
            .iter()
            .map(|(fd, observers)| (*fd, observers.clone()))
            .collect();
        for (fd, observers) in snapshot {
            let event = SocketEvent { fd, kind };
            for observer in observers {
                Self::deliver(&observer, &event);
            }
        }
    }

    fn deliver(observer: &Arc<dyn SocketObserver>, event: &SocketEvent) {
        if !observer.accepts(event.kind) {
            return;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer.on_event(event))) {
            crate::error::report_panic("SocketReactor::dispatch", payload);
        }
    }
}
