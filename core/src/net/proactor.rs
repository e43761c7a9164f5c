//! Completion-based socket I/O: the loop thread performs the reads and
//! writes, and hands finished operations to a dedicated completion thread.

use crate::common::blocker::CondvarBlocker;
use crate::common::constants::{
    LoopState, RunState, DEFAULT_BACKOFF_INCREMENT, DEFAULT_MAX_TIMEOUT,
};
use crate::net::poll_set::PollSet;
use crate::net::selector::Interest;
use crate::net::sys::{self, SocketKind};
use crate::net::worker::{Work, Worker};
use crate::queue::NotificationQueue;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Outcome of one completed I/O operation.
///
/// The buffer submitted with the operation always comes back here, even on
/// failure, so the caller can reuse or inspect it. For receives it is
/// truncated to the bytes actually read.
#[derive(Debug)]
pub struct IoEvent {
    /// Bytes transferred, or the error that ended the operation.
    pub result: io::Result<usize>,
    /// The submitted buffer.
    pub buffer: Vec<u8>,
    /// Sender address, for datagram receives.
    pub peer: Option<SocketAddr>,
}

/// Completion callback. Runs on the proactor's completion thread.
pub type IoCallback = Box<dyn FnOnce(IoEvent) + Send + 'static>;

struct IoHandler {
    buffer: Vec<u8>,
    peer: Option<SocketAddr>,
    on_completion: Option<IoCallback>,
}

impl std::fmt::Debug for IoHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandler")
            .field("buffer", &self.buffer.len())
            .field("peer", &self.peer)
            .field("callback", &self.on_completion.is_some())
            .finish()
    }
}

struct Completion {
    callback: IoCallback,
    event: IoEvent,
}

/// The completion thread: drains a queue of finished operations and runs
/// their callbacks, decoupled from the I/O loop thread.
struct IoCompletion {
    queue: Arc<NotificationQueue<Completion>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl IoCompletion {
    fn new() -> Self {
        Self {
            queue: Arc::new(NotificationQueue::default()),
            handle: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn enqueue(&self, callback: IoCallback, event: IoEvent) {
        self.queue.enqueue(Completion { callback, event });
    }

    /// Idempotent; restarts the thread after a previous `stop`/`join`.
    fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }
        self.stopped.store(false, Ordering::Release);
        self.queue.rearm();
        let queue = self.queue.clone();
        let stopped = self.stopped.clone();
        let spawned = std::thread::Builder::new()
            .name(String::from("sockmux-io-completion"))
            .spawn(move || loop {
                match queue.wait_dequeue(None) {
                    Some(completion) => {
                        let Completion { callback, event } = completion;
                        if let Err(payload) =
                            catch_unwind(AssertUnwindSafe(move || callback(event)))
                        {
                            crate::error::report_panic("IoCompletion", payload);
                        }
                    }
                    // a cancelled wait with the stop flag still clear is a
                    // spurious wakeup, not a shutdown
                    None => {
                        if stopped.load(Ordering::Acquire) {
                            break;
                        }
                    }
                }
            });
        match spawned {
            Ok(h) => *handle = Some(h),
            Err(e) => crate::error::report("IoCompletion::start", &e.to_string()),
        }
    }

    /// The stop flag is raised before the broadcast so the thread cannot
    /// observe the cancellation first and loop again.
    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.queue.wake_up_all();
    }

    fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                crate::error::report("IoCompletion::join", "completion thread panicked");
            }
        }
    }
}

type HandlerMap = HashMap<RawFd, VecDeque<IoHandler>>;

/// Proactor-style socket I/O loop.
///
/// `run()` polls the registered sockets and performs the submitted reads
/// and writes itself; each operation's callback then runs on the
/// completion thread. Handlers for the same socket and direction complete
/// in submission order.
pub struct SocketProactor {
    state: LoopState,
    /// Adaptive poll timeout in milliseconds; zero while the loop is busy,
    /// grows toward `max_timeout` while idle.
    timeout_ms: AtomicU64,
    max_timeout: Duration,
    poll_set: PollSet,
    read_handlers: Mutex<HandlerMap>,
    write_handlers: Mutex<HandlerMap>,
    completion: IoCompletion,
    worker: Option<Worker>,
    blocker: CondvarBlocker,
}

impl std::fmt::Debug for SocketProactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketProactor")
            .field("state", &self.state.get())
            .field("sockets", &self.poll_set.count())
            .field("worker", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl SocketProactor {
    /// Creates a proactor with a work scheduler and the default maximum
    /// poll timeout.
    pub fn new() -> io::Result<Self> {
        Self::with_timeout(DEFAULT_MAX_TIMEOUT, true)
    }

    /// Creates a proactor. With `worker: false` the instance only performs
    /// socket I/O and rejects the work-scheduling calls.
    pub fn with_timeout(max_timeout: Duration, worker: bool) -> io::Result<Self> {
        Ok(Self {
            state: LoopState::default(),
            timeout_ms: AtomicU64::new(0),
            max_timeout,
            poll_set: PollSet::new()?,
            read_handlers: Mutex::new(HashMap::new()),
            write_handlers: Mutex::new(HashMap::new()),
            completion: IoCompletion::new(),
            worker: worker.then(Worker::default),
            blocker: CondvarBlocker::default(),
        })
    }

    fn lock<'a>(map: &'a Mutex<HandlerMap>) -> MutexGuard<'a, HandlerMap> {
        map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_kind(fd: RawFd, expected: SocketKind) -> io::Result<()> {
        let kind = sys::socket_kind(fd)?;
        if kind == expected {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("expected a {expected:?} socket, got {kind:?}"),
            ))
        }
    }

    /// Submit a receive on a stream socket. `buffer` is the destination;
    /// it is resized to the pending byte count when the socket becomes
    /// readable. Pass `None` as callback for fire-and-forget.
    pub fn add_receive(
        &self,
        socket: RawFd,
        buffer: Vec<u8>,
        on_completion: Option<IoCallback>,
    ) -> io::Result<()> {
        Self::require_kind(socket, SocketKind::Stream)?;
        self.push_handler(socket, Interest::READ, IoHandler {
            buffer,
            peer: None,
            on_completion,
        })
    }

    /// Submit a send of `buffer` on a stream socket.
    pub fn add_send(
        &self,
        socket: RawFd,
        buffer: Vec<u8>,
        on_completion: Option<IoCallback>,
    ) -> io::Result<()> {
        Self::require_kind(socket, SocketKind::Stream)?;
        if buffer.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot send an empty buffer",
            ));
        }
        self.push_handler(socket, Interest::WRITE, IoHandler {
            buffer,
            peer: None,
            on_completion,
        })
    }

    /// Submit a datagram receive; the sender address arrives in the
    /// completion's `peer` field.
    pub fn add_receive_from(
        &self,
        socket: RawFd,
        buffer: Vec<u8>,
        on_completion: Option<IoCallback>,
    ) -> io::Result<()> {
        Self::require_kind(socket, SocketKind::Datagram)?;
        self.push_handler(socket, Interest::READ, IoHandler {
            buffer,
            peer: None,
            on_completion,
        })
    }

    /// Submit a datagram send of `buffer` to `peer`.
    pub fn add_send_to(
        &self,
        socket: RawFd,
        buffer: Vec<u8>,
        peer: SocketAddr,
        on_completion: Option<IoCallback>,
    ) -> io::Result<()> {
        Self::require_kind(socket, SocketKind::Datagram)?;
        if buffer.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot send an empty buffer",
            ));
        }
        self.push_handler(socket, Interest::WRITE, IoHandler {
            buffer,
            peer: Some(peer),
            on_completion,
        })
    }

    fn push_handler(&self, fd: RawFd, direction: Interest, handler: IoHandler) -> io::Result<()> {
        let map = if direction.contains(Interest::READ) {
            &self.read_handlers
        } else {
            &self.write_handlers
        };
        Self::lock(map).entry(fd).or_default().push_back(handler);
        self.poll_set.add(fd, direction | Interest::ERROR)?;
        self.wake_up();
        Ok(())
    }

    /// Watch `socket` for `interest` without submitting an operation,
    /// OR-merging into any existing mask.
    pub fn add_socket(&self, socket: RawFd, interest: Interest) -> io::Result<()> {
        self.poll_set.add(socket, interest)
    }

    /// Replace the watched interest of `socket`.
    pub fn update_socket(&self, socket: RawFd, interest: Interest) -> io::Result<()> {
        self.poll_set.update(socket, interest)
    }

    /// Stop watching `socket` and drop its pending operations. Their
    /// callbacks never run; the buffers are freed.
    pub fn remove_socket(&self, socket: RawFd) -> io::Result<()> {
        _ = Self::lock(&self.read_handlers).remove(&socket);
        _ = Self::lock(&self.write_handlers).remove(&socket);
        self.poll_set.remove(socket)
    }

    /// `true` while any submitted operation is pending.
    pub fn has_socket_handlers(&self) -> bool {
        Self::lock(&self.read_handlers)
            .values()
            .any(|q| !q.is_empty())
            || Self::lock(&self.write_handlers)
                .values()
                .any(|q| !q.is_empty())
    }

    /// One poll-and-dispatch iteration: waits up to the adaptive timeout,
    /// performs the ready operations and queues their completions.
    /// Returns the number of operations completed.
    pub fn poll(&self) -> io::Result<usize> {
        let timeout = Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed));
        let fired = self.poll_set.poll(Some(timeout))?;
        let mut handled = 0;
        for (fd, mask) in fired {
            // drain data and EOF first so a close with buffered bytes
            // still completes its receives
            if mask.contains(Interest::READ) {
                handled += self.receive(fd);
            }
            if mask.contains(Interest::WRITE) {
                handled += self.send(fd);
            }
            if mask.contains(Interest::ERROR) {
                handled += self.fail_all(fd);
                continue;
            }
            self.sync_interest(fd);
        }
        Ok(handled)
    }

    fn complete(&self, handler: IoHandler, result: io::Result<usize>, peer: Option<SocketAddr>) {
        // no callback means fire-and-forget; drop the buffer here
        if let Some(callback) = handler.on_completion {
            self.completion.enqueue(callback, IoEvent {
                result,
                buffer: handler.buffer,
                peer,
            });
        }
    }

    fn receive(&self, fd: RawFd) -> usize {
        let mut completed = 0;
        loop {
            let mut handlers = Self::lock(&self.read_handlers);
            let Some(queue) = handlers.get_mut(&fd) else {
                break;
            };
            let Some(mut handler) = queue.pop_front() else {
                break;
            };
            drop(handlers);
            let outcome = sys::available(fd).and_then(|available| {
                handler.buffer.resize(available.max(1), 0);
                match sys::socket_kind(fd)? {
                    SocketKind::Datagram => {
                        let (n, peer) = sys::recv_from(fd, &mut handler.buffer)?;
                        Ok((n, peer))
                    }
                    _ => sys::recv(fd, &mut handler.buffer).map(|n| (n, None)),
                }
            });
            match outcome {
                Ok((n, peer)) => {
                    handler.buffer.truncate(n);
                    self.complete(handler, Ok(n), peer);
                    completed += 1;
                    if n == 0 {
                        // peer closed; later receives would spin on EOF
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // readiness was consumed by an earlier handler
                    Self::lock(&self.read_handlers)
                        .entry(fd)
                        .or_default()
                        .push_front(handler);
                    break;
                }
                Err(e) => {
                    self.complete(handler, Err(e), None);
                    completed += 1;
                }
            }
        }
        completed
    }

    fn send(&self, fd: RawFd) -> usize {
        let mut completed = 0;
        loop {
            let mut handlers = Self::lock(&self.write_handlers);
            let Some(queue) = handlers.get_mut(&fd) else {
                break;
            };
            let Some(handler) = queue.pop_front() else {
                break;
            };
            drop(handlers);
            let outcome = match handler.peer {
                Some(peer) => sys::send_to(fd, &handler.buffer, &peer),
                None => sys::send(fd, &handler.buffer),
            };
            match outcome {
                Ok(n) => {
                    self.complete(handler, Ok(n), None);
                    completed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    Self::lock(&self.write_handlers)
                        .entry(fd)
                        .or_default()
                        .push_front(handler);
                    break;
                }
                Err(e) => {
                    self.complete(handler, Err(e), None);
                    completed += 1;
                }
            }
        }
        completed
    }

    /// Resolve every pending operation of a socket in an error state with
    /// its `SO_ERROR`, then drop the socket from the set.
    fn fail_all(&self, fd: RawFd) -> usize {
        let error = match sys::socket_error(fd) {
            Ok(Some(e)) => e,
            Ok(None) => io::Error::new(io::ErrorKind::Other, "socket error condition"),
            Err(e) => e,
        };
        let code = error.raw_os_error();
        let kind = error.kind();
        let message = error.to_string();
        let clone_error = || match code {
            Some(code) => io::Error::from_raw_os_error(code),
            None => io::Error::new(kind, message.clone()),
        };
        let mut completed = 0;
        let reads = Self::lock(&self.read_handlers).remove(&fd).unwrap_or_default();
        let writes = Self::lock(&self.write_handlers).remove(&fd).unwrap_or_default();
        for handler in reads.into_iter().chain(writes) {
            self.complete(handler, Err(clone_error()), None);
            completed += 1;
        }
        if let Err(e) = self.poll_set.remove(fd) {
            crate::error::report("SocketProactor::fail_all", &e.to_string());
        }
        completed
    }

    /// Shrink a socket's watched interest to its remaining pending
    /// directions, dropping it from the set when none remain.
    ///
    /// Both handler maps stay locked across the poll-set call; a
    /// submission landing between the recompute and the update could
    /// otherwise leave its fd out of the set with a handler pending.
    fn sync_interest(&self, fd: RawFd) {
        let reads = Self::lock(&self.read_handlers);
        let writes = Self::lock(&self.write_handlers);
        let mut interest = Interest::NONE;
        if reads.get(&fd).is_some_and(|q| !q.is_empty()) {
            interest |= Interest::READ;
        }
        if writes.get(&fd).is_some_and(|q| !q.is_empty()) {
            interest |= Interest::WRITE;
        }
        let outcome = if interest.is_empty() {
            self.poll_set.remove(fd)
        } else {
            self.poll_set.update(fd, interest | Interest::ERROR)
        };
        drop(writes);
        drop(reads);
        if let Err(e) = outcome {
            crate::error::report("SocketProactor::sync_interest", &e.to_string());
        }
    }

    /// Run the I/O loop on the calling thread until [`stop`]
    /// (SocketProactor::stop). Starts the completion thread.
    pub fn run(&self) {
        if !self.state.try_start() {
            // consume only a stop issued while no loop was running
            _ = self.state.try_consume_stop();
            return;
        }
        self.completion.start();
        tracing::info!("proactor loop started");
        while !self.state.stop_requested() {
            let handled = match self.poll() {
                Ok(handled) => handled,
                Err(e) => {
                    crate::error::report("SocketProactor::run", &e.to_string());
                    0
                }
            };
            if self.state.stop_requested() {
                break;
            }
            // pending submissions get priority over deferred work
            let worked = match &self.worker {
                Some(worker) if self.has_socket_handlers() && handled == 0 => {
                    worker.do_work(false, true)
                }
                Some(worker) => worker.do_work(false, false),
                None => 0,
            };
            if handled > 0 || worked > 0 {
                self.timeout_ms.store(0, Ordering::Relaxed);
            } else {
                let current = self.timeout_ms.load(Ordering::Relaxed);
                let next = (current + DEFAULT_BACKOFF_INCREMENT.as_millis() as u64)
                    .min(self.max_timeout.as_millis() as u64);
                self.timeout_ms.store(next, Ordering::Relaxed);
                if self.poll_set.is_empty() {
                    self.blocker.block(Duration::from_millis(next));
                }
            }
        }
        self.state.finish();
        tracing::info!("proactor loop stopped");
    }

    /// Request the loop to stop. Idempotent; callable from any thread.
    /// The completion thread keeps draining until [`wait`]
    /// (SocketProactor::wait) or drop.
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

    /// Current run-loop state.
    pub fn state(&self) -> RunState {
        self.state.get()
    }

    /// Stop the completion thread and block until it has exited. Queued
    /// completions enqueued before the stop may be dropped unrun.
    pub fn wait(&self) {
        self.completion.stop();
        self.completion.join();
    }

    fn require_worker(&self) -> io::Result<&Worker> {
        self.worker.as_ref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "this proactor was built without a work scheduler",
            )
        })
    }

    /// Schedule deferred work; see [`Worker::add_work`]. Fails on a
    /// proactor built without a worker.
    pub fn add_work(&self, work: Work, delay: Option<Duration>) -> io::Result<()> {
        self.require_worker()?.add_work(work, delay);
        self.wake_up();
        Ok(())
    }

    /// Remove all deferred work.
    pub fn remove_work(&self) -> io::Result<()> {
        self.require_worker()?.remove_work();
        Ok(())
    }

    /// Number of pending one-shot work entries.
    pub fn scheduled_work(&self) -> io::Result<usize> {
        Ok(self.require_worker()?.scheduled_work())
    }

    /// Number of permanent work entries.
    pub fn permanent_work(&self) -> io::Result<usize> {
        Ok(self.require_worker()?.permanent_work())
    }

    /// Remove up to `count` one-shot work entries; `None` removes all.
    pub fn remove_scheduled_work(&self, count: Option<usize>) -> io::Result<usize> {
        Ok(self.require_worker()?.remove_scheduled_work(count))
    }

    /// Remove up to `count` permanent work entries; `None` removes all.
    pub fn remove_permanent_work(&self, count: Option<usize>) -> io::Result<usize> {
        Ok(self.require_worker()?.remove_permanent_work(count))
    }

    /// Block until one work entry has run.
    pub fn run_one(&self) -> io::Result<usize> {
        Ok(self.require_worker()?.run_one())
    }
}

impl Drop for SocketProactor {
    fn drop(&mut self) {
        self.stop();
        self.completion.stop();
        self.completion.join();
    }
}
