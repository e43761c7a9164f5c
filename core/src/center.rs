//! Asynchronous publish/subscribe notification delivery.
//!
//! Posting never blocks on the subscribers: notifications go through a
//! [`NotificationQueue`] and handlers run on the center's own dispatch
//! threads.

use crate::common::constants::cpu_count;
use crate::queue::NotificationQueue;
use std::any::Any;
use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// A named notification with an optional shared payload.
#[derive(Clone)]
pub struct Notification {
    name: Cow<'static, str>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notification")
            .field("name", &self.name)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

impl Notification {
    /// A notification with no payload.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            payload: None,
        }
    }

    /// A notification carrying `payload`.
    pub fn with_payload<T: Any + Send + Sync>(
        name: impl Into<Cow<'static, str>>,
        payload: T,
    ) -> Self {
        Self {
            name: name.into(),
            payload: Some(Arc::new(payload)),
        }
    }

    /// The notification name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The payload, downcast to `T`. `None` when there is no payload or
    /// the payload is of a different type.
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.payload.clone()?.downcast().ok()
    }
}

/// Decides whether an observer wants a notification, by name.
pub type Matcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Observer callback. Runs on one of the center's dispatch threads.
pub type Handler = Box<dyn Fn(&Notification) + Send + Sync>;

struct Observer {
    id: u64,
    matcher: Matcher,
    handler: Handler,
}

/// How many threads dispatch posted notifications.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DispatchMode {
    /// One dispatch thread; observers see notifications in posting order,
    /// and dropping the center delivers everything still queued.
    Ordered,
    /// A pool of threads (`0` means one per cpu). Higher throughput, but
    /// notifications dispatched by different threads may overlap, and
    /// dropping the center discards what is still queued.
    WorkerPool(usize),
}

struct Inner {
    observers: Mutex<Vec<Arc<Observer>>>,
    next_id: AtomicU64,
    queue: NotificationQueue<Arc<Notification>>,
    stopped: AtomicBool,
}

impl Inner {
    fn dispatch(&self, notification: &Arc<Notification>) {
        let snapshot: Vec<Arc<Observer>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|o| (o.matcher)(notification.name()))
            .cloned()
            .collect();
        for observer in snapshot {
            if let Err(payload) =
                catch_unwind(AssertUnwindSafe(|| (observer.handler)(notification)))
            {
                crate::error::report_panic("AsyncNotificationCenter::dispatch", payload);
            }
        }
    }
}

/// Decouples notification producers from their observers.
///
/// `post` enqueues and returns immediately; handler panics are contained
/// and reported through the error hook.
pub struct AsyncNotificationCenter {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    mode: DispatchMode,
}

impl std::fmt::Debug for AsyncNotificationCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncNotificationCenter")
            .field("mode", &self.mode)
            .field("backlog", &self.backlog())
            .finish_non_exhaustive()
    }
}

impl Default for AsyncNotificationCenter {
    fn default() -> Self {
        Self::new(DispatchMode::Ordered)
    }
}

impl AsyncNotificationCenter {
    /// Creates a center and starts its dispatch threads.
    pub fn new(mode: DispatchMode) -> Self {
        let inner = Arc::new(Inner {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue: NotificationQueue::default(),
            stopped: AtomicBool::new(false),
        });
        let threads = match mode {
            DispatchMode::Ordered => 1,
            DispatchMode::WorkerPool(0) => cpu_count(),
            DispatchMode::WorkerPool(n) => n,
        };
        let drain_on_stop = mode == DispatchMode::Ordered;
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let inner = inner.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("sockmux-notify-{index}"))
                .spawn(move || loop {
                    match inner.queue.wait_dequeue(None) {
                        Some(notification) => inner.dispatch(&notification),
                        None => {
                            if inner.stopped.load(Ordering::Acquire) {
                                if drain_on_stop {
                                    while let Some(notification) = inner.queue.dequeue() {
                                        inner.dispatch(&notification);
                                    }
                                }
                                break;
                            }
                        }
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => crate::error::report("AsyncNotificationCenter::new", &e.to_string()),
            }
        }
        Self {
            inner,
            handles: Mutex::new(handles),
            mode,
        }
    }

    /// Register an observer with an arbitrary name matcher. Returns the
    /// id to pass to [`remove_observer`](AsyncNotificationCenter::remove_observer).
    pub fn add_observer<M, H>(&self, matcher: M, handler: H) -> u64
    where
        M: Fn(&str) -> bool + Send + Sync + 'static,
        H: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(Observer {
                id,
                matcher: Box::new(matcher),
                handler: Box::new(handler),
            }));
        id
    }

    /// Register an observer for exactly one notification name.
    pub fn subscribe<H>(&self, name: impl Into<Cow<'static, str>>, handler: H) -> u64
    where
        H: Fn(&Notification) + Send + Sync + 'static,
    {
        let name = name.into();
        self.add_observer(move |n| n == name, handler)
    }

    /// Remove an observer. `false` if the id is unknown. Notifications
    /// already being dispatched may still reach the removed handler.
    pub fn remove_observer(&self, id: u64) -> bool {
        let mut observers = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|o| o.id != id);
        observers.len() != before
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue `notification` for delivery and return immediately.
    pub fn post(&self, notification: Notification) {
        self.inner.queue.enqueue(Arc::new(notification));
    }

    /// Number of notifications posted but not yet picked up by a dispatch
    /// thread.
    pub fn backlog(&self) -> usize {
        self.inner.queue.len()
    }

    /// The dispatch mode this center was built with.
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }
}

impl Drop for AsyncNotificationCenter {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.queue.wake_up_all();
        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if handle.join().is_err() {
                crate::error::report("AsyncNotificationCenter::drop", "dispatch thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn payload_downcast() {
        let n = Notification::with_payload("job-done", 42usize);
        assert_eq!("job-done", n.name());
        assert_eq!(42, *n.payload::<usize>().unwrap());
        assert!(n.payload::<String>().is_none());
        assert!(Notification::new("bare").payload::<usize>().is_none());
    }

    #[test]
    fn subscribe_filters_by_name() {
        let center = AsyncNotificationCenter::default();
        let (tx, rx) = mpsc::channel();
        _ = center.subscribe("wanted", move |n| tx.send(n.name().to_owned()).unwrap());
        center.post(Notification::new("ignored"));
        center.post(Notification::new("wanted"));
        assert_eq!(
            "wanted",
            rx.recv_timeout(Duration::from_secs(2)).unwrap()
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ordered_mode_preserves_posting_order() {
        let center = AsyncNotificationCenter::new(DispatchMode::Ordered);
        let (tx, rx) = mpsc::channel();
        _ = center.add_observer(
            |_| true,
            move |n| tx.send(*n.payload::<usize>().unwrap()).unwrap(),
        );
        for i in 0..50usize {
            center.post(Notification::with_payload("tick", i));
        }
        for i in 0..50usize {
            assert_eq!(i, rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
    }

    #[test]
    fn drop_drains_the_ordered_backlog() {
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let center = AsyncNotificationCenter::new(DispatchMode::Ordered);
            let counter = hits.clone();
            _ = center.add_observer(
                |_| true,
                move |_| {
                    _ = counter.fetch_add(1, Ordering::Relaxed);
                },
            );
            for _ in 0..20 {
                center.post(Notification::new("burst"));
            }
        }
        assert_eq!(20, hits.load(Ordering::Relaxed));
    }

    #[test]
    fn removed_observer_stops_receiving() {
        let center = AsyncNotificationCenter::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = center.add_observer(
            |_| true,
            move |_| {
                _ = counter.fetch_add(1, Ordering::Relaxed);
            },
        );
        assert_eq!(1, center.observer_count());
        assert!(center.remove_observer(id));
        assert!(!center.remove_observer(id));
        center.post(Notification::new("after-removal"));
        drop(center);
        assert_eq!(0, hits.load(Ordering::Relaxed));
    }

    #[test]
    fn worker_pool_delivers_everything() {
        let center = AsyncNotificationCenter::new(DispatchMode::WorkerPool(4));
        let (tx, rx) = mpsc::channel();
        _ = center.add_observer(
            |_| true,
            move |n| tx.send(*n.payload::<usize>().unwrap()).unwrap(),
        );
        for i in 0..100usize {
            center.post(Notification::with_payload("tick", i));
        }
        let mut seen: Vec<usize> = (0..100)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!((0..100).collect::<Vec<_>>(), seen);
    }

    #[test]
    fn panicking_handler_does_not_kill_the_dispatch_thread() {
        let center = AsyncNotificationCenter::default();
        let (tx, rx) = mpsc::channel();
        _ = center.add_observer(|n| n == "boom", |_| panic!("boom"));
        _ = center.subscribe("ok", move |_| tx.send(()).unwrap());
        center.post(Notification::new("boom"));
        center.post(Notification::new("ok"));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
}
