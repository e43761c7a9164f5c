//! Thread-safe hand-off of payloads between threads.
//!
//! [`NotificationQueue`] is the general-purpose variant: unbounded, FIFO
//! with an urgent-priority exception, blocking wait with timeout and a
//! broadcast cancel that is never lost. The [`spsc`] and [`mpsc`] ring
//! buffers trade those semantics for fixed capacity and lock freedom.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub mod mpsc;
pub mod spsc;

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    /// Broadcast-cancel latch. While set, every waiter returns `None`
    /// immediately; the next enqueue re-arms the queue.
    woken: bool,
}

/// An ordered queue with blocking dequeue and broadcast cancellation.
///
/// `enqueue` appends, `enqueue_urgent` prepends; FIFO order holds for all
/// non-urgent entries, and an urgent entry always comes out before any
/// older non-urgent one.
#[derive(Debug)]
pub struct NotificationQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> Default for NotificationQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                woken: false,
            }),
            available: Condvar::new(),
        }
    }
}

impl<T> NotificationQueue<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item. Re-arms a queue cancelled by [`wake_up_all`].
    ///
    /// [`wake_up_all`]: NotificationQueue::wake_up_all
    pub fn enqueue(&self, item: T) {
        let mut inner = self.lock();
        inner.items.push_back(item);
        inner.woken = false;
        drop(inner);
        self.available.notify_one();
    }

    /// Prepend an item, ahead of every queued non-urgent entry.
    pub fn enqueue_urgent(&self, item: T) {
        let mut inner = self.lock();
        inner.items.push_front(item);
        inner.woken = false;
        drop(inner);
        self.available.notify_one();
    }

    /// Dequeue without blocking. Returns `None` on an empty queue.
    pub fn dequeue(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Dequeue, blocking until an item arrives, `timeout` elapses
    /// (`None` means wait forever), or [`wake_up_all`] cancels the wait.
    /// Returns `None` on timeout and on cancellation.
    ///
    /// [`wake_up_all`]: NotificationQueue::wake_up_all
    pub fn wait_dequeue(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        loop {
            if inner.woken {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            inner = match deadline {
                None => self
                    .available
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.available
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Cancel every blocked waiter and every waiter yet to arrive; all of
    /// them return `None`. The cancellation is sticky until the next
    /// enqueue, so a wake-all issued with zero waiting threads is not lost.
    pub fn wake_up_all(&self) {
        self.lock().woken = true;
        self.available.notify_all();
    }

    /// Explicitly re-arm a cancelled queue without enqueueing.
    pub fn rearm(&self) {
        self.lock().woken = false;
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// `true` when no items are queued.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let queue = NotificationQueue::default();
        for i in 0..100 {
            queue.enqueue(i);
        }
        assert_eq!(100, queue.len());
        for i in 0..100 {
            assert_eq!(Some(i), queue.dequeue());
        }
        assert!(queue.is_empty());
        assert_eq!(None, queue.dequeue());
    }

    #[test]
    fn urgent_jumps_the_queue() {
        let queue = NotificationQueue::default();
        queue.enqueue("a");
        queue.enqueue("b");
        queue.enqueue_urgent("c");
        assert_eq!(Some("c"), queue.dequeue());
        assert_eq!(Some("a"), queue.dequeue());
        assert_eq!(Some("b"), queue.dequeue());
    }

    #[test]
    fn wait_dequeue_times_out() {
        let queue: NotificationQueue<u8> = NotificationQueue::default();
        let start = Instant::now();
        assert_eq!(None, queue.wait_dequeue(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn wait_dequeue_sees_concurrent_enqueue() {
        let queue = Arc::new(NotificationQueue::default());
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.enqueue(42);
        });
        assert_eq!(Some(42), queue.wait_dequeue(None));
        handle.join().unwrap();
    }

    #[test]
    fn wake_all_with_zero_waiters_is_not_lost() {
        let queue: Arc<NotificationQueue<u8>> = Arc::new(NotificationQueue::default());
        queue.wake_up_all();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let waiter = queue.clone();
            handles.push(std::thread::spawn(move || waiter.wait_dequeue(None)));
        }
        for handle in handles {
            // all waiters return promptly instead of hanging
            assert_eq!(None, handle.join().unwrap());
        }
    }

    #[test]
    fn enqueue_rearms_after_wake_all() {
        let queue = NotificationQueue::default();
        queue.wake_up_all();
        assert_eq!(None, queue.wait_dequeue(Some(Duration::from_millis(1))));
        queue.enqueue(7);
        assert_eq!(Some(7), queue.wait_dequeue(Some(Duration::from_millis(1))));
    }
}
