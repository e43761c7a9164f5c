//! Lock-free single-producer single-consumer bounded queue.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A fixed-capacity ring for exactly one producer and one consumer thread.
///
/// The head and tail indices live on separate cache lines, and each side
/// keeps a cached copy of the other side's index so the hot path usually
/// touches a single atomic. Capacity is rounded up to a power of two.
///
/// Exactly one thread may call [`try_push`], exactly one may call
/// [`try_pop`]; `len`, `is_empty` and `capacity` are safe from any thread.
///
/// [`try_push`]: SpscQueue::try_push
/// [`try_pop`]: SpscQueue::try_pop
#[derive(Debug)]
pub struct SpscQueue<T> {
    mask: usize,
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Written by the producer only.
    head: CachePadded<AtomicUsize>,
    /// Written by the consumer only.
    tail: CachePadded<AtomicUsize>,
    /// Producer's cached copy of `tail`.
    cached_tail: CachePadded<AtomicUsize>,
    /// Consumer's cached copy of `head`.
    cached_head: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Creates the queue with at least `capacity` slots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            mask: capacity - 1,
            buffer,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            cached_tail: CachePadded::new(AtomicUsize::new(0)),
            cached_head: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Attempt to push; returns `false` when the queue is full.
    pub fn try_push(&self, item: T) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let mut tail = self.cached_tail.load(Ordering::Relaxed);
        if head - tail == self.capacity() {
            tail = self.tail.load(Ordering::Acquire);
            self.cached_tail.store(tail, Ordering::Relaxed);
            if head - tail == self.capacity() {
                return false;
            }
        }
        unsafe {
            _ = (*self.buffer[head & self.mask].get()).write(item);
        }
        self.head.store(head + 1, Ordering::Release);
        true
    }

    /// Attempt to pop; returns `None` when the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let mut head = self.cached_head.load(Ordering::Relaxed);
        if head == tail {
            head = self.head.load(Ordering::Acquire);
            self.cached_head.store(head, Ordering::Relaxed);
            if head == tail {
                return None;
            }
        }
        let item = unsafe { (*self.buffer[tail & self.mask].get()).assume_init_read() };
        self.tail.store(tail + 1, Ordering::Release);
        Some(item)
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// `true` when the queue appears empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fixed capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let mut tail = self.tail.load(Ordering::Relaxed);
        while tail != head {
            unsafe {
                (*self.buffer[tail & self.mask].get()).assume_init_drop();
            }
            tail += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn capacity_rounds_up() {
        let queue: SpscQueue<u8> = SpscQueue::with_capacity(5);
        assert_eq!(8, queue.capacity());
        let queue: SpscQueue<u8> = SpscQueue::with_capacity(0);
        assert_eq!(1, queue.capacity());
    }

    #[test]
    fn full_and_empty() {
        let queue = SpscQueue::with_capacity(4);
        assert!(queue.is_empty());
        assert_eq!(None, queue.try_pop());
        for i in 0..4 {
            assert!(queue.try_push(i));
        }
        assert!(!queue.try_push(99));
        assert_eq!(4, queue.len());
        assert_eq!(Some(0), queue.try_pop());
        assert!(queue.try_push(99));
        for expected in [1, 2, 3, 99] {
            assert_eq!(Some(expected), queue.try_pop());
        }
        assert_eq!(None, queue.try_pop());
    }

    #[test]
    fn cross_thread_transfer_preserves_order() {
        const COUNT: usize = 100_000;
        let queue = Arc::new(SpscQueue::with_capacity(64));
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..COUNT {
                while !producer.try_push(i) {
                    std::hint::spin_loop();
                }
            }
        });
        let mut expected = 0;
        while expected < COUNT {
            if let Some(value) = queue.try_pop() {
                assert_eq!(expected, value);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        handle.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn drops_remaining_items() {
        let queue = SpscQueue::with_capacity(8);
        let item = Arc::new(());
        for _ in 0..4 {
            assert!(queue.try_push(item.clone()));
        }
        drop(queue);
        assert_eq!(1, Arc::strong_count(&item));
    }
}
