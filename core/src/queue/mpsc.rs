//! Lock-free multi-producer single-consumer bounded queue.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    /// Ticket protocol: `sequence == pos` means free for the producer
    /// claiming position `pos`; `sequence == pos + 1` means written and
    /// readable; `sequence == pos + capacity` means consumed and free for
    /// the next lap.
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A fixed-capacity ring for any number of producer threads and exactly
/// one consumer thread.
///
/// Producers claim slots with compare-and-swap on the head index and
/// publish them through per-slot sequence numbers, so concurrent pushes
/// serialize against each other without ever blocking the consumer.
/// Capacity is rounded up to a power of two.
#[derive(Debug)]
pub struct MpscQueue<T> {
    mask: usize,
    slots: Box<[CachePadded<Slot<T>>]>,
    /// Written by producers through compare-and-swap.
    head: CachePadded<AtomicUsize>,
    /// Written by the consumer only.
    tail: CachePadded<AtomicUsize>,
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    /// Creates the queue with at least `capacity` slots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity)
            .map(|i| {
                CachePadded::new(Slot {
                    sequence: AtomicUsize::new(i),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            mask: capacity - 1,
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Attempt to push; returns `false` when the queue is full.
    /// Safe for any number of concurrent producers.
    pub fn try_push(&self, item: T) -> bool {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[head & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let diff = sequence as isize - head as isize;
            if diff == 0 {
                // free slot, try to claim it
                match self.head.compare_exchange_weak(
                    head,
                    head + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            _ = (*slot.value.get()).write(item);
                        }
                        slot.sequence.store(head + 1, Ordering::Release);
                        return true;
                    }
                    Err(now) => head = now,
                }
            } else if diff < 0 {
                // a full lap behind the consumer
                return false;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempt to pop; returns `None` when the queue is empty or the
    /// producer of the next slot has not finished writing yet.
    /// Must only be called from the single consumer thread.
    pub fn try_pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let slot = &self.slots[tail & self.mask];
        let sequence = slot.sequence.load(Ordering::Acquire);
        let diff = sequence as isize - (tail + 1) as isize;
        if diff == 0 {
            let item = unsafe { (*slot.value.get()).assume_init_read() };
            slot.sequence
                .store(tail + self.capacity(), Ordering::Release);
            self.tail.store(tail + 1, Ordering::Relaxed);
            return Some(item);
        }
        None
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

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}
