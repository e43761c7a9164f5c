//! Deferred-work scheduling shared by the reactor and the proactor.
//!
//! Each entry is either one-shot (an expiry instant; runs once when due,
//! then is removed) or permanent (no expiry; re-armed on every scan until
//! explicitly removed).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A deferred function. `Arc` so permanent entries can be invoked without
/// being taken out of the list.
pub type Work = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Clone)]
struct Entry {
    id: u64,
    work: Work,
    /// `None` marks a permanent entry.
    expiry: Option<Instant>,
}

#[derive(Default)]
struct WorkList {
    entries: Vec<Entry>,
    next_id: u64,
}

/// Executes scheduled and permanent workload.
///
/// Handlers may add or remove work from inside their own invocation; a
/// scan that observes such a mutation restarts from the beginning of the
/// list, skipping entries it already invoked.
#[derive(Default)]
pub struct Worker {
    list: Mutex<WorkList>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("entries", &self.lock().entries.len())
            .finish()
    }
}

impl Worker {
    fn lock(&self) -> MutexGuard<'_, WorkList> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append work. `delay: None` schedules a permanent entry; `Some(d)`
    /// a one-shot entry expiring `d` from now.
    pub fn add_work(&self, work: Work, delay: Option<Duration>) {
        let mut list = self.lock();
        let id = list.next_id;
        list.next_id += 1;
        let expiry = delay.map(|d| Instant::now() + d);
        list.entries.push(Entry { id, work, expiry });
    }

    /// Remove all work, scheduled and permanent.
    pub fn remove_work(&self) {
        self.lock().entries.clear();
    }

    /// Number of one-shot entries.
    pub fn scheduled_work(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.expiry.is_some())
            .count()
    }

    /// Number of permanent entries.
    pub fn permanent_work(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.expiry.is_none())
            .count()
    }

    /// Remove up to `count` one-shot entries from the front of the list;
    /// `None` removes all of them. Returns the number removed.
    pub fn remove_scheduled_work(&self, count: Option<usize>) -> usize {
        self.remove_matching(count, |e| e.expiry.is_some())
    }

    /// Remove up to `count` permanent entries from the front of the list;
    /// `None` removes all of them. Returns the number removed.
    pub fn remove_permanent_work(&self, count: Option<usize>) -> usize {
        self.remove_matching(count, |e| e.expiry.is_none())
    }

    fn remove_matching(&self, count: Option<usize>, matches: impl Fn(&Entry) -> bool) -> usize {
        let mut list = self.lock();
        let mut left = count.unwrap_or(usize::MAX);
        let before = list.entries.len();
        list.entries.retain(|e| {
            if left > 0 && matches(e) {
                left -= 1;
                false
            } else {
                true
            }
        });
        before - list.entries.len()
    }

    /// Run due work. An expired one-shot entry is removed, then invoked
    /// once; a permanent entry is invoked without removal on every scan
    /// unless `expired_only` is set. With `handle_one`, at most one entry
    /// runs. Returns the number of invocations.
    pub fn do_work(&self, handle_one: bool, expired_only: bool) -> usize {
        let mut invoked: Vec<u64> = Vec::new();
        let mut handled = 0;
        loop {
            // the lock is re-taken on every pass, so a handler that
            // mutated the list only ever invalidates indices we are
            // about to recompute
            let work = {
                let mut list = self.lock();
                let now = Instant::now();
                let mut candidate = None;
                for (index, entry) in list.entries.iter().enumerate() {
                    if invoked.contains(&entry.id) {
                        continue;
                    }
                    match entry.expiry {
                        Some(expiry) if now >= expiry => {
                            candidate = Some((index, true));
                            break;
                        }
                        None if !expired_only => {
                            candidate = Some((index, false));
                            break;
                        }
                        _ => {}
                    }
                }
                match candidate {
                    None => return handled,
                    Some((index, one_shot)) => {
                        invoked.push(list.entries[index].id);
                        if one_shot {
                            list.entries.remove(index).work
                        } else {
                            list.entries[index].work.clone()
                        }
                    }
                }
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| work())) {
                crate::error::report_panic("Worker::do_work", payload);
            }
            handled += 1;
            if handle_one {
                return handled;
            }
        }
    }

    /// Block until one entry, scheduled or permanent, has been executed.
    pub fn run_one(&self) -> usize {
        loop {
            if self.do_work(true, false) > 0 {
                return 1;
            }
            std::thread::yield_now();
        }
    }
}
