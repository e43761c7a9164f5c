use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A bounded sleep that another thread may cut short.
///
/// A `notify()` that arrives while nobody is blocked is remembered and
/// consumed by the next `block()` call, so a wakeup issued just before the
/// sleeper arrives is never lost.
#[derive(Debug, Default)]
pub struct CondvarBlocker {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl CondvarBlocker {
    /// Block the current thread for at most `dur`, or until `notify()`.
    pub fn block(&self, dur: Duration) {
        let mut signaled = self
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*signaled {
            let (guard, _timeout) = self
                .cond
                .wait_timeout(signaled, dur)
                .unwrap_or_else(PoisonError::into_inner);
            signaled = guard;
        }
        *signaled = false;
    }

    /// Wake the blocked thread, or pre-empt the next `block()` call.
    pub fn notify(&self) {
        *self
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn notify_cuts_sleep_short() {
        let blocker = Arc::new(CondvarBlocker::default());
        let clone = blocker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            clone.notify();
        });
        let start = Instant::now();
        blocker.block(Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn notify_before_block_is_not_lost() {
        let blocker = CondvarBlocker::default();
        blocker.notify();
        let start = Instant::now();
        blocker.block(Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn block_times_out() {
        let blocker = CondvarBlocker::default();
        let start = Instant::now();
        blocker.block(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
