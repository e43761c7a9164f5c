use crate::impl_display_by_debug;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Default upper bound for the poll timeout and for the idle backoff sleep.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_millis(250);

/// Step by which the idle backoff sleep grows on every idle iteration.
pub const DEFAULT_BACKOFF_INCREMENT: Duration = Duration::from_millis(1);

/// Get the cpu count.
#[must_use]
pub fn cpu_count() -> usize {
    static CPU_COUNT: Lazy<usize> = Lazy::new(num_cpus::get);
    *CPU_COUNT
}

/// Enums used to describe the run-loop state.
///
/// The separate `StopRequested` state exists so that a `stop()` issued
/// before `run()` is not overwritten when the loop starts, and a `stop()`
/// issued during `run()` is observed on the next iteration at latest.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RunState {
    /// The loop has not been started yet.
    Idle = 0,
    /// The loop is running.
    Running = 1,
    /// `stop()` has been called and not yet been observed.
    StopRequested = 2,
    /// The loop has returned.
    Stopped = 3,
}

impl_display_by_debug!(RunState);

impl From<u8> for RunState {
    fn from(val: u8) -> Self {
        match val {
            0 => RunState::Idle,
            1 => RunState::Running,
            2 => RunState::StopRequested,
            _ => RunState::Stopped,
        }
    }
}

/// Internal encoding for a stop aimed at a loop that is currently inside
/// `run()`. Reported as [`RunState::StopRequested`], but only the running
/// loop itself may consume it; a re-entrant `run()` on another thread must
/// neither claim the stop nor start a second loop.
const STOP_WHILE_RUNNING: u8 = 4;

/// Atomic holder for [`RunState`], shared by the reactor and the proactor
/// run loops.
#[derive(Debug)]
pub struct LoopState(AtomicU8);

impl Default for LoopState {
    fn default() -> Self {
        Self(AtomicU8::new(RunState::Idle as u8))
    }
}

impl LoopState {
    /// Current state.
    pub fn get(&self) -> RunState {
        let raw = self.0.load(Ordering::Acquire);
        if raw == STOP_WHILE_RUNNING {
            RunState::StopRequested
        } else {
            RunState::from(raw)
        }
    }

    /// Attempt `Idle`/`Stopped` -> `Running`. Returns `false` when a stop
    /// request is already pending or another thread runs the loop.
    pub fn try_start(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == RunState::Running as u8
                || current == RunState::StopRequested as u8
                || current == STOP_WHILE_RUNNING
            {
                return false;
            }
            match self.0.compare_exchange(
                current,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(now) => current = now,
            }
        }
    }

    /// Request the loop to stop. Idempotent, callable from any thread and
    /// from any state.
    pub fn request_stop(&self) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let target = if current == RunState::Running as u8 || current == STOP_WHILE_RUNNING {
                STOP_WHILE_RUNNING
            } else {
                RunState::StopRequested as u8
            };
            match self
                .0
                .compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(now) => current = now,
            }
        }
    }

    /// `true` while a stop request has not yet been consumed.
    pub fn stop_requested(&self) -> bool {
        let raw = self.0.load(Ordering::Acquire);
        raw == RunState::StopRequested as u8 || raw == STOP_WHILE_RUNNING
    }

    /// Consume a stop request that was issued while no loop was running.
    /// Returns `false` when there is nothing to consume, including when the
    /// stop is aimed at a loop currently inside `run()` (that loop observes
    /// it through [`Self::stop_requested`] and retires it via
    /// [`Self::finish`]).
    pub fn try_consume_stop(&self) -> bool {
        self.0
            .compare_exchange(
                RunState::StopRequested as u8,
                RunState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark the loop as returned, consuming any stop request.
    pub fn finish(&self) {
        self.0.store(RunState::Stopped as u8, Ordering::Release);
    }

    /// `true` while some thread is inside `run()`.
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RunState::Running as u8
    }
}
