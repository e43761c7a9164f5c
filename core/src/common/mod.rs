use std::time::Duration;

/// Interruptible condvar-based sleeping.
pub mod blocker;

pub(crate) mod macros;

/// Constants and the run-loop state machine.
pub mod constants;

/// Clamp a timeout to the number of milliseconds the OS multiplexing
/// call accepts, rounding up so a non-zero timeout never becomes a
/// busy-spinning zero.
#[must_use]
pub fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if ms == 0 && d > Duration::ZERO {
                ms = 1;
            }
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_conversion() {
        assert_eq!(-1, timeout_millis(None));
        assert_eq!(0, timeout_millis(Some(Duration::ZERO)));
        assert_eq!(1, timeout_millis(Some(Duration::from_micros(100))));
        assert_eq!(250, timeout_millis(Some(Duration::from_millis(250))));
        assert_eq!(i32::MAX, timeout_millis(Some(Duration::from_secs(u64::MAX))));
    }
}
