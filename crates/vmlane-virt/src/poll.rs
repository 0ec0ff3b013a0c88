//! Bounded polling.
//!
//! Waiting for a VM address and for the installer web UI share the same
//! shape: try an operation at a fixed interval until it yields a value, the
//! attempt or time budget runs out, cancellation is requested, or the
//! operation fails in a way that is not worth retrying.

use std::thread;
use std::time::{Duration, Instant};

/// Budget of a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollLimit {
    /// Give up after this many attempts.
    Attempts(u32),
    /// Give up once this much time has elapsed.
    Deadline(Duration),
}

/// Interval and budget of a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub limit: PollLimit,
}

impl PollPolicy {
    pub fn attempts(interval: Duration, attempts: u32) -> Self {
        Self {
            interval,
            limit: PollLimit::Attempts(attempts),
        }
    }

    pub fn deadline(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            limit: PollLimit::Deadline(deadline),
        }
    }
}

/// Why a polling loop ended without a value.
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts in {elapsed:?}")]
    Exhausted { attempts: u32, elapsed: Duration },

    #[error("{0}")]
    Fatal(E),
}

/// Poll `op` until it returns a value.
///
/// Every iteration checks the budget and `is_cancelled`, sleeps for the
/// interval, then calls `op`. `Ok(None)` and errors accepted by `retryable`
/// continue the loop; any other error ends it as [`PollError::Fatal`].
pub fn poll_until<T, E>(
    policy: &PollPolicy,
    is_cancelled: impl Fn() -> bool,
    mut op: impl FnMut() -> Result<Option<T>, E>,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, PollError<E>> {
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        let exhausted = match policy.limit {
            PollLimit::Attempts(max) => attempts >= max,
            PollLimit::Deadline(deadline) => start.elapsed() >= deadline,
        };
        if exhausted {
            return Err(PollError::Exhausted {
                attempts,
                elapsed: start.elapsed(),
            });
        }
        if is_cancelled() {
            return Err(PollError::Cancelled);
        }

        thread::sleep(policy.interval);
        attempts += 1;

        match op() {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(PollError::Fatal(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const TICK: Duration = Duration::from_millis(1);

    #[test]
    fn test_returns_first_value() {
        let calls = Cell::new(0);
        let value: Result<u32, PollError<()>> = poll_until(
            &PollPolicy::attempts(TICK, 10),
            || false,
            || {
                calls.set(calls.get() + 1);
                Ok(if calls.get() == 3 { Some(42) } else { None })
            },
            |_| true,
        );
        assert_eq!(value.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_attempts_exhausted() {
        let calls = Cell::new(0);
        let result: Result<(), PollError<()>> = poll_until(
            &PollPolicy::attempts(TICK, 5),
            || false,
            || {
                calls.set(calls.get() + 1);
                Ok(None)
            },
            |_| true,
        );
        assert!(matches!(result, Err(PollError::Exhausted { attempts: 5, .. })));
        assert_eq!(calls.get(), 5);
    }

    #[test]
    fn test_retryable_errors_until_deadline() {
        let result: Result<(), PollError<&str>> = poll_until(
            &PollPolicy::deadline(Duration::from_millis(5), Duration::from_millis(40)),
            || false,
            || Err("refused"),
            |e| *e == "refused",
        );
        match result {
            Err(PollError::Exhausted { attempts, elapsed }) => {
                assert!(attempts >= 1);
                assert!(elapsed >= Duration::from_millis(40));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_fatal_error_stops_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), PollError<&str>> = poll_until(
            &PollPolicy::attempts(TICK, 100),
            || false,
            || {
                calls.set(calls.get() + 1);
                Err("bad status")
            },
            |e| *e == "refused",
        );
        assert!(matches!(result, Err(PollError::Fatal("bad status"))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_cancelled_before_first_attempt() {
        let calls = Cell::new(0);
        let result: Result<(), PollError<()>> = poll_until(
            &PollPolicy::attempts(TICK, 10),
            || true,
            || {
                calls.set(calls.get() + 1);
                Ok(None)
            },
            |_| true,
        );
        assert!(matches!(result, Err(PollError::Cancelled)));
        assert_eq!(calls.get(), 0);
    }
}
