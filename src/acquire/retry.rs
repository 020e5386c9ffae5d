//! Bounded retry with a fixed delay between attempts.

use std::fmt;
use std::time::Duration;

use crate::cancel::CancelToken;

/// How many times a download is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryFailure<E> {
    Cancelled,
    Exhausted { attempts: u32, last: E },
}

impl RetryPolicy {
    /// Run `op` until it succeeds, the attempts are used up, or `cancel` trips.
    ///
    /// `op` receives the 1-based attempt number. Cancellation is checked
    /// before every attempt and during the delay.
    pub fn run<T, E, F>(&self, cancel: &CancelToken, mut op: F) -> Result<T, RetryFailure<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryFailure::Cancelled);
            }
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(_) if cancel.is_cancelled() => return Err(RetryFailure::Cancelled),
                Err(e) if attempt >= attempts => {
                    return Err(RetryFailure::Exhausted { attempts, last: e });
                }
                Err(e) => {
                    log::warn!(
                        "attempt {attempt}/{attempts} failed: {e}; retrying in {}s",
                        self.delay.as_secs()
                    );
                    if cancel.sleep(self.delay).is_err() {
                        return Err(RetryFailure::Cancelled);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::ZERO,
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = quick(3).run(&CancelToken::new(), |attempt| {
            calls += 1;
            if attempt < 3 {
                Err("flaky")
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_all_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = quick(2).run(&CancelToken::new(), |_| {
            calls += 1;
            Err("down")
        });
        match result {
            Err(RetryFailure::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last, "down");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls, 2);
    }

    #[test]
    fn cancellation_stops_retrying() {
        let cancel = CancelToken::new();
        let mut calls = 0;
        let result: Result<(), _> = quick(5).run(&cancel, |_| {
            calls += 1;
            cancel.cancel();
            Err("interrupted")
        });
        assert!(matches!(result, Err(RetryFailure::Cancelled)));
        assert_eq!(calls, 1);
    }
}
