//! Bounded retry for hardware operations.
//
// Serial writes/reads and camera focus writes fail transiently on this
// instrument (USB hiccups, driver property writes that are rejected once).
// They are retried locally and silently up to a fixed bound; only exhaustion
// is surfaced to the caller.

use std::time::Duration;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Policy with `retries` extra attempts and no backoff.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            backoff_delay: Duration::ZERO,
        }
    }

    /// Total number of attempts, first one included.
    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Runs `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. `on_failure` runs after every
    /// failed attempt except the last one and is where callers reset buffers
    /// before trying again. Returns the last error on exhaustion.
    ///
    /// Blocks the calling thread during backoff; call it from a blocking context.
    pub fn run_blocking<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        mut on_failure: impl FnMut(u32, &E),
    ) -> Result<T, E> {
        let attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    on_failure(attempt, &err);
                    if !self.backoff_delay.is_zero() {
                        std::thread::sleep(self.backoff_delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
