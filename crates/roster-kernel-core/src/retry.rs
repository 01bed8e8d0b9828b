//! Bounded exponential backoff for transient store failures.
//!
//! Only errors reporting `is_retryable()` are retried; constraint violations
//! and precondition failures are returned on the first attempt.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{KernelError, KernelResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 50, max_delay_ms: 2_000, multiplier: 2.0 }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn no_retry() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let scaled = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    ///
    /// # Errors
    /// Returns the last error produced by `op`.
    pub fn execute<T>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> KernelResult<T>,
    ) -> KernelResult<T> {
        let mut attempt = 0_u32;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient store failure, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// # Errors
    /// Returns `InvalidArgument` for a multiplier below one or an inverted
    /// delay range.
    pub fn validate(&self) -> KernelResult<()> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(KernelError::invalid("retry.multiplier", "must be >= 1.0"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(KernelError::invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        Ok(())
    }
}
