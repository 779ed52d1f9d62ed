//! Bounded retries for device exchanges.

use std::fmt::Display;

use tracing::{debug, warn};

use crate::errors::{DecodeError, DeviceError};

/// Errors that know whether repeating the failed operation may help
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for DecodeError {
    fn is_retryable(&self) -> bool {
        DecodeError::is_retryable(self)
    }
}

impl Retryable for DeviceError {
    fn is_retryable(&self) -> bool {
        DeviceError::is_retryable(self)
    }
}

/// How many times an operation is attempted before its last error is surfaced.
///
/// Every attempt runs the whole operation again; nothing is resumed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: 3 }
    }
}

impl RetryPolicy {
    /// A policy that runs operations exactly once
    pub const NONE: RetryPolicy = RetryPolicy { max_attempts: 1 };

    /// Creates a policy with the given number of total attempts (at least one)
    pub const fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts. The closure receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, operation: &str, op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_with(operation, op, |e: &E| e.is_retryable())
    }

    /// Like [`RetryPolicy::run`], but with a caller supplied classification of errors.
    pub fn run_with<T, E, F, C>(&self, operation: &str, mut op: F, mut should_retry: C) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Result<T, E>,
        C: FnMut(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(v) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) if attempt < self.max_attempts && should_retry(&e) => {
                    warn!(operation, attempt, max_attempts = self.max_attempts, error = %e, "attempt failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    debug!(operation, attempt, error = %e, "giving up");
                    return Err(e);
                }
            }
        }
    }
}
