//! Bounded retry for device calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::error::{ControlError, ControlResult};

/// How often and how patiently a transient failure is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause before the second attempt; doubles on every further attempt.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

#[derive(Error, Debug)]
pub enum RetryError {
    /// A transient failure persisted through every attempt.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: ControlError,
    },

    /// The failure cannot go away by repeating the call.
    #[error("{operation} failed: {source}")]
    Rejected {
        operation: String,
        source: ControlError,
    },
}

impl RetryPolicy {
    /// Call `f` until it succeeds, fails permanently, or attempts run out.
    pub fn run<T>(
        &self,
        operation: &str,
        mut f: impl FnMut() -> ControlResult<T>,
    ) -> Result<T, RetryError> {
        let attempts = self.max_attempts.max(1);
        let mut backoff = Duration::from_millis(self.backoff_ms);

        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => {
                    return Err(RetryError::Rejected {
                        operation: operation.to_string(),
                        source: e,
                    })
                }
                Err(e) if attempt >= attempts => {
                    return Err(RetryError::Exhausted {
                        operation: operation.to_string(),
                        attempts,
                        last: e,
                    })
                }
                Err(e) => {
                    warn!("{operation}: attempt {attempt}/{attempts} failed: {e}");
                    std::thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }
}
