//! Exponential backoff for transient control-plane errors.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is zero-based.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// Run-level cancellation flag shared between the caller and the executor.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum RetryStop {
    Failed(ProviderError),
    Cancelled,
}

#[derive(Debug, Clone)]
pub(crate) struct Attempted<T> {
    pub result: Result<T, RetryStop>,
    pub attempts: u32,
}

/// Call `operation` until it succeeds, fails non-transiently, runs out of
/// attempts or `cancel` fires. `operation` receives the one-based attempt
/// number.
pub(crate) fn with_retry<T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut operation: impl FnMut(u32) -> Result<T, ProviderError>,
) -> Attempted<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if attempt > 0 && cancel.is_cancelled() {
            return Attempted {
                result: Err(RetryStop::Cancelled),
                attempts: attempt,
            };
        }
        attempt += 1;

        match operation(attempt) {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(error) if error.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    %error,
                    "transient failure, retrying"
                );
                if cancel.is_cancelled() {
                    return Attempted {
                        result: Err(RetryStop::Cancelled),
                        attempts: attempt,
                    };
                }
                thread::sleep(delay);
            }
            Err(error) => {
                return Attempted {
                    result: Err(RetryStop::Failed(error)),
                    attempts: attempt,
                };
            }
        }
    }
}
