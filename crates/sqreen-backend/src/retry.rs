// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry controller guarding every backend call.
//!
//! Attempts are separated by an exponential backoff and bounded by a retry
//! period measured from the first attempt. The backoff sleep is the only place
//! the controller suspends on its own, and it is interrupted as soon as the
//! shared cancellation token fires. An attempt already in flight is not
//! interrupted: it is bounded by the HTTP client timeout.

use crate::errors::{self, ContextError};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential backoff: `delay(n) = clamp(min, max, min * rate^n)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Growth factor applied per attempt.
    pub rate: f64,
    pub min: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            rate: 2.0,
            min: Duration::from_millis(1),
            max: Duration::from_secs(30 * 60),
        }
    }
}

impl Backoff {
    /// Delay to wait after the failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        // Cap the exponent so powi() stays finite for any realistic rate.
        let exponent = attempt.min(1_000) as i32;
        let secs = self.min.as_secs_f64() * self.rate.powi(exponent);
        if secs.is_nan() || secs <= self.min.as_secs_f64() {
            return self.min;
        }
        if secs.is_infinite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).clamp(self.min, self.max)
    }
}

/// Bounds of one retried call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// No attempt starts this long or later after the first one.
    pub period: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    /// The operation failed with an error the classifier deems permanent.
    #[error(transparent)]
    Fatal(ContextError),
    /// Every attempt of the retry period failed. `error` is the last failure.
    #[error("{error}")]
    Exhausted { attempts: u32, error: ContextError },
    /// The shutdown signal fired before the call could complete.
    #[error("retry cancelled")]
    Cancelled,
}

impl RetryError {
    /// Cancellation is a shutdown, not a failure of the backend call.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, RetryError::Cancelled)
    }

    pub fn error(&self) -> Option<&ContextError> {
        match self {
            RetryError::Fatal(error) | RetryError::Exhausted { error, .. } => Some(error),
            RetryError::Cancelled => None,
        }
    }

    pub fn into_error(self) -> Option<ContextError> {
        match self {
            RetryError::Fatal(error) | RetryError::Exhausted { error, .. } => Some(error),
            RetryError::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    cancel_token: CancellationToken,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, cancel_token: CancellationToken) -> Self {
        Self {
            policy,
            cancel_token,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails permanently, the retry
    /// period elapses or the cancellation token fires.
    ///
    /// `is_retryable` decides whether a failure is worth another attempt.
    /// Fatal and exhausted errors carry the failed attempt number under the
    /// `attempt` key of their [`errors::info`] mapping.
    pub async fn run<T, F, Fut, C>(
        &self,
        mut operation: F,
        is_retryable: C,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ContextError>>,
        C: Fn(&ContextError) -> bool,
    {
        if self.cancel_token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let attempts = attempt.saturating_add(1);

            if !is_retryable(&error) {
                debug!(attempts, error = %error, "permanent failure, not retrying");
                let error = errors::extend_info(error, [("attempt", attempts.to_string())]);
                return Err(RetryError::Fatal(error));
            }
            if self.cancel_token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let delay = self.policy.backoff.delay(attempt);
            if started.elapsed().saturating_add(delay) >= self.policy.period {
                let error = errors::extend_info(error, [("attempt", attempts.to_string())]);
                let error = errors::wrap(error, format!("gave up after {attempts} attempts"));
                return Err(RetryError::Exhausted { attempts, error });
            }

            debug!(
                attempt = attempts,
                next_delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    debug!(attempts, "retry interrupted by shutdown");
                    return Err(RetryError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt = attempts;
        }
    }
}
