use std::{fmt, future::Future, time::Duration};

use tracing::debug;

use super::RetryPolicy;
use crate::status::ErrorCode;

/// Exponential backoff with full jitter
///
/// Each delay is drawn uniformly from `[0, current)`, after which `current`
/// grows by the multiplier until it reaches the max backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Start the backoff for a retry policy
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            current: policy.initial_backoff,
            max: policy.max_backoff,
            multiplier: policy.backoff_multiplier,
        }
    }

    /// The upper bound of the next delay
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Draw the next delay and grow the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.mul_f64(rand::random::<f64>());
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }
}

/// Run `attempt` until it succeeds, fails with a status that is not retryable,
/// or the policy runs out of attempts.
///
/// `attempt` gets the number of the attempt, starting at 1. Returns the result
/// of the last attempt.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, method: &str, mut attempt: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ErrorCode + fmt::Display,
{
    let mut backoff = Backoff::new(policy);
    let mut n = 1;
    loop {
        match attempt(n).await {
            Ok(res) => return Ok(res),
            Err(cause)
                if n < policy.max_attempts
                    && policy.retryable_status_codes.contains(&cause.code()) =>
            {
                let delay = backoff.next_delay();
                debug!(method, attempt = n, code = %cause.code(), ?delay, "retrying call: {cause}");
                tokio::time::sleep(delay).await;
                n += 1;
            }
            Err(cause) => return Err(cause),
        }
    }
}
