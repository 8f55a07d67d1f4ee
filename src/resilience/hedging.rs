use std::{fmt, future::Future};

use futures_lite::StreamExt;
use futures_util::stream::FuturesUnordered;
use tracing::debug;

use super::HedgingPolicy;
use crate::status::ErrorCode;

/// Run copies of a call, starting a new copy every `hedging_delay` until one
/// of them succeeds or the policy runs out of attempts.
///
/// A copy that fails with a non-fatal status starts the next copy right away.
/// A copy that fails with any other status fails the whole call. Once the
/// outcome is decided, the remaining copies are dropped.
///
/// `attempt` gets the number of the copy, starting at 1.
pub async fn hedge<T, E, F, Fut>(policy: &HedgingPolicy, method: &str, mut attempt: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ErrorCode + fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut running = FuturesUnordered::new();
    running.push(attempt(1));
    let mut started = 1;
    // running is never empty at the top of the loop
    loop {
        tokio::select! {
            Some(res) = running.next() => match res {
                Ok(res) => {
                    debug!(method, started, "hedged call succeeded");
                    return Ok(res);
                }
                Err(cause) if policy.non_fatal_status_codes.contains(&cause.code()) => {
                    debug!(method, code = %cause.code(), "hedged copy failed: {cause}");
                    if started < max_attempts {
                        started += 1;
                        running.push(attempt(started));
                    } else if running.is_empty() {
                        return Err(cause);
                    }
                }
                Err(cause) => return Err(cause),
            },
            _ = tokio::time::sleep(policy.hedging_delay), if started < max_attempts => {
                started += 1;
                debug!(method, attempt = started, "starting hedged copy");
                running.push(attempt(started));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::status::{Code, Status};

    #[tokio::test(start_paused = true)]
    async fn fastest_copy_wins() {
        let policy = HedgingPolicy {
            hedging_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let res: Result<u32, Status> = hedge(&policy, "/a.A/B", |n| async move {
            // the first copy is slow, the second one is fast
            let delay = if n == 1 { 1000 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(n)
        })
        .await;
        assert_eq!(res, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn non_fatal_failures_start_next_copy() {
        let policy = HedgingPolicy {
            hedging_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let start = tokio::time::Instant::now();
        let res: Result<u32, Status> = hedge(&policy, "/a.A/B", |n| async move {
            if n < 3 {
                Err(Status::unavailable("down"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(res, Ok(3));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_ends_call() {
        let res: Result<u32, Status> = hedge(&HedgingPolicy::default(), "/a.A/B", |_| async {
            Err(Status::internal("broken"))
        })
        .await;
        assert_eq!(res.unwrap_err().code(), Code::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn all_copies_fail() {
        let res: Result<u32, Status> = hedge(&HedgingPolicy::default(), "/a.A/B", |n| async move {
            Err(Status::unavailable(format!("copy {n}")))
        })
        .await;
        let status = res.unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "copy 3");
    }
}
