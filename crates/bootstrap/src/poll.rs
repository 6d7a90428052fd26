//! Fixed-interval retry bounded by an overall deadline.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Time between the starts of consecutive attempts. Constant; there is no backoff growth.
    pub interval: Duration,
    /// Give up after the first failed attempt at or beyond this much elapsed time.
    pub deadline: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// The deadline passed without a successful attempt.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_error: E,
}

/// Call `attempt` once per tick until it succeeds or the deadline has elapsed.
///
/// The deadline is only checked between attempts: an attempt in flight is never cut short,
/// and the loop never gives up before the full deadline has passed.
pub async fn poll_until<T, E, F, Fut>(what: &str, policy: PollPolicy, mut attempt: F) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = Instant::now();
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0;
    loop {
        ticker.tick().await;
        attempts += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(last_error) => {
                let elapsed = start.elapsed();
                if elapsed >= policy.deadline {
                    return Err(Exhausted {
                        attempts,
                        elapsed,
                        last_error,
                    });
                }
                tracing::debug!(attempt = attempts, "{what} not ready: {last_error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_on_fixed_interval() {
        let start = Instant::now();
        let mut seen = Vec::new();
        let value = poll_until("thing", PollPolicy::new(Duration::from_secs(1), Duration::from_secs(60)), || {
            seen.push(start.elapsed().as_secs());
            let n = seen.len();
            async move { if n < 4 { Err("not yet") } else { Ok(n) } }
        })
        .await
        .unwrap();
        assert_eq!(value, 4);
        assert_eq!(seen, [0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_only_after_deadline() {
        let start = Instant::now();
        let err = poll_until("thing", PollPolicy::new(Duration::from_secs(1), Duration::from_secs(10)), || async {
            Err::<(), _>("refused")
        })
        .await
        .unwrap_err();
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(err.attempts, 11);
        assert_eq!(err.last_error, "refused");
    }
}
