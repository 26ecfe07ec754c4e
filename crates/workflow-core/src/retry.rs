//! Bounded geometric-backoff retry for scheduler-path CoordStore calls
//! (spec §7: "Scheduler-path operations wrap transient work in bounded
//! retry ... on exhaustion they emit a Warning and continue").

use std::future::Future;
use std::time::Duration;

/// Call `f` up to `attempts` times, sleeping `base * attempt` between
/// tries. Returns the last error if every attempt fails.
pub async fn with_backoff<F, Fut, T, E>(attempts: u32, base: Duration, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(err);
                }
                tokio::time::sleep(base * attempt).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retrying_when_first_attempt_works() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_up_to_the_attempt_limit_then_surfaces_the_error() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom") }
        })
        .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_on_a_later_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
    }
}
