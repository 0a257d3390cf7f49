use std::fmt::Display;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backoff::BackoffPolicy;
use crate::error::Cancelled;

const CONNECT_ATTEMPTS: &str = "kafka_connect_attempts_total";

/// Keep calling `dial` until it succeeds, sleeping between failures according to
/// `policy`. The first retry waits `policy.initial_interval()`, each later one
/// doubles up to `policy.maximum_interval()`.
///
/// Returns `Err(Cancelled)` as soon as `cancel` fires, whether that happens
/// before the first attempt, during a dial, or during a wait.
pub async fn connect_with_retry<T, E, F, Fut>(
    cancel: &CancellationToken,
    policy: &BackoffPolicy,
    label: &str,
    mut dial: F,
) -> Result<T, Cancelled>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut interval = policy.initial_interval();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        attempt = attempt.saturating_add(1);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            result = dial() => result,
        };

        match result {
            Ok(connected) => {
                metrics::counter!(CONNECT_ATTEMPTS, "outcome" => "success").increment(1);
                if attempt > 1 {
                    info!(label, attempt, "connected after retrying");
                }
                return Ok(connected);
            }
            Err(e) => {
                metrics::counter!(CONNECT_ATTEMPTS, "outcome" => "failure").increment(1);
                error!(
                    label,
                    attempt,
                    error = %e,
                    retry_in_ms = interval.as_millis() as u64,
                    "failed to connect, retrying"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
        interval = policy.next(interval);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_returns_immediately_on_success() {
        let cancel = CancellationToken::new();
        let policy = BackoffPolicy::default();

        let value = connect_with_retry(&cancel, &policy, "test", || async {
            Ok::<_, String>(42)
        })
        .await;

        assert_eq!(value, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_exponential_waits() {
        let cancel = CancellationToken::new();
        let policy = BackoffPolicy::default();
        let calls: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let value = connect_with_retry(&cancel, &policy, "test", || {
            let calls = calls.clone();
            async move {
                let mut calls = calls.lock().unwrap();
                calls.push(Instant::now());
                if calls.len() < 4 {
                    Err("broker down")
                } else {
                    Ok("session")
                }
            }
        })
        .await;

        assert_eq!(value, Ok("session"));

        let offsets: Vec<u128> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|t| (*t - start).as_millis())
            .collect();
        // waits of 500ms, 1s, 2s between the four attempts
        assert_eq!(offsets, vec![0, 500, 1500, 3500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_are_capped_at_maximum() {
        let cancel = CancellationToken::new();
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(250));
        let calls: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        connect_with_retry(&cancel, &policy, "test", || {
            let calls = calls.clone();
            async move {
                let mut calls = calls.lock().unwrap();
                calls.push(Instant::now());
                if calls.len() < 5 {
                    Err("nope")
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        let offsets: Vec<u128> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|t| (*t - start).as_millis())
            .collect();
        assert_eq!(offsets, vec![0, 100, 300, 550, 800]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(Mutex::new(0));

        let result = connect_with_retry(&cancel, &BackoffPolicy::default(), "test", || {
            let calls = calls.clone();
            async move {
                *calls.lock().unwrap() += 1;
                Ok::<_, String>(())
            }
        })
        .await;

        assert_eq!(result, Err(Cancelled));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_wait() {
        let cancel = CancellationToken::new();
        let policy = BackoffPolicy::default();

        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            child.cancel();
        });

        let start = Instant::now();
        let result = connect_with_retry(&cancel, &policy, "test", || async {
            Err::<(), _>("unreachable broker")
        })
        .await;

        assert_eq!(result, Err(Cancelled));
        // cancelled during the second wait (500ms + part of 1s)
        assert_eq!((Instant::now() - start).as_millis(), 700);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_dial() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            child.cancel();
        });

        let result = connect_with_retry(&cancel, &BackoffPolicy::default(), "test", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, String>(())
        })
        .await;

        assert_eq!(result, Err(Cancelled));
    }
}
