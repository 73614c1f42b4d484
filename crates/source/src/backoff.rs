use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use kyomei_common::error::{KyomeiError, Result};

/// Consecutive transient failures tolerated before escalating to a fatal
/// source error.
pub const MAX_CONSECUTIVE_TRANSIENT: u32 = 50;

/// Exponential backoff with full jitter: each delay is drawn uniformly from
/// `[0, min(cap, base * 2^attempt)]`.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with(Duration::from_millis(500), Duration::from_secs(30))
    }

    pub fn with(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The next delay to sleep. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);

        let ceiling = self
            .base
            .saturating_mul(1u32 << exp)
            .min(self.cap)
            .as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry an operation with unbounded attempts and full-jitter backoff.
///
/// Transient errors log, count, and retry; `MAX_CONSECUTIVE_TRANSIENT` in a
/// row escalates to `SourceFatal`. Non-transient errors and cancellation
/// return immediately.
pub async fn retry<T, F, Fut>(
    operation: &str,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new();

    loop {
        if cancel.is_cancelled() {
            return Err(KyomeiError::Cancelled);
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                if backoff.attempts() + 1 >= MAX_CONSECUTIVE_TRANSIENT {
                    return Err(KyomeiError::SourceFatal(format!(
                        "{operation}: {} consecutive transient failures, last: {err}",
                        backoff.attempts() + 1
                    )));
                }

                let delay = backoff.next_delay();
                tracing::warn!(
                    operation,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(KyomeiError::Cancelled),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_stay_within_envelope() {
        let mut backoff = Backoff::new();
        for attempt in 0..40 {
            let ceiling = Duration::from_millis(500)
                .saturating_mul(1u32 << attempt.min(16))
                .min(Duration::from_secs(30));
            let delay = backoff.next_delay();
            assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::new();
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempts(), 10);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = retry("fetch", &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(KyomeiError::SourceTransient("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_escalates_after_fifty_transients() {
        let cancel = CancellationToken::new();
        let result: Result<()> = retry("fetch", &cancel, || async {
            Err(KyomeiError::SourceTransient("down".into()))
        })
        .await;

        assert!(matches!(result, Err(KyomeiError::SourceFatal(_))));
    }

    #[tokio::test]
    async fn retry_stops_on_fatal() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<()> = retry("fetch", &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(KyomeiError::SourceFatal("gap".into())) }
        })
        .await;

        assert!(matches!(result, Err(KyomeiError::SourceFatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
