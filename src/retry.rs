use crate::error::{EngineError, EngineResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Bounded-attempt exponential backoff wrapped around a fallible async call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on each further failure.
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before the attempt following `failed_attempt` (1-based).
    pub fn delay_for_attempt(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(2_u32.pow(exponent))
            .min(self.max_delay);
        if !self.jitter {
            return delay;
        }
        let delay_ms = delay.as_millis() as u64;
        let jitter_range = (delay_ms as f64 * 0.25) as u64;
        let jitter = fastrand::u64(0..=jitter_range * 2);
        let final_delay = delay_ms.saturating_sub(jitter_range).saturating_add(jitter);
        Duration::from_millis(final_delay).min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with an error `retryable`
    /// rejects, or `max_attempts` is exhausted. Exhaustion yields
    /// `FetchFailed` carrying the last cause.
    pub async fn run<T, F, Fut, P>(
        &self,
        context: &str,
        cancel: Option<&CancelSignal>,
        retryable: P,
        mut operation: F,
    ) -> EngineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
        P: Fn(&EngineError) -> bool,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_some_and(CancelSignal::is_cancelled) {
                return Err(EngineError::Cancelled);
            }

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !retryable(&err) => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    log::error!(
                        "Giving up on {} after {} attempt(s): {}",
                        context,
                        attempt,
                        err
                    );
                    return Err(EngineError::FetchFailed {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.delay_for_attempt(attempt);
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {:.1}s.",
                        attempt,
                        self.max_attempts,
                        context,
                        err,
                        delay.as_secs_f64()
                    );
                    sleep_or_cancel(delay, cancel).await?;
                    attempt += 1;
                }
            }
        }
    }
}

/// Sleeps for `delay`, returning early with `Cancelled` if the signal fires.
pub async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancelSignal>) -> EngineResult<()> {
    match cancel {
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
        Some(signal) => {
            tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(()),
                _ = signal.cancelled() => Err(EngineError::Cancelled),
            }
        }
    }
}

/// Receiving side of a decision-cycle cancellation.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling: never fires.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(10))
    }

    #[test]
    fn delay_doubles_from_floor_and_is_capped() {
        let policy = RetryPolicy::new(6, Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn jittered_delay_stays_within_cap() {
        let policy = policy().with_jitter(true);
        for attempt in 1..6 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay <= Duration::from_secs(10));
            assert!(delay >= Duration::from_millis(1500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_two_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = policy()
            .run("bars SPY", None, EngineError::is_retryable, |_| {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call < 3 {
                        Err(EngineError::Transient(format!("503 on call {}", call)))
                    } else {
                        Ok(call)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wraps_last_cause() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<()> = policy()
            .run("bars SPY", None, EngineError::is_retryable, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(EngineError::Transient(format!("timeout #{}", attempt))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(EngineError::FetchFailed { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "transient failure: timeout #3");
            }
            other => panic!("expected FetchFailed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<()> = policy()
            .run("bars ???", None, EngineError::is_retryable, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Permanent("unknown ticker".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(EngineError::Permanent(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_backoff_sleep() {
        let (handle, signal) = cancel_pair();
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let policy = policy();
        let run = policy.run("bars SPY", Some(&signal), EngineError::is_retryable, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(EngineError::Transient("reset".into())) }
        });
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            handle.cancel();
        };
        let (result, _) = tokio::join!(run, cancel);

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
