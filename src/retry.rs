//! Generic retry-with-backoff executor.
//!
//! [`RetryExecutor::execute`] runs one async operation, retrying failures with
//! exponential backoff until `max_retries` retries have been spent. The
//! executor owns a single live cancellation handle for its backoff waits;
//! [`RetryExecutor::reset`] fires it, failing the in-flight call with
//! [`RetryError::Cancelled`], and returns the observable state to idle.
//!
//! Every failure is retried the same way. The executor does not try to tell
//! transient errors from permanent ones.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Called as `on_retry(next_attempt, &error)` before each backoff wait
pub type RetryCallback = Arc<dyn Fn(u32, &dyn fmt::Display) + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single wait
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each wait
    pub backoff_multiplier: f64,
    /// Scale each wait by a random factor in [0.5, 1.5]
    pub use_jitter: bool,
    pub on_retry: Option<RetryCallback>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            use_jitter: false,
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("use_jitter", &self.use_jitter)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryOptions {
    pub fn with_on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &dyn fmt::Display) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// `min(delay * backoff_multiplier, max_delay)`
    pub fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The actual wait for a given backoff delay
    fn wait_for(&self, delay: Duration) -> Duration {
        if !self.use_jitter {
            return delay;
        }

        let jitter_factor = 0.5 + rand::random::<f64>();
        Duration::try_from_secs_f64(delay.as_secs_f64() * jitter_factor)
            .unwrap_or(delay)
            .min(self.max_delay)
    }
}

/// Observable state of the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// True while waiting for or running a retry
    pub is_retrying: bool,
    /// Zero-based attempt number of the current or last failed attempt
    pub attempt: u32,
    /// Rendered message of the most recent failure
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The executor was reset while the call was in flight
    #[error("Operation cancelled")]
    Cancelled,
    /// Every attempt failed; carries the final error
    #[error("Operation failed after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: E,
    },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The final operation error, if attempts ran out
    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { last_error, .. } => Some(last_error),
        }
    }
}

pub struct RetryExecutor {
    options: RetryOptions,
    state: Arc<Mutex<RetryState>>,
    cancel: Mutex<CancellationToken>,
}

impl RetryExecutor {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            state: Arc::new(Mutex::new(RetryState::default())),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Snapshot of the observable retry state
    pub fn state(&self) -> RetryState {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Abort any in-flight call and return to idle.
    ///
    /// The pending backoff wait is interrupted and the call fails with
    /// [`RetryError::Cancelled`]. Later calls use a fresh handle.
    pub fn reset(&self) {
        let previous = {
            let mut guard = match self.cancel.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        previous.cancel();
        self.set_state(RetryState::default());
        tracing::debug!("Retry executor reset");
    }

    /// Run `operation`, retrying failures with exponential backoff
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let token = self.current_token();
        let mut attempt: u32 = 0;
        let mut delay = self.options.initial_delay;

        loop {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let result = operation().await;

            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(attempt, "Operation succeeded after retry");
                    }
                    self.set_state(RetryState::default());
                    return Ok(value);
                }
                Err(error) => error,
            };

            let message = error.to_string();

            if attempt >= self.options.max_retries {
                tracing::warn!(
                    attempts = attempt + 1,
                    error = %message,
                    "Max retry attempts reached"
                );
                self.set_state(RetryState {
                    is_retrying: false,
                    attempt,
                    last_error: Some(message),
                });
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last_error: error,
                });
            }

            self.set_state(RetryState {
                is_retrying: true,
                attempt,
                last_error: Some(message.clone()),
            });

            if let Some(on_retry) = &self.options.on_retry {
                on_retry(attempt + 1, &error);
            }

            let wait = self.options.wait_for(delay);
            tracing::info!(
                attempt = attempt + 1,
                delay_ms = wait.as_millis() as u64,
                error = %message,
                "Operation failed, retrying"
            );

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(attempt = attempt + 1, "Retry wait cancelled");
                    return Err(RetryError::Cancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }

            delay = self.options.next_delay(delay);
            attempt += 1;
        }
    }

    fn current_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, state: RetryState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            use_jitter: false,
            on_retry: None,
        }
    }

    #[test]
    fn test_retry_options_default() {
        let options = RetryOptions::default();
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.initial_delay, Duration::from_secs(1));
        assert_eq!(options.max_delay, Duration::from_secs(30));
        assert_eq!(options.backoff_multiplier, 2.0);
        assert!(!options.use_jitter);
        assert!(options.on_retry.is_none());
    }

    #[test]
    fn test_next_delay_is_capped() {
        let options = RetryOptions {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            ..RetryOptions::default()
        };

        let first = options.next_delay(options.initial_delay);
        let second = options.next_delay(first);
        let third = options.next_delay(second);

        assert_eq!(first, Duration::from_millis(200));
        assert_eq!(second, Duration::from_millis(300));
        assert_eq!(third, Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let options = RetryOptions {
            use_jitter: true,
            max_delay: Duration::from_secs(60),
            ..RetryOptions::default()
        };

        for _ in 0..50 {
            let wait = options.wait_for(Duration::from_secs(4));
            assert!(wait >= Duration::from_secs(2), "wait {:?} too short", wait);
            assert!(wait <= Duration::from_secs(6), "wait {:?} too long", wait);
        }
    }

    #[test]
    fn test_options_debug_hides_callback() {
        let options = RetryOptions::default().with_on_retry(|_, _| {});
        let debug_output = format!("{:?}", options);
        assert!(debug_output.contains("max_retries"));
        assert!(debug_output.contains("on_retry: true"));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let retried = Arc::new(AtomicU32::new(0));
        let counter = retried.clone();
        let executor = RetryExecutor::new(fast_options(3).with_on_retry(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let result: Result<u32, RetryError<String>> = executor.execute(|| async { Ok(7) }).await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(retried.load(Ordering::SeqCst), 0);
        assert!(executor.state().is_idle());
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry_attempts = Arc::new(Mutex::new(Vec::new()));

        let seen = retry_attempts.clone();
        let executor = RetryExecutor::new(fast_options(2).with_on_retry(move |attempt, error| {
            seen.lock().unwrap().push((attempt, error.to_string()));
        }));

        let result = executor
            .execute(|| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(format!("failure {}", n + 1))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let retry_attempts = retry_attempts.lock().unwrap();
        assert_eq!(
            *retry_attempts,
            vec![(1, "failure 1".to_string()), (2, "failure 2".to_string())]
        );

        let state = executor.state();
        assert!(!state.is_retrying);
        assert_eq!(state.attempt, 0);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_always_failing_surfaces_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fast_options(1));

        let result: Result<(), _> = executor
            .execute(|| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err(format!("boom {}", n + 1))
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, "boom 2");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let state = executor.state();
        assert!(!state.is_retrying);
        assert_eq!(state.last_error.as_deref(), Some("boom 2"));
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fast_options(0));

        let result: Result<(), _> = executor
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("nope")
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_grow_exponentially() {
        let executor = RetryExecutor::new(RetryOptions {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            use_jitter: false,
            on_retry: None,
        });

        let start = tokio::time::Instant::now();
        let result: Result<(), _> = executor.execute(|| async { Err("down") }).await;
        let elapsed = start.elapsed();

        assert!(result.is_err());
        // 1s + 2s + 4s
        assert!(elapsed >= Duration::from_secs(7), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(8), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_reset_cancels_pending_wait() {
        let executor = Arc::new(RetryExecutor::new(RetryOptions {
            max_retries: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            use_jitter: false,
            on_retry: None,
        }));
        let calls = Arc::new(AtomicU32::new(0));

        let running = executor.clone();
        let counter = calls.clone();
        let handle = tokio::spawn(async move {
            running
                .execute(|| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("offline")
                    }
                })
                .await
        });

        for _ in 0..200 {
            if executor.state().is_retrying {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(executor.state().is_retrying);
        assert_eq!(executor.state().last_error.as_deref(), Some("offline"));

        executor.reset();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancelled call should finish promptly")
            .unwrap();

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(executor.state().is_idle());
    }

    #[tokio::test]
    async fn test_executor_usable_after_reset() {
        let executor = RetryExecutor::new(fast_options(1));
        executor.reset();

        let result: Result<&str, RetryError<String>> = executor.execute(|| async { Ok("fresh") }).await;
        assert_eq!(result.unwrap(), "fresh");
    }

    #[test]
    fn test_retry_error_display() {
        let cancelled: RetryError<String> = RetryError::Cancelled;
        assert_eq!(cancelled.to_string(), "Operation cancelled");

        let exhausted = RetryError::Exhausted {
            attempts: 3,
            last_error: "timeout".to_string(),
        };
        assert_eq!(exhausted.to_string(), "Operation failed after 3 attempts: timeout");
        assert_eq!(exhausted.into_last_error().as_deref(), Some("timeout"));
    }

    #[test]
    fn test_exhausted_error_exposes_source() {
        use crate::remote::RemoteError;
        use std::error::Error as _;

        let exhausted = RetryError::Exhausted {
            attempts: 2,
            last_error: RemoteError::Rejected("busy".to_string()),
        };
        let source = exhausted.source().expect("exhausted error should carry its cause");
        assert_eq!(source.to_string(), "Remote operation failed: busy");
        assert!(RetryError::<RemoteError>::Cancelled.source().is_none());
    }
}
