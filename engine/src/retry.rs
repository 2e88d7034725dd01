//! Retry logic with exponential backoff.
//!
//! [`retry_with_backoff`] never fails in the `?` sense: it always resolves to
//! a [`RetryOutcome`] carrying either the value or the last error, plus how
//! many attempts were made and how long they took.
//!
//! # Example
//!
//! ```
//! use closet_engine::{retry_with_backoff, RetryOptions};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let options = RetryOptions::default()
//!     .with_max_retries(2)
//!     .with_initial_delay(Duration::from_millis(1))
//!     .without_jitter();
//!
//! let outcome = retry_with_backoff(|| async { Ok::<_, String>(7) }, &options).await;
//! assert!(outcome.is_success());
//! assert_eq!(outcome.attempts, 1);
//! # }
//! ```

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Retries after the first attempt (total attempts = `max_retries + 1`)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Factor applied to the delay after each retry. Negative or non-finite
    /// values are treated as `1.0`.
    pub backoff_multiplier: f64,
    /// Randomize each delay by a factor in `[0.5, 1.5)`
    pub jitter: bool,
    /// Per-attempt time limit
    pub timeout: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            timeout: None,
        }
    }
}

impl RetryOptions {
    /// Quick retry for sync requests: 2 retries, 10 s per attempt.
    #[must_use]
    pub fn sync() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            timeout: Some(Duration::from_secs(10)),
            ..Self::default()
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn multiplier(&self) -> f64 {
        if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 0.0 {
            self.backoff_multiplier
        } else {
            1.0
        }
    }

    /// The delay actually slept for a given base delay.
    fn sleep_for(&self, base: Duration) -> Duration {
        if self.jitter {
            scale(base, rand::thread_rng().gen_range(0.5..1.5), self.max_delay)
        } else {
            base.min(self.max_delay)
        }
    }

    /// The base delay for the retry after one that waited `delay`.
    fn next_delay(&self, delay: Duration) -> Duration {
        scale(delay, self.multiplier(), self.max_delay)
    }
}

/// `delay * factor`, capped at `cap`. Never panics on overflow.
fn scale(delay: Duration, factor: f64, cap: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
        .unwrap_or(cap)
        .min(cap)
}

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttemptError<E> {
    /// The attempt exceeded [`RetryOptions::timeout`] and was dropped.
    #[error("operation exceeded timeout of {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The operation returned an error.
    #[error("{0}")]
    Failed(E),
}

impl<E> AttemptError<E> {
    /// The operation's own error, if this was not a timeout.
    pub fn into_inner(self) -> Option<E> {
        match self {
            AttemptError::Failed(err) => Some(err),
            AttemptError::Timeout(_) => None,
        }
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The value, or the error from the last attempt
    pub result: Result<T, AttemptError<E>>,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Wall time from the first attempt to the outcome
    pub total_time: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, AttemptError<E>> {
        self.result
    }
}

/// Default retryability check on an error message.
///
/// Matches (case-insensitive) `timeout`, `network`, `connection`,
/// `econnrefused`, `enotfound`, the status `429`, or any `5xx` status.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    const PATTERNS: [&str; 6] = [
        "timeout",
        "network",
        "connection",
        "econnrefused",
        "enotfound",
        "429",
    ];
    if PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }

    let bytes = lower.as_bytes();
    bytes
        .windows(3)
        .any(|w| w[0] == b'5' && w[1].is_ascii_digit() && w[2].is_ascii_digit())
}

/// Default retryability check on any displayable error.
pub fn is_retryable<E: Display>(error: &E) -> bool {
    is_retryable_message(&error.to_string())
}

/// Race `future` against a timer.
///
/// If the timer wins, the future is dropped, which cancels whatever it was
/// doing, and [`AttemptError::Timeout`] is returned.
pub async fn with_timeout<F, T, E>(future: F, limit: Duration) -> Result<T, AttemptError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result.map_err(AttemptError::Failed),
        Err(_) => Err(AttemptError::Timeout(limit)),
    }
}

/// Retry `operation` with exponential backoff using the default classifier.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    options: &RetryOptions,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_with_backoff_if(operation, options, is_retryable).await
}

/// Retry `operation` with exponential backoff while `should_retry` says so.
///
/// Attempt `n` (0-based) that fails is retried only if `n < max_retries` and
/// `should_retry(&error)`. Before retry `n + 1` the executor sleeps
/// `min(delay * jitter, max_delay)`, then multiplies `delay` by the backoff
/// multiplier.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    mut operation: F,
    options: &RetryOptions,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&AttemptError<E>) -> bool,
{
    let started = Instant::now();
    let mut delay = options.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = match options.timeout {
            Some(limit) => with_timeout(operation(), limit).await,
            None => operation().await.map_err(AttemptError::Failed),
        };

        let error = match result {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempts = attempt, "operation succeeded after retries");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    total_time: started.elapsed(),
                };
            }
            Err(error) => error,
        };

        let retries_used = attempt - 1;
        if retries_used >= options.max_retries || !should_retry(&error) {
            warn!(attempts = attempt, error = %error, "operation failed, giving up");
            return RetryOutcome {
                result: Err(error),
                attempts: attempt,
                total_time: started.elapsed(),
            };
        }

        let pause = options.sleep_for(delay);
        warn!(
            attempt,
            max_retries = options.max_retries,
            error = %error,
            "operation failed, retrying in {:?}",
            pause
        );
        sleep(pause).await;
        delay = options.next_delay(delay);
    }
}

/// Run `primary`; if it fails, report the error and run `fallback` instead.
pub async fn with_fallback<P, PFut, F, FFut, T, E, R>(
    primary: P,
    fallback: F,
    on_error: R,
) -> Result<T, E>
where
    P: FnOnce() -> PFut,
    PFut: Future<Output = Result<T, E>>,
    F: FnOnce() -> FFut,
    FFut: Future<Output = Result<T, E>>,
    R: FnOnce(&E),
{
    match primary().await {
        Ok(value) => Ok(value),
        Err(err) => {
            on_error(&err);
            fallback().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryOptions {
        RetryOptions::default()
            .with_initial_delay(Duration::from_millis(10))
            .without_jitter()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try() {
        let outcome = retry_with_backoff(|| async { Ok::<_, String>(42) }, &fast()).await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.into_result().unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_retryable_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("network error {}", n))
                    } else {
                        Ok(n)
                    }
                }
            },
            &fast(),
        )
        .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: RetryOutcome<(), String> = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("connection refused".to_string())
                }
            },
            &fast().with_max_retries(2),
        )
        .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcome.result.unwrap_err(),
            AttemptError::Failed("connection refused".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: RetryOutcome<(), String> = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("validation failed: name required".to_string())
                }
            },
            &fast(),
        )
        .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier_overrides_default() {
        let outcome: RetryOutcome<(), String> = retry_with_backoff_if(
            || async { Err("anything".to_string()) },
            &fast().with_max_retries(4),
            |_| true,
        )
        .await;

        assert_eq!(outcome.attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn delays_grow_and_cap() {
        let options = RetryOptions::default()
            .with_max_retries(4)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300))
            .without_jitter();

        let outcome: RetryOutcome<(), String> =
            retry_with_backoff(|| async { Err("timeout".to_string()) }, &options).await;

        // 100 + 200 + 300 + 300
        assert_eq!(outcome.attempts, 5);
        assert!(outcome.total_time >= Duration::from_millis(900));
        assert!(outcome.total_time < Duration::from_millis(910));
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_stays_within_bounds() {
        let options = RetryOptions::default()
            .with_max_retries(1)
            .with_initial_delay(Duration::from_millis(1000))
            .with_max_delay(Duration::from_secs(60));

        let outcome: RetryOutcome<(), String> =
            retry_with_backoff(|| async { Err("503".to_string()) }, &options).await;

        assert!(outcome.total_time >= Duration::from_millis(500));
        assert!(outcome.total_time < Duration::from_millis(1505));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_retryable_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: RetryOutcome<(), String> = retry_with_backoff(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            },
            &fast().with_max_retries(1).with_timeout(Duration::from_millis(50)),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            outcome.result.unwrap_err(),
            AttemptError::Timeout(Duration::from_millis(50))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_passes_fast_results_through() {
        let ok: Result<u8, AttemptError<String>> =
            with_timeout(async { Ok(1) }, Duration::from_secs(1)).await;
        assert_eq!(ok.unwrap(), 1);

        let err: Result<u8, AttemptError<String>> =
            with_timeout(async { Err("boom".to_string()) }, Duration::from_secs(1)).await;
        assert_eq!(err.unwrap_err().into_inner(), Some("boom".to_string()));
    }

    #[tokio::test]
    async fn fallback_runs_on_primary_failure() {
        let mut reported = None;
        let value: Result<&str, String> = with_fallback(
            || async { Err("primary down".to_string()) },
            || async { Ok("cached") },
            |e: &String| reported = Some(e.clone()),
        )
        .await;

        assert_eq!(value.unwrap(), "cached");
        assert_eq!(reported.as_deref(), Some("primary down"));
    }

    #[tokio::test]
    async fn fallback_skipped_on_success() {
        let value: Result<&str, String> = with_fallback(
            || async { Ok("live") },
            || async { Ok("cached") },
            |_| panic!("no error expected"),
        )
        .await;
        assert_eq!(value.unwrap(), "live");
    }

    #[test]
    fn default_classifier() {
        assert!(is_retryable_message("Request Timeout"));
        assert!(is_retryable_message("network unreachable"));
        assert!(is_retryable_message("Connection reset by peer"));
        assert!(is_retryable_message("connect ECONNREFUSED 127.0.0.1:3000"));
        assert!(is_retryable_message("getaddrinfo ENOTFOUND api.local"));
        assert!(is_retryable_message("HTTP 429 Too Many Requests"));
        assert!(is_retryable_message("upstream returned 502"));
        assert!(is_retryable_message(
            &AttemptError::<String>::Timeout(Duration::from_millis(5)).to_string()
        ));

        assert!(!is_retryable_message("HTTP 404 Not Found"));
        assert!(!is_retryable_message("invalid input"));
        assert!(!is_retryable_message("status 5"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_multipliers_fall_back_to_constant_delay() {
        for multiplier in [-2.0, f64::NAN, f64::INFINITY] {
            let options = RetryOptions::default()
                .with_max_retries(2)
                .with_initial_delay(Duration::from_millis(100))
                .with_backoff_multiplier(multiplier)
                .without_jitter();

            let outcome: RetryOutcome<(), String> =
                retry_with_backoff(|| async { Err("timeout".to_string()) }, &options).await;

            assert_eq!(outcome.attempts, 3, "multiplier {multiplier}");
            assert!(outcome.total_time >= Duration::from_millis(200));
            assert!(outcome.total_time < Duration::from_millis(210));
        }
    }

    #[test]
    fn huge_multiplier_saturates_at_max_delay() {
        let options = RetryOptions::default()
            .with_backoff_multiplier(1e300)
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(
            options.next_delay(Duration::from_secs(1)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn presets() {
        let default = RetryOptions::default();
        assert_eq!(default.max_retries, 3);
        assert_eq!(default.initial_delay, Duration::from_millis(100));
        assert_eq!(default.max_delay, Duration::from_secs(10));
        assert!(default.jitter);
        assert_eq!(default.timeout, None);

        assert_eq!(RetryOptions::none().max_retries, 0);
        assert!(RetryOptions::sync().timeout.is_some());
    }
}
