//! Circuit breaker for calls to a flaky dependency.
//!
//! States:
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: calls fail fast with [`CircuitError::Open`] until the cooldown ends
//! - HalfOpen: calls pass through; enough consecutive successes close the
//!   circuit, any failure re-opens it
//!
//! One breaker guards one downstream resource. Share it by reference (or
//! `Arc`) between every caller of that resource. The state lock is never
//! held while the wrapped call runs.

use crate::clock::{Clock, SystemClock};
use crate::retry::{with_timeout, AttemptError};
use crate::Timestamp;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the wrapped function was not invoked.
    #[error("circuit breaker is open, next attempt at {next_attempt_at}")]
    Open { next_attempt_at: Timestamp },

    /// The wrapped function failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Open { .. } => None,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// Consecutive successes that close a half-open circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before allowing a trial call
    pub timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            timeout,
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Timestamp,
}

/// A circuit breaker with call metrics.
#[derive(Debug)]
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    config: CircuitConfig,
    breaker: Mutex<Breaker>,
    clock: C,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker on the system clock.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self::with_clock(name, config, SystemClock)
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker reading time from `clock`.
    pub fn with_clock(name: impl Into<String>, config: CircuitConfig, clock: C) -> Self {
        Self {
            name: name.into(),
            config,
            breaker: Mutex::new(Breaker {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt_at: 0,
            }),
            clock,
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state. An open circuit whose cooldown has passed still reads
    /// as open until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.breaker.lock().state
    }

    /// Force the circuit closed and clear both counters.
    pub fn reset(&self) {
        let mut breaker = self.breaker.lock();
        breaker.state = CircuitState::Closed;
        breaker.failure_count = 0;
        breaker.success_count = 0;
        info!(circuit = %self.name, "circuit breaker reset");
    }

    /// Run `f` through the breaker.
    ///
    /// The outcome is only recorded if the returned future runs to
    /// completion. A time limit applied around this future drops it before
    /// the failure is counted; use [`execute_with_timeout`](Self::execute_with_timeout).
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        self.admit()?;

        match f().await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Run `f` through the breaker, abandoning it after `limit`.
    ///
    /// A call that runs out of time is dropped and counts as a failure.
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        limit: Duration,
        f: F,
    ) -> Result<T, CircuitError<AttemptError<E>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(|| with_timeout(f(), limit)).await
    }

    fn admit<E>(&self) -> Result<(), CircuitError<E>> {
        let mut breaker = self.breaker.lock();
        if breaker.state == CircuitState::Open {
            if self.clock.now_millis() < breaker.next_attempt_at {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "circuit open, rejecting call");
                return Err(CircuitError::Open {
                    next_attempt_at: breaker.next_attempt_at,
                });
            }
            breaker.state = CircuitState::HalfOpen;
            breaker.success_count = 0;
            info!(circuit = %self.name, "circuit half-open, allowing trial call");
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut breaker = self.breaker.lock();
        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.success_count += 1;
                if breaker.success_count >= self.config.success_threshold {
                    breaker.state = CircuitState::Closed;
                    breaker.failure_count = 0;
                    breaker.success_count = 0;
                    info!(circuit = %self.name, "circuit closed");
                }
            }
            CircuitState::Closed => breaker.failure_count = 0,
            // A call admitted before another caller tripped the circuit.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut breaker = self.breaker.lock();
        match breaker.state {
            CircuitState::HalfOpen => {
                self.trip(&mut breaker);
                warn!(circuit = %self.name, "trial call failed, circuit re-opened");
            }
            CircuitState::Closed => {
                breaker.failure_count += 1;
                if breaker.failure_count >= self.config.failure_threshold {
                    self.trip(&mut breaker);
                    warn!(
                        circuit = %self.name,
                        failures = self.config.failure_threshold,
                        "circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, breaker: &mut Breaker) {
        breaker.state = CircuitState::Open;
        breaker.failure_count = 0;
        breaker.success_count = 0;
        breaker.next_attempt_at = self
            .clock
            .now_millis()
            .saturating_add(self.config.timeout.as_millis() as u64);
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Calls refused while open.
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn breaker(clock: &ManualClock, failures: u32, successes: u32) -> CircuitBreaker<ManualClock> {
        CircuitBreaker::with_clock(
            "test",
            CircuitConfig::new(failures, successes, Duration::from_millis(1_000)),
            clock.clone(),
        )
    }

    async fn fail(cb: &CircuitBreaker<ManualClock>, calls: &AtomicUsize) -> Result<(), CircuitError<&'static str>> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("boom")
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker<ManualClock>, calls: &AtomicUsize) -> Result<u8, CircuitError<&'static str>> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        })
        .await
    }

    async fn hang(
        cb: &CircuitBreaker<ManualClock>,
        calls: &AtomicUsize,
    ) -> Result<(), CircuitError<AttemptError<&'static str>>> {
        cb.execute_with_timeout(Duration::from_millis(50), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn passes_results_through_when_closed() {
        let clock = ManualClock::new(0);
        let cb = breaker(&clock, 3, 2);
        let calls = AtomicUsize::new(0);

        assert_eq!(succeed(&cb, &calls).await.unwrap(), 1);
        assert_eq!(fail(&cb, &calls).await, Err(CircuitError::Inner("boom")));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn trips_and_recovers() {
        let clock = ManualClock::new(10_000);
        let cb = breaker(&clock, 3, 2);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Fail fast while open, without invoking the function
        for _ in 0..5 {
            let err = succeed(&cb, &calls).await.unwrap_err();
            assert_eq!(
                err,
                CircuitError::Open {
                    next_attempt_at: 11_000
                }
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.rejections(), 5);

        clock.advance(1_000);
        assert_eq!(cb.state(), CircuitState::Open);

        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens_immediately() {
        let clock = ManualClock::new(0);
        let cb = breaker(&clock, 2, 3);
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(1_000);
        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let err = succeed(&cb, &calls).await.unwrap_err();
        assert!(err.is_open());
        assert_eq!(
            err,
            CircuitError::Open {
                next_attempt_at: 2_000
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_calls_count_as_failures() {
        let clock = ManualClock::new(0);
        let cb = breaker(&clock, 2, 1);
        let calls = AtomicUsize::new(0);

        let err = hang(&cb, &calls).await.unwrap_err();
        assert_eq!(
            err,
            CircuitError::Inner(AttemptError::Timeout(Duration::from_millis(50)))
        );
        let _ = hang(&cb, &calls).await;

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failures(), 2);
        assert!(hang(&cb, &calls).await.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_trial_call_reopens() {
        let clock = ManualClock::new(0);
        let cb = breaker(&clock, 1, 1);
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        clock.advance(1_000);

        let _ = hang(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let clock = ManualClock::new(0);
        let cb = breaker(&clock, 3, 1);
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        succeed(&cb, &calls).await.unwrap();
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_closes_the_circuit() {
        let clock = ManualClock::new(0);
        let cb = breaker(&clock, 1, 1);
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeed(&cb, &calls).await.is_ok());
    }

    #[tokio::test]
    async fn metrics_accumulate() {
        let clock = ManualClock::new(0);
        let cb = breaker(&clock, 2, 1);
        let calls = AtomicUsize::new(0);

        succeed(&cb, &calls).await.unwrap();
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        let _ = succeed(&cb, &calls).await;

        assert_eq!(cb.calls_total(), 4);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 2);
        assert_eq!(cb.rejections(), 1);
    }

    #[test]
    fn defaults() {
        let config = CircuitConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.timeout, Duration::from_secs(60));

        let cb = CircuitBreaker::with_defaults("downstream");
        assert_eq!(cb.name(), "downstream");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn open_error_is_distinguishable() {
        let open: CircuitError<String> = CircuitError::Open { next_attempt_at: 5 };
        let inner: CircuitError<String> = CircuitError::Inner("x".into());
        assert!(open.is_open());
        assert!(!inner.is_open());
        assert!(open.to_string().contains("circuit breaker is open"));
        assert_eq!(inner.into_inner(), Some("x".to_string()));
    }

    #[test]
    fn state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
