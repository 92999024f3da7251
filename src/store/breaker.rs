//! Circuit breaker guarding calls to the backing store.
//!
//! # States
//! - Closed: calls pass through, outcomes are counted in a rolling window
//! - Open: calls fail immediately without touching the store
//! - Half-Open: a single trial call decides whether to close again
//!
//! # State Transitions
//! ```text
//! Closed → Open: volume >= request_volume_threshold and error % >= threshold
//! Open → Half-Open: sleep_window elapsed since the circuit opened
//! Half-Open → Closed: trial call succeeds
//! Half-Open → Open: trial call fails
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Error percentage at or above which the circuit opens.
    pub error_threshold_percentage: u32,
    /// Minimum calls in the rolling window before the error rate is considered.
    pub request_volume_threshold: u64,
    /// Length of the rolling window.
    pub rolling_window: Duration,
    /// Number of buckets the rolling window is split into.
    pub rolling_buckets: u32,
    /// How long the circuit stays open before a trial call.
    pub sleep_window: Duration,
    /// Calls allowed in flight at once.
    pub max_concurrent_requests: usize,
    /// Deadline for a single call.
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_percentage: 50,
            request_volume_threshold: 10,
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            sleep_window: Duration::from_secs(5),
            max_concurrent_requests: 20_000,
            timeout: Duration::from_millis(500),
        }
    }
}

impl BreakerConfig {
    /// Check the configuration for values the breaker cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=100).contains(&self.error_threshold_percentage) {
            return Err(format!(
                "error_threshold_percentage must be within 1..=100, got {}",
                self.error_threshold_percentage
            ));
        }
        if self.rolling_window.is_zero() || self.rolling_buckets == 0 {
            return Err("rolling window and bucket count must be non-zero".to_string());
        }
        if self.max_concurrent_requests == 0 {
            return Err("max_concurrent_requests must be non-zero".to_string());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Why a guarded call did not produce a value.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the call was not attempted.
    #[error("circuit breaker is open")]
    Open,

    /// Too many calls already in flight; the call was not attempted.
    #[error("concurrency limit of {0} reached")]
    ConcurrencyLimit(usize),

    /// The call exceeded the per-call deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The call itself failed.
    #[error(transparent)]
    Inner(E),
}

/// Decides whether an error counts against the breaker.
pub trait Failure {
    /// Errors that reflect a caller mistake should return `false`.
    fn counts_as_failure(&self) -> bool {
        true
    }
}

/// Counters for every outcome the breaker has observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub short_circuits: u64,
    pub concurrency_rejections: u64,
    pub bad_requests: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    short_circuits: AtomicU64,
    concurrency_rejections: AtomicU64,
    bad_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: Instant,
    successes: u64,
    failures: u64,
}

/// Success and failure counts over a sliding window of fixed-width buckets.
#[derive(Debug)]
struct RollingCounter {
    buckets: VecDeque<Bucket>,
    bucket_width: Duration,
    window: Duration,
}

impl RollingCounter {
    fn new(window: Duration, buckets: u32) -> Self {
        Self {
            buckets: VecDeque::with_capacity(buckets as usize),
            bucket_width: window / buckets,
            window,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.duration_since(front.start) >= self.window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn current(&mut self, now: Instant) -> &mut Bucket {
        self.prune(now);
        let needs_new = match self.buckets.back() {
            Some(b) => now.duration_since(b.start) >= self.bucket_width,
            None => true,
        };
        if needs_new {
            self.buckets.push_back(Bucket {
                start: now,
                successes: 0,
                failures: 0,
            });
        }
        // a bucket was pushed above if none existed
        let last = self.buckets.len() - 1;
        &mut self.buckets[last]
    }

    fn record(&mut self, now: Instant, success: bool) {
        let bucket = self.current(now);
        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }
    }

    /// Returns `(total, failures)` within the window.
    fn totals(&mut self, now: Instant) -> (u64, u64) {
        self.prune(now);
        self.buckets.iter().fold((0, 0), |(total, failures), b| {
            (total + b.successes + b.failures, failures + b.failures)
        })
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    counts: RollingCounter,
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// A hystrix-style circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    permits: Semaphore,
    stats: StatCounters,
}

impl CircuitBreaker {
    /// Create a closed breaker. Fails if the configuration is unusable.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, String> {
        config.validate()?;

        Ok(Self {
            name: name.into(),
            permits: Semaphore::new(config.max_concurrent_requests),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                trial_in_flight: false,
                counts: RollingCounter::new(config.rolling_window, config.rolling_buckets),
            }),
            config,
            stats: StatCounters::default(),
        })
    }

    /// The breaker name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// The current state.
    ///
    /// An open circuit whose sleep window has elapsed still reports `Open`
    /// until a call is admitted as the half-open trial.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// A snapshot of the outcome counters.
    pub fn stats(&self) -> BreakerStats {
        let s = &self.stats;
        BreakerStats {
            successes: s.successes.load(Ordering::Relaxed),
            failures: s.failures.load(Ordering::Relaxed),
            timeouts: s.timeouts.load(Ordering::Relaxed),
            short_circuits: s.short_circuits.load(Ordering::Relaxed),
            concurrency_rejections: s.concurrency_rejections.load(Ordering::Relaxed),
            bad_requests: s.bad_requests.load(Ordering::Relaxed),
        }
    }

    /// Run `f` under the breaker.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        E: Failure,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = match self.admit() {
            Some(admission) => admission,
            None => {
                self.stats.short_circuits.fetch_add(1, Ordering::Relaxed);
                return Err(BreakerError::Open);
            }
        };

        let mut trial = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let _permit = match self.permits.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats
                    .concurrency_rejections
                    .fetch_add(1, Ordering::Relaxed);
                if trial.armed {
                    trial.armed = false;
                    self.inner.lock().trial_in_flight = false;
                }
                return Err(BreakerError::ConcurrencyLimit(
                    self.config.max_concurrent_requests,
                ));
            }
        };

        let outcome = tokio::time::timeout(self.config.timeout, f()).await;
        trial.armed = false;

        match outcome {
            Ok(Ok(value)) => {
                self.stats.successes.fetch_add(1, Ordering::Relaxed);
                self.on_outcome(admission, true);
                Ok(value)
            }
            Ok(Err(e)) if !e.counts_as_failure() => {
                // The store answered, so the call proves it is reachable.
                self.stats.bad_requests.fetch_add(1, Ordering::Relaxed);
                self.on_outcome(admission, true);
                Err(BreakerError::Inner(e))
            }
            Ok(Err(e)) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.on_outcome(admission, false);
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                self.on_outcome(admission, false);
                Err(BreakerError::Timeout(self.config.timeout))
            }
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let slept = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.sleep_window);
                if !slept {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                Some(Admission::Trial)
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(Admission::Trial)
            }
        }
    }

    fn on_outcome(&self, admission: Admission, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if admission == Admission::Trial {
            inner.trial_in_flight = false;
            if success {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.counts.clear();
                info!(breaker = %self.name, "Trial call succeeded, circuit closed");
            } else {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(breaker = %self.name, "Trial call failed, circuit re-opened");
            }
            return;
        }

        inner.counts.record(now, success);
        if inner.state != CircuitState::Closed || success {
            return;
        }

        let (total, failures) = inner.counts.totals(now);
        if total < self.config.request_volume_threshold {
            return;
        }

        let error_percentage = failures * 100 / total;
        debug!(
            breaker = %self.name,
            total = total,
            failures = failures,
            error_percentage = error_percentage,
            "Evaluating circuit health"
        );

        if error_percentage >= u64::from(self.config.error_threshold_percentage) {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            warn!(
                breaker = %self.name,
                total = total,
                failures = failures,
                sleep_window = ?self.config.sleep_window,
                "Error threshold exceeded, circuit opened"
            );
        }
    }
}

/// Re-opens the circuit if a trial call is dropped before it completes.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.breaker.inner.lock();
        inner.trial_in_flight = false;
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        warn!(breaker = %self.breaker.name, "Trial call abandoned, circuit re-opened");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Fault,
        Miss,
    }

    impl Failure for TestError {
        fn counts_as_failure(&self) -> bool {
            matches!(self, TestError::Fault)
        }
    }

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            error_threshold_percentage: 50,
            request_volume_threshold: 4,
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            sleep_window: Duration::from_millis(100),
            max_concurrent_requests: 8,
            timeout: Duration::from_millis(50),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> BreakerError<TestError> {
        breaker
            .call(|| async { Err::<(), _>(TestError::Fault) })
            .await
            .unwrap_err()
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, BreakerError<TestError>> {
        breaker.call(|| async { Ok::<_, TestError>(7) }).await
    }

    #[test]
    fn test_config_validation() {
        assert!(BreakerConfig::default().validate().is_ok());

        let mut config = BreakerConfig::default();
        config.error_threshold_percentage = 0;
        assert!(config.validate().is_err());

        let mut config = BreakerConfig::default();
        config.rolling_buckets = 0;
        assert!(CircuitBreaker::new("redis", config).is_err());

        let mut config = BreakerConfig::default();
        config.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_closed_passes_calls_through() {
        let breaker = CircuitBreaker::new("redis", test_config()).unwrap();

        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().successes, 1);
    }

    #[tokio::test]
    async fn test_opens_after_volume_and_error_threshold() {
        let breaker = CircuitBreaker::new("redis", test_config()).unwrap();

        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, BreakerError::Inner(TestError::Fault)));
            assert_eq!(breaker.state(), CircuitState::Closed);
        }

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Open: the closure must not run
        let mut ran = false;
        let result = breaker
            .call(|| {
                ran = true;
                async { Ok::<_, TestError>(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert!(!ran);
        assert_eq!(breaker.stats().short_circuits, 1);
    }

    #[tokio::test]
    async fn test_stays_closed_below_error_percentage() {
        let breaker = CircuitBreaker::new("redis", test_config()).unwrap();

        for _ in 0..6 {
            succeed(&breaker).await.unwrap();
        }
        for _ in 0..5 {
            fail(&breaker).await;
        }

        // 5 failures of 11 calls is below 50%
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_misses_never_count_as_failures() {
        let breaker = CircuitBreaker::new("redis", test_config()).unwrap();

        for _ in 0..50 {
            let err = breaker
                .call(|| async { Err::<(), _>(TestError::Miss) })
                .await
                .unwrap_err();
            assert!(matches!(err, BreakerError::Inner(TestError::Miss)));
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failures, 0);
        assert_eq!(breaker.stats().bad_requests, 50);
    }

    #[tokio::test]
    async fn test_timeouts_count_as_failures() {
        let breaker = CircuitBreaker::new("redis", test_config()).unwrap();

        for _ in 0..4 {
            let err = breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, TestError>(())
                })
                .await
                .unwrap_err();
            assert!(matches!(err, BreakerError::Timeout(_)));
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().timeouts, 4);
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let breaker = CircuitBreaker::new("redis", test_config()).unwrap();
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);

        // The window was cleared, so a single failure does not re-open
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let breaker = CircuitBreaker::new("redis", test_config()).unwrap();
        for _ in 0..4 {
            fail(&breaker).await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(matches!(fail(&breaker).await, BreakerError::Inner(_)));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_half_open_admits_exactly_one_trial() {
        let breaker = Arc::new(CircuitBreaker::new("redis", test_config()).unwrap());
        for _ in 0..4 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, TestError>(1)
                    })
                    .await
            })
        };

        // Let the trial get admitted
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_concurrency_limit_rejects_without_failure() {
        let mut config = test_config();
        config.max_concurrent_requests = 1;
        config.timeout = Duration::from_secs(5);
        let breaker = Arc::new(CircuitBreaker::new("redis", config).unwrap());

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, TestError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::ConcurrencyLimit(1))
        ));

        release_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(breaker.stats().concurrency_rejections, 1);
        assert_eq!(breaker.stats().failures, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_trial_reopens_circuit() {
        let breaker = CircuitBreaker::new("redis", test_config()).unwrap();
        for _ in 0..4 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The caller gives up on the trial before the breaker deadline
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, TestError>(0)
            }),
        )
        .await;
        assert!(abandoned.is_err());

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_rolling_counter_drops_old_buckets() {
        let mut counter = RollingCounter::new(Duration::from_secs(10), 10);
        let start = Instant::now();

        counter.record(start, false);
        counter.record(start + Duration::from_secs(1), true);
        assert_eq!(counter.totals(start + Duration::from_secs(2)), (2, 1));

        // The first bucket leaves the window after 10s
        assert_eq!(counter.totals(start + Duration::from_millis(10_500)), (1, 0));
        assert_eq!(counter.totals(start + Duration::from_secs(20)), (0, 0));
    }
}
