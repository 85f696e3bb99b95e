//! Resilience wrapper around external connector I/O.
//!
//! Every outbound call goes through [`Resilience::call`], which stacks a
//! token-bucket rate limiter, a per-endpoint circuit breaker, a per-call
//! deadline, and retry with exponential backoff and jitter. Only transient
//! errors (timeouts, connection failures, HTTP 5xx/429) are retried;
//! everything else propagates immediately. All waits observe the run's
//! cancellation token.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{Result, SqlFlowError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomized in both directions.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), jittered.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum BreakerInner {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Per-endpoint circuit breaker: `closed → open` after N consecutive
/// failures, `open → half-open` after the cool-down, then `closed` on the
/// probe's success or back to `open` on its failure.
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            config,
            inner: Mutex::new(BreakerInner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Fail fast while open; admit a single probe once the cool-down has
    /// elapsed.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match &*inner {
            BreakerInner::Closed { .. } | BreakerInner::HalfOpen => Ok(()),
            BreakerInner::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.config.cooldown {
                    debug!(endpoint = %self.endpoint, "circuit half-open; admitting probe");
                    *inner = BreakerInner::HalfOpen;
                    Ok(())
                } else {
                    Err(SqlFlowError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                        retry_in_ms: (self.config.cooldown - elapsed).as_millis() as u64,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        *inner = BreakerInner::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match &mut *inner {
            BreakerInner::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        endpoint = %self.endpoint,
                        failures = *consecutive_failures,
                        "circuit opened"
                    );
                    *inner = BreakerInner::Open {
                        since: Instant::now(),
                    };
                }
            }
            BreakerInner::HalfOpen => {
                *inner = BreakerInner::Open {
                    since: Instant::now(),
                };
            }
            BreakerInner::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        match &*self.inner.lock().expect("breaker lock") {
            BreakerInner::Closed { .. } => BreakerState::Closed,
            BreakerInner::Open { .. } => BreakerState::Open,
            BreakerInner::HalfOpen => BreakerState::HalfOpen,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Burst capacity in tokens.
    pub capacity: f64,
    /// Steady-state refill, tokens per second.
    pub refill_per_sec: f64,
}

/// Token bucket. `acquire` blocks until a token is available.
pub struct TokenBucket {
    config: RateLimitConfig,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        let tokens = config.capacity;
        Self {
            config,
            state: Mutex::new((tokens, Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket lock");
                let (tokens, last) = &mut *state;
                let elapsed = last.elapsed().as_secs_f64();
                *tokens = (*tokens + elapsed * self.config.refill_per_sec)
                    .min(self.config.capacity);
                *last = Instant::now();
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - *tokens) / self.config.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-call deadline. Exceeding it counts as a transient failure.
    pub call_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: None,
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// One wrapper instance per endpoint; breaker and bucket state is shared
/// across all calls to that endpoint within a run.
pub struct Resilience {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    limiter: Option<TokenBucket>,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl Resilience {
    pub fn new(endpoint: &str, config: ResilienceConfig, cancel: CancellationToken) -> Self {
        Self {
            retry: config.retry,
            breaker: CircuitBreaker::new(endpoint, config.breaker),
            limiter: config.rate_limit.map(TokenBucket::new),
            call_timeout: config.call_timeout,
            cancel,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `op`, retrying transient failures within the retry budget. The
    /// factory is invoked once per attempt.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SqlFlowError::Cancelled);
            }
            self.breaker.check()?;

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(SqlFlowError::Cancelled),
                    _ = limiter.acquire() => {}
                }
            }

            let timeout_ms = self.call_timeout.as_millis() as u64;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(SqlFlowError::Cancelled),
                outcome = tokio::time::timeout(self.call_timeout, op()) => {
                    match outcome {
                        Err(_) => Err(SqlFlowError::DeadlineExceeded(timeout_ms)),
                        Ok(inner) => inner,
                    }
                }
            };

            match result {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(SqlFlowError::Cancelled) => return Err(SqlFlowError::Cancelled),
                Err(err) => {
                    self.breaker.record_failure();
                    let retryable = err.is_transient() && attempt + 1 < self.retry.max_attempts;
                    if !retryable {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; backing off before retry"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(SqlFlowError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_config() -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: 0.0,
            },
            ..ResilienceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retried_up_to_budget() {
        let wrapper = Resilience::new("t", quick_config(), CancellationToken::new());
        let calls = AtomicU32::new(0);
        let result: Result<()> = wrapper
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SqlFlowError::Connection("reset".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_errors_propagate_immediately() {
        let wrapper = Resilience::new("t", quick_config(), CancellationToken::new());
        let calls = AtomicU32::new(0);
        let result: Result<()> = wrapper
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SqlFlowError::Auth("bad credentials".into())) }
            })
            .await;
        assert!(matches!(result, Err(SqlFlowError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failure() {
        let wrapper = Resilience::new("t", quick_config(), CancellationToken::new());
        let calls = AtomicU32::new(0);
        let result = wrapper
            .call(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(SqlFlowError::Connection("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new("api", CircuitBreakerConfig::default());
        for _ in 0..5 {
            breaker.check().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        let err = breaker.check().unwrap_err();
        assert!(matches!(err, SqlFlowError::CircuitOpen { .. }));

        // After the cool-down a single probe is admitted.
        tokio::time::advance(Duration::from_secs(30)).await;
        breaker.check().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("api", CircuitBreakerConfig::default());
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        breaker.check().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_blocks_until_refill() {
        let bucket = TokenBucket::new(RateLimitConfig {
            capacity: 2.0,
            refill_per_sec: 1.0,
        });
        bucket.acquire().await;
        bucket.acquire().await;
        // Bucket is empty; the next acquire needs ~1 s of refill. Paused
        // clock auto-advances through the sleep, so this completes without
        // real waiting while still exercising the wait path.
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_call() {
        let cancel = CancellationToken::new();
        let wrapper = Resilience::new("t", quick_config(), cancel.clone());
        cancel.cancel();
        let result: Result<()> = wrapper.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(SqlFlowError::Cancelled)));
    }
}
