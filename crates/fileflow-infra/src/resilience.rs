//! Retry with exponential backoff and a consecutive-failure circuit breaker.
//!
//! Both are meant to wrap one narrow operation (a persistence write), not a
//! whole handler.

use fileflow_core::{AppError, AppResult, ErrorMetadata};
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, capped at `max_backoff`, with up to 10% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_backoff.as_secs_f64() * factor;
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jitter = if capped > 0.0 {
            rand::rng().random_range(0.0..=capped * 0.1)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + jitter).min(self.max_backoff.as_secs_f64()))
    }
}

/// Run `op` until it succeeds, `should_retry` rejects the error, or the
/// attempts run out. The last error is returned unchanged.
pub async fn retry_with_backoff<T, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut op: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
    P: Fn(&AppError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is let through
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub async fn is_open(&self) -> bool {
        let state = self.state.lock().await;
        state.open_until.is_some_and(|until| Instant::now() < until)
    }

    /// Run `op` unless the circuit is open. Only recoverable errors count as
    /// failures; domain errors pass through without tripping the breaker.
    pub async fn call<T, F, Fut>(&self, op: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        {
            let state = self.state.lock().await;
            if let Some(until) = state.open_until {
                let now = Instant::now();
                if now < until {
                    return Err(AppError::external(
                        self.name,
                        format!(
                            "circuit open for another {} ms",
                            until.duration_since(now).as_millis()
                        ),
                    ));
                }
            }
        }

        let result = op().await;

        let mut state = self.state.lock().await;
        match &result {
            Ok(_) => {
                if state.open_until.is_some() || state.consecutive_failures > 0 {
                    tracing::debug!(breaker = self.name, "Circuit closed");
                }
                *state = BreakerState::default();
            }
            Err(e) if e.is_recoverable() => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.open_until = Some(Instant::now() + self.config.open_duration);
                    tracing::warn!(
                        breaker = self.name,
                        failures = state.consecutive_failures,
                        open_secs = self.config.open_duration.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            Err(_) => {}
        }
        result
    }
}
