//! Constant/linear/exponential(+decorrelated-jitter) backoff executor
//! around a caller-supplied fallible operation (spec §4.10). Delay
//! formulas and statistics match the CDMF original exactly.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::error::ReliabilityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Constant,
    Linear,
    Exponential,
    ExponentialJitter,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    pub backoff_multiplier: f64,
    pub linear_increment: Duration,
    /// When `true` and `strategy != ExponentialJitter`, the computed delay
    /// is additionally multiplied by a `uniform(0.8, 1.2)` factor.
    pub jitter: bool,
    pub timeout_per_attempt: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            strategy: RetryStrategy::Exponential,
            backoff_multiplier: 2.0,
            linear_increment: Duration::from_millis(100),
            jitter: false,
            timeout_per_attempt: None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InitialDelayExceedsMax,
    MultiplierTooSmall,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::InitialDelayExceedsMax);
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::MultiplierTooSmall);
        }
        Ok(())
    }
}

pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn constant_delay(mut self, delay: Duration) -> Self {
        self.config.strategy = RetryStrategy::Constant;
        self.config.initial_delay = delay;
        self
    }

    pub fn linear_backoff(mut self, initial: Duration, increment: Duration) -> Self {
        self.config.strategy = RetryStrategy::Linear;
        self.config.initial_delay = initial;
        self.config.linear_increment = increment;
        self
    }

    pub fn exponential_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.config.strategy = RetryStrategy::Exponential;
        self.config.initial_delay = initial;
        self.config.backoff_multiplier = multiplier;
        self.config.max_delay = max;
        self
    }

    pub fn exponential_jitter(mut self, initial: Duration, max: Duration) -> Self {
        self.config.strategy = RetryStrategy::ExponentialJitter;
        self.config.initial_delay = initial;
        self.config.max_delay = max;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    pub fn timeout_per_attempt(mut self, timeout: Duration) -> Self {
        self.config.timeout_per_attempt = Some(timeout);
        self
    }

    pub fn build(self) -> Result<RetryConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone)]
pub struct RetryStats {
    pub total_calls: u64,
    pub first_try_successes: u64,
    pub retry_successes: u64,
    pub exhausted: u64,
    pub avg_retries_on_success: f64,
}

struct JitterState {
    prev_delay: Duration,
}

pub struct RetryPolicy {
    config: RetryConfig,
    stats: Mutex<RetryStats>,
    jitter_state: Mutex<JitterState>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            stats: Mutex::new(RetryStats::default()),
            jitter_state: Mutex::new(JitterState { prev_delay: initial }),
        }
    }

    pub fn stats(&self) -> RetryStats {
        self.stats.lock().clone()
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = match self.config.strategy {
            RetryStrategy::Constant => self.config.initial_delay,
            RetryStrategy::Linear => {
                self.config.initial_delay + self.config.linear_increment * (attempt.saturating_sub(1))
            }
            RetryStrategy::Exponential => {
                let factor = self.config.backoff_multiplier.powi((attempt.saturating_sub(1)) as i32);
                duration_mul_f64(self.config.initial_delay, factor)
            }
            RetryStrategy::ExponentialJitter => {
                let mut jitter = self.jitter_state.lock();
                let min = self.config.initial_delay.as_millis().max(1) as u64;
                let max = (jitter.prev_delay.as_millis() as u64 * 3).max(min);
                let chosen_ms = if max > min { rand::rng().random_range(min..=max) } else { min };
                let chosen = Duration::from_millis(chosen_ms);
                jitter.prev_delay = chosen;
                return cap(chosen, self.config.max_delay);
            }
        };

        let with_jitter = if self.config.jitter {
            let factor = rand::rng().random_range(0.8..=1.2);
            duration_mul_f64(base, factor)
        } else {
            base
        };
        cap(with_jitter, self.config.max_delay)
    }

    /// Runs `op` up to `max_retries + 1` times, sleeping between attempts
    /// per the configured strategy. Returns the operation's last result
    /// (success or the terminal error) — `MaxRetriesExceeded` is reported
    /// by the caller inspecting the returned `Result` when all attempts
    /// fail, matching spec §4.10's "MAX_RETRIES_EXCEEDED" outcome kind.
    pub async fn execute<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut last_err = None;
        for attempt in 1..=max_attempts {
            match op().await {
                Ok(value) => {
                    self.record_success(attempt);
                    return Ok(value);
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt < max_attempts {
                        let delay = self.delay_for_attempt(attempt);
                        debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after failure");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        self.record_exhaustion();
        Err(last_err.expect("at least one attempt always runs"))
    }

    fn record_success(&self, attempt: u32) {
        let mut stats = self.stats.lock();
        stats.total_calls += 1;
        if attempt == 1 {
            stats.first_try_successes += 1;
        } else {
            stats.retry_successes += 1;
        }
        let n = (stats.first_try_successes + stats.retry_successes) as f64;
        let retries_this_call = (attempt - 1) as f64;
        stats.avg_retries_on_success = (stats.avg_retries_on_success * (n - 1.0) + retries_this_call) / n;
    }

    fn record_exhaustion(&self) {
        let mut stats = self.stats.lock();
        stats.total_calls += 1;
        stats.exhausted += 1;
    }
}

fn duration_mul_f64(d: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64((d.as_secs_f64() * factor).max(0.0))
}

fn cap(d: Duration, max: Duration) -> Duration {
    if d > max {
        max
    } else {
        d
    }
}

/// Classifies POSIX errno values the way the original retry policy does:
/// temp/connection/timeout errors are retryable, permission/argument
/// errors never are.
pub fn is_retryable_errno(errno: i32) -> bool {
    const EAGAIN: i32 = 11;
    const EWOULDBLOCK: i32 = 11;
    const EINTR: i32 = 4;
    const ECONNREFUSED: i32 = 111;
    const ECONNRESET: i32 = 104;
    const ECONNABORTED: i32 = 103;
    const EHOSTUNREACH: i32 = 113;
    const ENETUNREACH: i32 = 101;
    const ETIMEDOUT: i32 = 110;
    const EPIPE: i32 = 32;
    const ENOTCONN: i32 = 107;
    const EACCES: i32 = 13;
    const EPERM: i32 = 1;
    const EINVAL: i32 = 22;
    const EBADF: i32 = 9;

    match errno {
        EAGAIN | EWOULDBLOCK | EINTR => true,
        ECONNREFUSED | ECONNRESET | ECONNABORTED | EHOSTUNREACH | ENETUNREACH => true,
        ETIMEDOUT => true,
        EPIPE | ENOTCONN => true,
        EACCES | EPERM | EINVAL | EBADF => false,
        _ => false,
    }
}

pub fn errno_to_error(_errno: i32) -> ReliabilityError {
    ReliabilityError::Timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_try_without_sleeping() {
        let policy = RetryPolicy::new(RetryConfigBuilder::new().max_retries(3).build().unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), &str> = policy
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let policy = RetryPolicy::new(
            RetryConfigBuilder::new()
                .max_retries(2)
                .constant_delay(Duration::from_millis(1))
                .build()
                .unwrap(),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), &str> = policy
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("boom")
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // max_retries + 1
    }

    #[test]
    fn exponential_delays_match_formula_with_clamp() {
        let policy = RetryPolicy::new(
            RetryConfigBuilder::new()
                .exponential_backoff(Duration::from_millis(100), 2.0, Duration::from_millis(500))
                .build()
                .unwrap(),
        );
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));

        let clamped = RetryPolicy::new(
            RetryConfigBuilder::new()
                .exponential_backoff(Duration::from_millis(100), 2.0, Duration::from_millis(300))
                .build()
                .unwrap(),
        );
        assert_eq!(clamped.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(clamped.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(clamped.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn linear_delays_match_formula() {
        let policy = RetryPolicy::new(
            RetryConfigBuilder::new()
                .linear_backoff(Duration::from_millis(100), Duration::from_millis(50))
                .build()
                .unwrap(),
        );
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(150));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let bad = RetryConfigBuilder::new()
            .exponential_backoff(Duration::from_secs(10), 2.0, Duration::from_secs(1))
            .build();
        assert!(bad.is_err());
    }

    #[test]
    fn is_retryable_errno_classification() {
        assert!(is_retryable_errno(110)); // ETIMEDOUT
        assert!(!is_retryable_errno(13)); // EACCES
    }
}
