//! CLOSED/OPEN/HALF_OPEN state machine with threshold- or rolling-window-
//! based tripping (spec §4.11). Transition rules match the CDMF original
//! exactly; callbacks fire under a separate lock from the FSM state so
//! user code can't deadlock the breaker.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::ReliabilityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_timeout: Duration,
    /// 0 disables rolling-window mode in favor of consecutive-failure
    /// counting.
    pub rolling_window_size: usize,
    pub failure_rate_threshold: f64,
    pub minimum_request_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(10),
            half_open_timeout: Duration::from_secs(60),
            rolling_window_size: 0,
            failure_rate_threshold: 0.5,
            minimum_request_threshold: 10,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ZeroFailureThreshold,
    ZeroSuccessThreshold,
    FailureRateOutOfRange,
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::ZeroSuccessThreshold);
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(ConfigError::FailureRateOutOfRange);
        }
        Ok(())
    }
}

pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.config.failure_threshold = n;
        self
    }
    pub fn success_threshold(mut self, n: u32) -> Self {
        self.config.success_threshold = n;
        self
    }
    pub fn open_timeout(mut self, d: Duration) -> Self {
        self.config.open_timeout = d;
        self
    }
    pub fn rolling_window(mut self, size: usize, failure_rate_threshold: f64, minimum_request_threshold: usize) -> Self {
        self.config.rolling_window_size = size;
        self.config.failure_rate_threshold = failure_rate_threshold;
        self.config.minimum_request_threshold = minimum_request_threshold;
        self
    }
    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone)]
pub struct CircuitBreakerStats {
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub open_count: u64,
    pub half_open_count: u64,
    pub close_count: u64,
    pub current_failure_rate: f64,
}

struct FsmState {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    rolling_window: VecDeque<bool>,
    stats: CircuitBreakerStats,
}

type StateChangeCallback = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    fsm: Mutex<FsmState>,
    callbacks: Mutex<Vec<StateChangeCallback>>,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            fsm: Mutex::new(FsmState {
                state: CircuitState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                consecutive_successes: 0,
                rolling_window: VecDeque::new(),
                stats: CircuitBreakerStats::default(),
            }),
            callbacks: Mutex::new(Vec::new()),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.fsm.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        self.fsm.lock().stats.clone()
    }

    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Box::new(callback));
    }

    fn transition_to(fsm: &mut FsmState, new_state: CircuitState) -> Option<(CircuitState, CircuitState)> {
        if fsm.state == new_state {
            return None;
        }
        let old = fsm.state;
        fsm.state = new_state;
        fsm.consecutive_failures = 0;
        fsm.consecutive_successes = 0;
        match new_state {
            CircuitState::Open => {
                fsm.opened_at = Some(Instant::now());
                fsm.stats.open_count += 1;
            }
            CircuitState::HalfOpen => fsm.stats.half_open_count += 1,
            CircuitState::Closed => fsm.stats.close_count += 1,
        }
        Some((old, new_state))
    }

    fn fire_state_change(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((old, new)) = transition {
            info!(?old, ?new, "circuit breaker state change");
            for cb in self.callbacks.lock().iter() {
                cb(old, new);
            }
        }
    }

    fn should_open(fsm: &FsmState, config: &CircuitBreakerConfig) -> bool {
        if config.rolling_window_size > 0 {
            if fsm.rolling_window.len() < config.minimum_request_threshold {
                return false;
            }
            let failures = fsm.rolling_window.iter().filter(|&&ok| !ok).count();
            let rate = failures as f64 / fsm.rolling_window.len() as f64;
            rate >= config.failure_rate_threshold
        } else {
            fsm.consecutive_failures >= config.failure_threshold
        }
    }

    fn push_outcome(fsm: &mut FsmState, config: &CircuitBreakerConfig, success: bool) {
        if config.rolling_window_size > 0 {
            fsm.rolling_window.push_back(success);
            while fsm.rolling_window.len() > config.rolling_window_size {
                fsm.rolling_window.pop_front();
            }
            let failures = fsm.rolling_window.iter().filter(|&&ok| !ok).count();
            fsm.stats.current_failure_rate = failures as f64 / fsm.rolling_window.len().max(1) as f64;
        }
    }

    /// Checks whether the breaker should auto-transition OPEN -> HALF_OPEN
    /// and whether a request is currently allowed through at all.
    pub fn allows_requests(&self) -> bool {
        let (allowed, transition) = {
            let mut fsm = self.fsm.lock();
            let transition = self.maybe_auto_half_open(&mut fsm);
            (fsm.state != CircuitState::Open, transition)
        };
        self.fire_state_change(transition);
        allowed
    }

    fn maybe_auto_half_open(&self, fsm: &mut FsmState) -> Option<(CircuitState, CircuitState)> {
        if fsm.state == CircuitState::Open {
            if let Some(opened_at) = fsm.opened_at {
                if opened_at.elapsed() >= self.config.open_timeout {
                    return Self::transition_to(fsm, CircuitState::HalfOpen);
                }
            }
        }
        None
    }

    fn handle_success(&self) {
        let transition = {
            let mut fsm = self.fsm.lock();
            fsm.stats.total_successes += 1;
            fsm.consecutive_failures = 0;
            fsm.consecutive_successes += 1;
            Self::push_outcome(&mut fsm, &self.config, true);

            match fsm.state {
                CircuitState::Closed => {
                    if self.config.rolling_window_size > 0 && Self::should_open(&fsm, &self.config) {
                        Self::transition_to(&mut fsm, CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if fsm.consecutive_successes >= self.config.success_threshold {
                        Self::transition_to(&mut fsm, CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.fire_state_change(transition);
    }

    fn handle_failure(&self) {
        let transition = {
            let mut fsm = self.fsm.lock();
            fsm.stats.total_failures += 1;
            fsm.consecutive_successes = 0;
            fsm.consecutive_failures += 1;
            Self::push_outcome(&mut fsm, &self.config, false);

            match fsm.state {
                CircuitState::Closed => {
                    if Self::should_open(&fsm, &self.config) {
                        Self::transition_to(&mut fsm, CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => Self::transition_to(&mut fsm, CircuitState::Open),
                CircuitState::Open => None,
            }
        };
        self.fire_state_change(transition);
    }

    pub fn record_success(&self) {
        self.handle_success();
    }

    pub fn record_failure(&self) {
        self.handle_failure();
    }

    pub fn reset(&self) {
        let transition = {
            let mut fsm = self.fsm.lock();
            let t = Self::transition_to(&mut fsm, CircuitState::Closed);
            fsm.rolling_window.clear();
            t
        };
        self.fire_state_change(transition);
    }

    pub fn force_open(&self) {
        let transition = Self::transition_to(&mut self.fsm.lock(), CircuitState::Open);
        self.fire_state_change(transition);
    }

    pub fn force_half_open(&self) {
        let transition = Self::transition_to(&mut self.fsm.lock(), CircuitState::HalfOpen);
        self.fire_state_change(transition);
    }

    /// Runs `op` if the breaker allows it; otherwise rejects fast with
    /// `CircuitOpen` without invoking `op` at all.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, ReliabilityError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ReliabilityError>>,
    {
        if !self.allows_requests() {
            self.rejections.fetch_add(1, Ordering::SeqCst);
            self.fsm.lock().stats.total_rejections += 1;
            warn!("circuit breaker open, rejecting call");
            return Err(ReliabilityError::CircuitOpen);
        }

        match op().await {
            Ok(value) => {
                self.handle_success();
                Ok(value)
            }
            Err(e) => {
                self.handle_failure();
                Err(e)
            }
        }
    }
}
