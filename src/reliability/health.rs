//! Active (ping) + passive (sliding-window) per-endpoint health (spec
//! §4.12). Default config values and stats field set are taken verbatim
//! from the CDMF original's `health_checker.h`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckStrategy {
    TcpConnect,
    ApplicationPing,
    PassiveMonitoring,
    Custom,
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub strategy: HealthCheckStrategy,
    pub check_interval: Duration,
    pub check_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    pub enable_active_checks: bool,
    pub enable_passive_monitoring: bool,
    pub passive_window_size: usize,
    pub degraded_threshold: f64,
    pub unhealthy_failure_rate: f64,
    pub min_requests_for_rate: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            strategy: HealthCheckStrategy::ApplicationPing,
            check_interval: Duration::from_millis(30_000),
            check_timeout: Duration::from_millis(5_000),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            enable_active_checks: true,
            enable_passive_monitoring: true,
            passive_window_size: 100,
            degraded_threshold: 0.1,
            unhealthy_failure_rate: 0.5,
            min_requests_for_rate: 10,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct HealthCheckStats {
    pub current_status: Option<HealthStatus>,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub current_failure_rate: f64,
    pub avg_check_latency: Duration,
    pub last_check_latency: Duration,
}

/// A user-supplied active check, e.g. a TCP connect probe or an
/// application-level heartbeat round-trip. `Custom` strategies delegate
/// entirely to this.
#[async_trait]
pub trait ActiveCheck: Send + Sync {
    async fn check(&self, timeout: Duration) -> bool;
}

type StatusChangeCallback = Box<dyn Fn(HealthStatus, HealthStatus) + Send + Sync>;

struct CheckerState {
    status: HealthStatus,
    passive_window: VecDeque<bool>,
    stats: HealthCheckStats,
    latency_sum: Duration,
}

pub struct HealthChecker {
    config: HealthCheckConfig,
    state: Mutex<CheckerState>,
    callbacks: Mutex<Vec<StatusChangeCallback>>,
    check: Option<Arc<dyn ActiveCheck>>,
    active_loop: Mutex<Option<JoinHandle<()>>>,
    stop_notify: Arc<Notify>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, check: Option<Arc<dyn ActiveCheck>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(CheckerState {
                status: HealthStatus::Unknown,
                passive_window: VecDeque::new(),
                stats: HealthCheckStats::default(),
                latency_sum: Duration::ZERO,
            }),
            callbacks: Mutex::new(Vec::new()),
            check,
            active_loop: Mutex::new(None),
            stop_notify: Arc::new(Notify::new()),
        })
    }

    pub fn status(&self) -> HealthStatus {
        self.state.lock().status
    }

    pub fn stats(&self) -> HealthCheckStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.current_status = Some(state.status);
        stats
    }

    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(HealthStatus, HealthStatus) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Box::new(callback));
    }

    fn set_status(&self, new_status: HealthStatus) {
        let old = {
            let mut state = self.state.lock();
            if state.status == new_status {
                return;
            }
            let old = state.status;
            state.status = new_status;
            old
        };
        info!(?old, new = ?new_status, "health status change");
        for cb in self.callbacks.lock().iter() {
            cb(old, new_status);
        }
    }

    /// Runs one active check (per `strategy`) and applies the active
    /// transition rules (spec §4.12).
    pub async fn check_now(&self) -> bool {
        let start = Instant::now();
        let success = match self.config.strategy {
            HealthCheckStrategy::PassiveMonitoring => {
                // Not an active check: report healthy unless the passive
                // window already says otherwise.
                return self.status() != HealthStatus::Unhealthy;
            }
            _ => match &self.check {
                Some(check) => check.check(self.config.check_timeout).await,
                None => false,
            },
        };
        let latency = start.elapsed();
        self.record_active_outcome(success, latency);
        success
    }

    fn record_active_outcome(&self, success: bool, latency: Duration) {
        let previously_unhealthy;
        let previously_healthy;
        let new_status;
        {
            let mut state = self.state.lock();
            state.stats.total_checks += 1;
            state.stats.last_check_latency = latency;
            state.latency_sum += latency;
            state.stats.avg_check_latency = state.latency_sum / state.stats.total_checks as u32;

            previously_unhealthy = state.status == HealthStatus::Unhealthy;
            previously_healthy = state.status == HealthStatus::Healthy;

            if success {
                state.stats.successful_checks += 1;
                state.stats.consecutive_successes += 1;
                state.stats.consecutive_failures = 0;
                new_status = if state.stats.consecutive_successes >= self.config.healthy_threshold {
                    HealthStatus::Healthy
                } else if previously_unhealthy {
                    HealthStatus::Degraded
                } else {
                    state.status
                };
            } else {
                state.stats.failed_checks += 1;
                state.stats.consecutive_failures += 1;
                state.stats.consecutive_successes = 0;
                new_status = if state.stats.consecutive_failures >= self.config.unhealthy_threshold {
                    HealthStatus::Unhealthy
                } else if previously_healthy {
                    HealthStatus::Degraded
                } else {
                    state.status
                };
            }
        }
        self.set_status(new_status);
    }

    /// Passive outcome feed: appends to the sliding window and recomputes
    /// status once enough samples exist.
    pub fn record_success(&self) {
        self.record_passive(true);
    }

    pub fn record_failure(&self) {
        self.record_passive(false);
    }

    fn record_passive(&self, success: bool) {
        if !self.config.enable_passive_monitoring {
            return;
        }
        let new_status = {
            let mut state = self.state.lock();
            state.passive_window.push_back(success);
            while state.passive_window.len() > self.config.passive_window_size {
                state.passive_window.pop_front();
            }
            if state.passive_window.len() < self.config.min_requests_for_rate {
                return;
            }
            let failures = state.passive_window.iter().filter(|&&ok| !ok).count();
            let rate = failures as f64 / state.passive_window.len() as f64;
            state.stats.current_failure_rate = rate;
            if rate >= self.config.unhealthy_failure_rate {
                HealthStatus::Unhealthy
            } else if rate >= self.config.degraded_threshold {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        };
        self.set_status(new_status);
    }

    /// Starts the active-check background loop, ticking every
    /// `check_interval`. No-op if active checks are disabled.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enable_active_checks {
            return;
        }
        let this = self.clone();
        let stop_notify = self.stop_notify.clone();
        let interval = self.config.check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.check_now().await;
                    }
                    _ = stop_notify.notified() => break,
                }
            }
        });
        *self.active_loop.lock() = Some(handle);
    }

    /// Stops the active-check loop, joining with a bounded timeout. On
    /// timeout the task is logged as abandoned and shutdown proceeds
    /// without blocking (DESIGN.md Open Question 2).
    pub async fn stop(&self, join_timeout: Duration) {
        self.stop_notify.notify_one();
        let handle = self.active_loop.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(join_timeout, handle).await.is_err() {
                warn!("health checker active loop did not stop within timeout; abandoning");
            }
        }
    }
}
