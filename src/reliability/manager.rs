//! Composes C10-C13 per registered endpoint (spec §4.14, §9). `send`
//! gates on health, acquires a pooled connection, sends and records the
//! outcome back into the breaker and health checker; `send_with_retry`
//! wraps that whole sequence in a retry policy with the breaker nested
//! inside the retry closure, matching the original connection manager's
//! call structure exactly (`connection_manager.cpp`).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::collaborators::Transport;
use crate::error::ReliabilityError;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::health::{ActiveCheck, HealthCheckConfig, HealthChecker, HealthStatus};
use super::pool::{ConnectionFactory, ConnectionPool, ConnectionPoolConfig};
use super::retry::{RetryConfig, RetryPolicy};

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub pool: ConnectionPoolConfig,
    pub health: HealthCheckConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pool: ConnectionPoolConfig::default(),
            health: HealthCheckConfig::default(),
        }
    }
}

struct EndpointState {
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    pool: Arc<ConnectionPool>,
    health: Arc<HealthChecker>,
}

/// One `ConnectionManager` per framework; one `EndpointState` per remote
/// endpoint name, looked up via a concurrent map (teacher uses `dashmap`
/// for its connection registry for the same reason: many readers, rare
/// structural writes).
pub struct ConnectionManager {
    endpoints: DashMap<String, Arc<EndpointState>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self { endpoints: DashMap::new() }
    }

    pub fn register_endpoint(
        &self,
        name: &str,
        config: EndpointConfig,
        factory: Arc<dyn ConnectionFactory>,
        active_check: Option<Arc<dyn ActiveCheck>>,
    ) {
        let pool = ConnectionPool::new(config.pool, factory);
        pool.start_maintenance();
        let health = HealthChecker::new(config.health, active_check);
        health.start();
        let state = Arc::new(EndpointState {
            retry: RetryPolicy::new(config.retry),
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker)),
            pool,
            health,
        });
        self.endpoints.insert(name.to_string(), state);
        info!(endpoint = name, "registered connection manager endpoint");
    }

    pub async fn unregister_endpoint(&self, name: &str) {
        if let Some((_, state)) = self.endpoints.remove(name) {
            state.health.stop(Duration::from_secs(5)).await;
            state.pool.shutdown().await;
        }
    }

    fn endpoint(&self, name: &str) -> Result<Arc<EndpointState>, ReliabilityError> {
        self.endpoints.get(name).map(|e| e.clone()).ok_or(ReliabilityError::InvalidConfig)
    }

    pub fn breaker_state(&self, name: &str) -> Option<super::circuit_breaker::CircuitState> {
        self.endpoints.get(name).map(|e| e.breaker.state())
    }

    pub fn health_status(&self, name: &str) -> Option<HealthStatus> {
        self.endpoints.get(name).map(|e| e.health.status())
    }

    /// One attempt: health gate, breaker-wrapped pool-acquire/send/release.
    /// No retry; `send_with_retry` layers that on top.
    pub async fn send(&self, name: &str, payload: &[u8]) -> Result<(), ReliabilityError> {
        let state = self.endpoint(name)?;
        Self::send_once(&state, payload).await
    }

    pub async fn send_with_retry(&self, name: &str, payload: &[u8]) -> Result<(), ReliabilityError> {
        let state = self.endpoint(name)?;
        state.retry.execute(|| Self::send_once(&state, payload)).await
    }

    async fn send_once(state: &Arc<EndpointState>, payload: &[u8]) -> Result<(), ReliabilityError> {
        if state.health.status() == HealthStatus::Unhealthy {
            return Err(ReliabilityError::Unhealthy);
        }

        let pool = state.pool.clone();
        let health = state.health.clone();
        let payload = payload.to_vec();

        state
            .breaker
            .execute(|| async move {
                let timeout = pool.acquire_timeout();
                let conn = pool.acquire(timeout).await.map_err(ReliabilityError::from)?;
                let result = conn.transport().send(&payload).await;
                match &result {
                    Ok(()) => health.record_success(),
                    Err(_) => health.record_failure(),
                }
                pool.release(conn).await;
                result
            })
            .await
    }

    /// Mirrors `send` without the retry wrapper; used for request/response
    /// style collaborators that read back a reply on the same connection.
    pub async fn receive(&self, name: &str) -> Result<Vec<u8>, ReliabilityError> {
        let state = self.endpoint(name)?;
        if state.health.status() == HealthStatus::Unhealthy {
            return Err(ReliabilityError::Unhealthy);
        }

        let pool = state.pool.clone();
        let health = state.health.clone();

        state
            .breaker
            .execute(|| async move {
                let timeout = pool.acquire_timeout();
                let conn = pool.acquire(timeout).await.map_err(ReliabilityError::from)?;
                let result = conn.transport().receive().await;
                match &result {
                    Ok(_) => health.record_success(),
                    Err(_) => health.record_failure(),
                }
                pool.release(conn).await;
                result
            })
            .await
    }

    /// Drains every endpoint: stops health checkers and closes pools. Best
    /// effort per endpoint; the first error encountered is still returned
    /// after every endpoint has been given a chance to stop.
    pub async fn stop(&self) -> Result<(), ReliabilityError> {
        let names: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        let mut first_err = None;
        for name in names {
            if let Some((_, state)) = self.endpoints.remove(&name) {
                state.health.stop(Duration::from_secs(5)).await;
                state.pool.shutdown().await;
            } else {
                warn!(endpoint = name, "endpoint vanished during shutdown");
                first_err.get_or_insert(ReliabilityError::InvalidConfig);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
