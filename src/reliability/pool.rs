//! Per-endpoint bounded connection pool with load-balancing, idle/lifetime
//! eviction and acquire-with-timeout (spec §4.13). Default config/stats
//! field sets match the CDMF original's `connection_pool.h`; the four
//! load-balancing strategies are not present in any example repo and are
//! authored directly against that contract (see DESIGN.md).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::collaborators::Transport;
use crate::error::ReliabilityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLoaded,
    Random,
    LeastRecentlyUsed,
}

#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub acquire_timeout: Duration,
    pub max_idle_time: Duration,
    pub eviction_interval: Duration,
    pub max_connection_lifetime: Duration,
    pub validate_on_acquire: bool,
    pub validate_on_release: bool,
    pub load_balancing: LoadBalancingStrategy,
    pub wait_if_exhausted: bool,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 1,
            max_pool_size: 10,
            acquire_timeout: Duration::from_millis(5_000),
            max_idle_time: Duration::from_millis(60_000),
            eviction_interval: Duration::from_millis(30_000),
            max_connection_lifetime: Duration::from_millis(300_000),
            validate_on_acquire: true,
            validate_on_release: false,
            load_balancing: LoadBalancingStrategy::RoundRobin,
            wait_if_exhausted: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is closed")]
    PoolClosed,
    #[error("connection acquire timed out")]
    AcquireTimeout,
    #[error("pool exhausted and not configured to wait")]
    PoolExhausted,
    #[error("connection validation failed")]
    ValidationFailed,
    #[error("connection creation failed: {0}")]
    CreationFailed(ReliabilityError),
}

impl From<PoolError> for ReliabilityError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::PoolClosed => ReliabilityError::Cancelled,
            PoolError::AcquireTimeout => ReliabilityError::AcquireTimeout,
            PoolError::PoolExhausted => ReliabilityError::PoolExhausted,
            PoolError::ValidationFailed => ReliabilityError::Unhealthy,
            PoolError::CreationFailed(inner) => inner,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConnectionPoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub total_acquisitions: u64,
    pub total_releases: u64,
    pub acquire_timeouts: u64,
    pub connections_created: u64,
    pub connections_destroyed: u64,
    pub evictions_idle: u64,
    pub evictions_lifetime: u64,
    pub validation_failures: u64,
    pub avg_acquire_time: Duration,
    pub peak_connections: usize,
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn Transport>, ReliabilityError>;
}

struct Cell {
    id: u64,
    transport: Arc<dyn Transport>,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    use_count: AtomicU64,
    in_use: AtomicBool,
}

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// A claimed connection. Call [`ConnectionPool::release`] when done; the
/// fallback `Drop` impl marks the cell idle without validation, so a
/// forgotten release doesn't leak the slot, it just skips
/// `validate_on_release`.
pub struct PooledConnection {
    cell: Arc<Cell>,
    released: bool,
}

impl PooledConnection {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.cell.transport
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.released {
            self.cell.in_use.store(false, Ordering::SeqCst);
        }
    }
}

pub struct ConnectionPool {
    config: ConnectionPoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    cells: Mutex<Vec<Arc<Cell>>>,
    next_index: AtomicUsize,
    stats: Mutex<ConnectionPoolStats>,
    notify: Arc<Notify>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    stop_maintenance: Arc<Notify>,
}

impl ConnectionPool {
    pub fn new(config: ConnectionPoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            cells: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(0),
            stats: Mutex::new(ConnectionPoolStats::default()),
            notify: Arc::new(Notify::new()),
            maintenance: Mutex::new(None),
            stop_maintenance: Arc::new(Notify::new()),
        })
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.config.acquire_timeout
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        let mut stats = self.stats.lock().clone();
        let cells = self.cells.lock();
        stats.total_connections = cells.len();
        stats.active_connections = cells.iter().filter(|c| c.in_use.load(Ordering::SeqCst)).count();
        stats.idle_connections = stats.total_connections - stats.active_connections;
        stats
    }

    pub async fn prepopulate(&self, n: usize) -> Result<(), PoolError> {
        let target = n.min(self.config.max_pool_size);
        for _ in 0..target {
            if self.cells.lock().len() >= self.config.max_pool_size {
                break;
            }
            self.create_cell().await?;
        }
        Ok(())
    }

    async fn create_cell(&self) -> Result<Arc<Cell>, PoolError> {
        let transport = self.factory.create().await.map_err(PoolError::CreationFailed)?;
        let cell = Arc::new(Cell {
            id: NEXT_CELL_ID.fetch_add(1, Ordering::SeqCst),
            transport,
            created_at: Instant::now(),
            last_used_at: Mutex::new(Instant::now()),
            use_count: AtomicU64::new(0),
            in_use: AtomicBool::new(false),
        });
        self.cells.lock().push(cell.clone());
        let mut stats = self.stats.lock();
        stats.connections_created += 1;
        stats.peak_connections = stats.peak_connections.max(self.cells.lock().len());
        Ok(cell)
    }

    /// `acquire` per spec §4.13: try an idle cell first (via the
    /// configured load-balancing strategy), else grow the pool, else wait
    /// on the notify until `timeout`, else record a timeout.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            if let Some(cell) = self.try_claim_idle().await {
                self.record_acquire(started);
                return Ok(PooledConnection { cell, released: false });
            }

            let at_capacity = self.cells.lock().len() >= self.config.max_pool_size;
            if !at_capacity {
                match self.create_cell().await {
                    Ok(cell) => {
                        cell.in_use.store(true, Ordering::SeqCst);
                        cell.use_count.fetch_add(1, Ordering::SeqCst);
                        self.record_acquire(started);
                        return Ok(PooledConnection { cell, released: false });
                    }
                    Err(e) => return Err(e),
                }
            }

            if !self.config.wait_if_exhausted {
                self.stats.lock().acquire_timeouts += 1;
                return Err(PoolError::PoolExhausted);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.stats.lock().acquire_timeouts += 1;
                return Err(PoolError::AcquireTimeout);
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    fn record_acquire(&self, started: Instant) {
        let elapsed = started.elapsed();
        let mut stats = self.stats.lock();
        stats.total_acquisitions += 1;
        let n = stats.total_acquisitions as u32;
        stats.avg_acquire_time = (stats.avg_acquire_time * (n - 1) + elapsed) / n;
    }

    async fn try_claim_idle(&self) -> Option<Arc<Cell>> {
        let idle: Vec<Arc<Cell>> =
            self.cells.lock().iter().filter(|c| !c.in_use.load(Ordering::SeqCst)).cloned().collect();
        if idle.is_empty() {
            return None;
        }

        let mut candidates = Vec::with_capacity(idle.len());
        for cell in idle {
            let ok = if self.config.validate_on_acquire { cell.transport.is_connected().await } else { true };
            if ok {
                candidates.push(cell);
            } else {
                self.stats.lock().validation_failures += 1;
            }
        }
        if candidates.is_empty() {
            return None;
        }

        let chosen = self.select(&candidates);
        if chosen
            .in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            chosen.use_count.fetch_add(1, Ordering::SeqCst);
            *chosen.last_used_at.lock() = Instant::now();
            Some(chosen)
        } else {
            // Lost the race to another acquirer; caller's loop retries.
            None
        }
    }

    fn select(&self, candidates: &[Arc<Cell>]) -> Arc<Cell> {
        match self.config.load_balancing {
            LoadBalancingStrategy::RoundRobin => {
                let idx = self.next_index.fetch_add(1, Ordering::SeqCst) % candidates.len();
                candidates[idx].clone()
            }
            LoadBalancingStrategy::LeastLoaded => candidates
                .iter()
                .min_by_key(|c| c.use_count.load(Ordering::SeqCst))
                .expect("non-empty")
                .clone(),
            LoadBalancingStrategy::Random => {
                let idx = rand::rng().random_range(0..candidates.len());
                candidates[idx].clone()
            }
            LoadBalancingStrategy::LeastRecentlyUsed => candidates
                .iter()
                .min_by_key(|c| *c.last_used_at.lock())
                .expect("non-empty")
                .clone(),
        }
    }

    /// Marks `conn`'s cell idle, optionally validating and destroying it if
    /// invalid, then wakes one waiter.
    pub async fn release(&self, mut conn: PooledConnection) {
        conn.released = true;
        let cell = conn.cell.clone();

        let mut destroy = false;
        if self.config.validate_on_release && !cell.transport.is_connected().await {
            destroy = true;
            self.stats.lock().validation_failures += 1;
        }

        if destroy {
            self.cells.lock().retain(|c| c.id != cell.id);
            cell.transport.disconnect().await;
            self.stats.lock().connections_destroyed += 1;
        } else {
            cell.in_use.store(false, Ordering::SeqCst);
        }
        self.stats.lock().total_releases += 1;
        self.notify.notify_one();
    }

    /// One maintenance pass: idle eviction only once `total > min_pool_size`,
    /// lifetime eviction unconditionally for idle cells past their TTL.
    pub async fn run_maintenance_once(&self) {
        let now = Instant::now();
        let to_evict: Vec<Arc<Cell>> = {
            let cells = self.cells.lock();
            let total = cells.len();
            cells
                .iter()
                .filter(|c| {
                    if c.in_use.load(Ordering::SeqCst) {
                        return false;
                    }
                    let idle_expired =
                        total > self.config.min_pool_size && now.duration_since(*c.last_used_at.lock()) >= self.config.max_idle_time;
                    let lifetime_expired = now.duration_since(c.created_at) >= self.config.max_connection_lifetime;
                    idle_expired || lifetime_expired
                })
                .cloned()
                .collect()
        };

        if to_evict.is_empty() {
            return;
        }
        let evict_ids: std::collections::HashSet<u64> = to_evict.iter().map(|c| c.id).collect();
        self.cells.lock().retain(|c| !evict_ids.contains(&c.id));
        for cell in &to_evict {
            cell.transport.disconnect().await;
        }
        let mut stats = self.stats.lock();
        stats.connections_destroyed += to_evict.len() as u64;
        debug!(count = to_evict.len(), "pool maintenance evicted connections");
    }

    pub fn start_maintenance(self: &Arc<Self>) {
        let this = self.clone();
        let stop = self.stop_maintenance.clone();
        let interval = self.config.eviction_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.run_maintenance_once().await,
                    _ = stop.notified() => break,
                }
            }
        });
        *self.maintenance.lock() = Some(handle);
    }

    /// Stops the maintenance task (joining it) and then closes every
    /// connection, per spec §4.13's shutdown ordering.
    pub async fn shutdown(&self) {
        self.stop_maintenance.notify_one();
        if let Some(handle) = self.maintenance.lock().take() {
            let _ = handle.await;
        }
        let cells = self.cells.lock().drain(..).collect::<Vec<_>>();
        for cell in cells {
            cell.transport.disconnect().await;
        }
        warn!("connection pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct FakeTransport {
        connected: AtomicBool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self) -> Result<(), ReliabilityError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn send(&self, _payload: &[u8]) -> Result<(), ReliabilityError> {
            Ok(())
        }
        async fn receive(&self) -> Result<Vec<u8>, ReliabilityError> {
            Ok(Vec::new())
        }
    }

    struct CountingFactory {
        created: Arc<StdAtomicUsize>,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        async fn create(&self) -> Result<Arc<dyn Transport>, ReliabilityError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeTransport { connected: AtomicBool::new(true) }))
        }
    }

    #[tokio::test]
    async fn acquire_creates_up_to_max_then_reuses() {
        let created = Arc::new(StdAtomicUsize::new(0));
        let pool = ConnectionPool::new(
            ConnectionPoolConfig { max_pool_size: 2, ..ConnectionPoolConfig::default() },
            Arc::new(CountingFactory { created: created.clone() }),
        );
        let a = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        pool.release(a).await;
        let c = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2); // reused `a`'s cell
        pool.release(b).await;
        pool.release(c).await;
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted_and_not_waiting() {
        let created = Arc::new(StdAtomicUsize::new(0));
        let pool = ConnectionPool::new(
            ConnectionPoolConfig { max_pool_size: 1, wait_if_exhausted: false, ..ConnectionPoolConfig::default() },
            Arc::new(CountingFactory { created }),
        );
        let _a = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let result = pool.acquire(Duration::from_millis(0)).await;
        assert!(matches!(result, Err(PoolError::PoolExhausted)));
    }

    #[tokio::test]
    async fn round_robin_cycles_through_prepopulated_connections() {
        let created = Arc::new(StdAtomicUsize::new(0));
        let pool = ConnectionPool::new(
            ConnectionPoolConfig { max_pool_size: 3, load_balancing: LoadBalancingStrategy::RoundRobin, ..ConnectionPoolConfig::default() },
            Arc::new(CountingFactory { created: created.clone() }),
        );
        pool.prepopulate(3).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 3);

        let mut seen = std::collections::HashMap::new();
        for _ in 0..9 {
            let conn = pool.acquire(Duration::from_millis(100)).await.unwrap();
            *seen.entry(conn.cell.id).or_insert(0) += 1;
            pool.release(conn).await;
        }
        assert_eq!(seen.len(), 3);
        for count in seen.values() {
            assert_eq!(*count, 3);
        }
    }
}
