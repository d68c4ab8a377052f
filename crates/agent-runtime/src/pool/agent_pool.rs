//! Pool of reusable agent workers
//!
//! Agents are expensive to construct (process spawn, model warm-up, session
//! setup), so the pool keeps a bounded population alive and hands them out
//! for repeated use. The idle set is a bounded channel: acquire pops in O(1),
//! release pushes in O(1), and the channel itself is the only coordination
//! primitive on the handoff path. A background reaper reclaims workers that
//! sat idle too long or outlived their maximum lifetime.
//!
//! Acquisition runs three phases strictly in order: a non-blocking pop from
//! the idle queue, a CAS-guarded creation while below capacity, and a
//! deadline-bounded blocking wait.

use crate::agent::{Agent, AgentInput, AgentOutput, AgentResult};
use crate::errors::{CoreError, Result};
use crate::stats::{percentage, AtomicAverage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default maximum pool population
pub const DEFAULT_MAX_SIZE: usize = 50;
/// Default idle timeout before a worker becomes a reap candidate
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default maximum worker lifetime
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);
/// Default acquire deadline
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default reaper period
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Factory producing the agents the pool manages
#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Create one agent worker
    async fn create(&self) -> AgentResult<Arc<dyn Agent>>;
}

/// Closure adapter for [`AgentFactory`]
pub struct FnFactory<F>(F);

/// Wrap an async closure as an [`AgentFactory`]
pub fn factory_fn<F, Fut>(f: F) -> FnFactory<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = AgentResult<Arc<dyn Agent>>> + Send,
{
    FnFactory(f)
}

#[async_trait]
impl<F, Fut> AgentFactory for FnFactory<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = AgentResult<Arc<dyn Agent>>> + Send,
{
    async fn create(&self) -> AgentResult<Arc<dyn Agent>> {
        (self.0)().await
    }
}

/// Configuration for the agent pool
#[derive(Debug, Clone)]
pub struct AgentPoolConfig {
    /// Workers pre-created at construction; clamped to `[0, max_size]`
    pub initial_size: usize,
    /// Hard upper bound on the population
    pub max_size: usize,
    /// Idle age past which a worker becomes a reap candidate
    pub idle_timeout: Duration,
    /// Total age past which a worker is reaped even if recently used
    pub max_lifetime: Duration,
    /// Maximum blocking time for a single acquire
    pub acquire_timeout: Duration,
    /// Period of the background reaper
    pub cleanup_interval: Duration,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 0,
            max_size: DEFAULT_MAX_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl AgentPoolConfig {
    /// Create a new pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers pre-created at construction
    pub fn initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    /// Set the maximum population
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum worker lifetime
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set the acquire deadline
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the reaper period
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Out-of-range values fall back to defaults; `initial_size` is clamped
    /// into `[0, max_size]`.
    fn normalized(mut self) -> Self {
        if self.max_size == 0 {
            self.max_size = DEFAULT_MAX_SIZE;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        if self.max_lifetime.is_zero() {
            self.max_lifetime = DEFAULT_MAX_LIFETIME;
        }
        if self.acquire_timeout.is_zero() {
            self.acquire_timeout = DEFAULT_ACQUIRE_TIMEOUT;
        }
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = DEFAULT_CLEANUP_INTERVAL;
        }
        self.initial_size = self.initial_size.min(self.max_size);
        self
    }
}

/// Mutable worker bookkeeping, guarded by the worker's own lock
struct WorkerState {
    in_use: bool,
    last_used_at: Instant,
}

/// One pooled worker wrapping an agent
struct Worker {
    id: u64,
    agent: Arc<dyn Agent>,
    created_at: Instant,
    state: Mutex<WorkerState>,
}

/// Handle to an acquired worker
///
/// The handle must be given back with [`AgentPool::release`] (or implicitly
/// through [`AgentPool::execute`]) before the worker can be handed out again.
pub struct PooledAgent {
    id: u64,
    agent: Arc<dyn Agent>,
}

impl PooledAgent {
    /// Worker identifier, unique within the pool
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The wrapped agent
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    /// Invoke the wrapped agent
    pub async fn invoke(&self, input: AgentInput) -> AgentResult<AgentOutput> {
        self.agent.invoke(input).await
    }
}

impl std::fmt::Debug for PooledAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAgent")
            .field("id", &self.id)
            .field("agent", &self.agent.name())
            .finish()
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total_count: usize,
    pub active_count: usize,
    pub idle_count: usize,
    pub max_size: usize,
    pub created_total: u64,
    pub acquired_total: u64,
    pub released_total: u64,
    pub recycled_total: u64,
    pub wait_count: u64,
    pub avg_wait_time: Duration,
    pub utilization_pct: f64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AgentPool: {}/{} agents ({} active, {} idle, {:.1}% utilized)",
            self.total_count, self.max_size, self.active_count, self.idle_count, self.utilization_pct
        )
    }
}

struct PoolInner {
    config: AgentPoolConfig,
    factory: Box<dyn AgentFactory>,
    /// Idle handoff queue; the sender is taken on close so waiters drain out
    idle_tx: Mutex<Option<mpsc::Sender<u64>>>,
    idle_rx: tokio::sync::Mutex<mpsc::Receiver<u64>>,
    /// O(1) release lookup
    workers: RwLock<HashMap<u64, Arc<Worker>>>,
    /// Registry of all workers, for reaping and statistics
    registry: RwLock<Vec<Arc<Worker>>>,
    current_size: AtomicUsize,
    next_worker_id: AtomicU64,
    closed: AtomicBool,
    shutdown: Notify,

    created_total: AtomicU64,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
    recycled_total: AtomicU64,
    wait_time: AtomicAverage,
}

/// Bounded pool of reusable agent workers
pub struct AgentPool {
    inner: Arc<PoolInner>,
    reaper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Clone for AgentPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            reaper: Arc::clone(&self.reaper),
        }
    }
}

impl AgentPool {
    /// Create a pool, pre-populating `initial_size` workers
    ///
    /// Factory errors during pre-population surface here.
    pub async fn new<F>(factory: F, config: AgentPoolConfig) -> Result<Self>
    where
        F: AgentFactory + 'static,
    {
        let config = config.normalized();
        let (idle_tx, idle_rx) = mpsc::channel(config.max_size);
        let initial = config.initial_size;

        let inner = Arc::new(PoolInner {
            config,
            factory: Box::new(factory),
            idle_tx: Mutex::new(Some(idle_tx)),
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            workers: RwLock::new(HashMap::new()),
            registry: RwLock::new(Vec::new()),
            current_size: AtomicUsize::new(0),
            next_worker_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            created_total: AtomicU64::new(0),
            acquired_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
            recycled_total: AtomicU64::new(0),
            wait_time: AtomicAverage::default(),
        });

        for _ in 0..initial {
            if !inner.try_reserve_slot() {
                break;
            }
            match inner.create_worker(false).await {
                Ok(worker) => inner.push_idle(worker.id),
                Err(err) => {
                    inner.current_size.fetch_sub(1, Ordering::AcqRel);
                    return Err(err);
                }
            }
        }

        let reaper = spawn_reaper(&inner);
        info!(
            max_size = inner.config.max_size,
            initial_size = initial,
            "agent pool started"
        );

        Ok(Self {
            inner,
            reaper: Arc::new(Mutex::new(Some(reaper))),
        })
    }

    /// Create a pool with the default configuration
    pub async fn with_defaults<F>(factory: F) -> Result<Self>
    where
        F: AgentFactory + 'static,
    {
        Self::new(factory, AgentPoolConfig::default()).await
    }

    /// Acquire a worker, blocking up to the configured acquire timeout
    pub async fn acquire(&self) -> Result<PooledAgent> {
        self.acquire_with_timeout(self.inner.config.acquire_timeout)
            .await
    }

    /// Acquire a worker with a caller-supplied deadline
    ///
    /// Use this to compose a tighter deadline than the pool-wide
    /// `acquire_timeout`.
    pub async fn acquire_with_timeout(&self, timeout: Duration) -> Result<PooledAgent> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(CoreError::PoolClosed);
        }

        // Phase 1: non-blocking pop from the idle queue.
        if let Some(handle) = inner.try_pop_idle() {
            inner.acquired_total.fetch_add(1, Ordering::Relaxed);
            return Ok(handle);
        }

        // Phase 2: create while below capacity. The CAS on current_size is
        // the only admission control, so two racing acquirers cannot both
        // create the last slot.
        if inner.try_reserve_slot() {
            match inner.create_worker(true).await {
                Ok(worker) => {
                    inner.acquired_total.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledAgent {
                        id: worker.id,
                        agent: Arc::clone(&worker.agent),
                    });
                }
                Err(err) => {
                    inner.current_size.fetch_sub(1, Ordering::AcqRel);
                    warn!(error = %err, "agent factory failed, waiting for an idle agent instead");
                }
            }
        }

        // Phase 3: blocking wait on the idle queue.
        let started = Instant::now();
        let waited = tokio::time::timeout(timeout, inner.wait_for_idle()).await;
        inner.wait_time.record(started.elapsed());
        match waited {
            Ok(Ok(handle)) => {
                inner.acquired_total.fetch_add(1, Ordering::Relaxed);
                Ok(handle)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(CoreError::PoolTimeout(timeout)),
        }
    }

    /// Return a worker to the pool
    pub fn release(&self, handle: &PooledAgent) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(CoreError::PoolClosed);
        }

        let worker = inner.lookup(handle.id).ok_or(CoreError::AgentNotInPool)?;
        {
            let mut state = worker.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.in_use {
                return Err(CoreError::AgentNotInUse);
            }
            state.in_use = false;
            state.last_used_at = Instant::now();
        }
        inner.released_total.fetch_add(1, Ordering::Relaxed);
        inner.push_idle(handle.id);
        Ok(())
    }

    /// Acquire, invoke, and release in one call
    pub async fn execute(&self, input: AgentInput) -> Result<AgentOutput> {
        let worker = self.acquire().await?;
        let result = worker.agent.invoke(input).await;
        if let Err(err) = self.release(&worker) {
            warn!(worker_id = worker.id, error = %err, "release after execute failed");
        }
        result.map_err(CoreError::from)
    }

    /// Snapshot pool statistics
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let registry = inner.registry.read().unwrap_or_else(|e| e.into_inner());
        let total = registry.len();
        let active = registry
            .iter()
            .filter(|w| w.state.lock().unwrap_or_else(|e| e.into_inner()).in_use)
            .count();
        PoolStats {
            total_count: total,
            active_count: active,
            idle_count: total - active,
            max_size: inner.config.max_size,
            created_total: inner.created_total.load(Ordering::Relaxed),
            acquired_total: inner.acquired_total.load(Ordering::Relaxed),
            released_total: inner.released_total.load(Ordering::Relaxed),
            recycled_total: inner.recycled_total.load(Ordering::Relaxed),
            wait_count: inner.wait_time.samples(),
            avg_wait_time: inner.wait_time.average(),
            utilization_pct: percentage(active as u64, inner.config.max_size as u64),
        }
    }

    /// Whether the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the pool: wake all waiters, stop the reaper, drain the idle set
    ///
    /// Idempotent; subsequent `acquire`/`release` return
    /// [`CoreError::PoolClosed`]. In-flight invocations complete.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.notify_waiters();

        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }

        // Dropping the sender unblocks any waiter still parked on recv.
        let tx = inner
            .idle_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(tx);

        let mut rx = inner.idle_rx.lock().await;
        while rx.try_recv().is_ok() {}

        info!("agent pool closed");
    }
}

impl PoolInner {
    /// Reserve one population slot via CAS; false when at capacity
    fn try_reserve_slot(&self) -> bool {
        let mut size = self.current_size.load(Ordering::Acquire);
        loop {
            if size >= self.config.max_size {
                return false;
            }
            match self.current_size.compare_exchange_weak(
                size,
                size + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => size = observed,
            }
        }
    }

    /// Run the factory and register the new worker; the caller must already
    /// hold a reserved slot
    async fn create_worker(&self, in_use: bool) -> Result<Arc<Worker>> {
        let agent = self.factory.create().await.map_err(CoreError::Factory)?;
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed) + 1;
        let worker = Arc::new(Worker {
            id,
            agent,
            created_at: Instant::now(),
            state: Mutex::new(WorkerState {
                in_use,
                last_used_at: Instant::now(),
            }),
        });

        self.workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&worker));
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&worker));
        self.created_total.fetch_add(1, Ordering::Relaxed);
        debug!(
            worker_id = id,
            total = self.current_size.load(Ordering::Acquire),
            "created pooled agent"
        );
        Ok(worker)
    }

    fn lookup(&self, id: u64) -> Option<Arc<Worker>> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Mark a worker in-use and hand out a handle; None when the worker was
    /// reaped or is already in use
    fn checkout(&self, id: u64) -> Option<PooledAgent> {
        let worker = self.lookup(id)?;
        let mut state = worker.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.in_use {
            return None;
        }
        state.in_use = true;
        state.last_used_at = Instant::now();
        Some(PooledAgent {
            id,
            agent: Arc::clone(&worker.agent),
        })
    }

    /// Non-blocking pop; skips ids left stale by the reaper
    fn try_pop_idle(&self) -> Option<PooledAgent> {
        let mut rx = self.idle_rx.try_lock().ok()?;
        while let Ok(id) = rx.try_recv() {
            if let Some(handle) = self.checkout(id) {
                return Some(handle);
            }
        }
        None
    }

    /// Blocking pop, racing pool shutdown
    async fn wait_for_idle(&self) -> Result<PooledAgent> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(CoreError::PoolClosed);
            }
            tokio::select! {
                _ = self.shutdown.notified() => return Err(CoreError::PoolClosed),
                popped = async { self.idle_rx.lock().await.recv().await } => {
                    match popped {
                        Some(id) => {
                            if self.closed.load(Ordering::Acquire) {
                                return Err(CoreError::PoolClosed);
                            }
                            if let Some(handle) = self.checkout(id) {
                                return Ok(handle);
                            }
                            // Reaped while queued; keep waiting.
                        }
                        None => return Err(CoreError::PoolClosed),
                    }
                }
            }
        }
    }

    /// Push a worker id onto the idle queue
    ///
    /// A full queue cannot happen while the population invariant holds, but a
    /// failed push only delays the worker until the reaper reclaims it.
    fn push_idle(&self, id: u64) {
        let tx = self
            .idle_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match tx {
            Some(tx) => {
                if tx.try_send(id).is_err() {
                    warn!(worker_id = id, "idle queue rejected worker; leaving it for the reaper");
                }
            }
            None => debug!(worker_id = id, "pool closed; dropping idle worker"),
        }
    }

    /// Reclaim expired workers: over max lifetime, or idle past the idle
    /// timeout while the population exceeds `initial_size`
    fn reap(&self) {
        let now = Instant::now();
        let snapshot: Vec<Arc<Worker>> = self
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut idle_allowance = self
            .current_size
            .load(Ordering::Acquire)
            .saturating_sub(self.config.initial_size);
        let mut reaped = Vec::new();

        for worker in snapshot {
            let mut state = worker.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.in_use {
                continue;
            }
            let lifetime_expired =
                now.duration_since(worker.created_at) > self.config.max_lifetime;
            let idle_expired = idle_allowance > 0
                && now.duration_since(state.last_used_at) > self.config.idle_timeout;
            if !(lifetime_expired || idle_expired) {
                continue;
            }
            // Claim the worker so a racing acquire skips its queued id.
            state.in_use = true;
            drop(state);
            idle_allowance = idle_allowance.saturating_sub(1);
            reaped.push(worker);
        }

        if reaped.is_empty() {
            return;
        }

        {
            let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            for worker in &reaped {
                workers.remove(&worker.id);
                registry.retain(|w| w.id != worker.id);
                self.current_size.fetch_sub(1, Ordering::AcqRel);
                self.recycled_total.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(count = reaped.len(), "reaped stale agents");
    }
}

fn spawn_reaper(inner: &Arc<PoolInner>) -> JoinHandle<()> {
    let weak: Weak<PoolInner> = Arc::downgrade(inner);
    let period = inner.config.cleanup_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let Some(inner) = weak.upgrade() else { break };
            if inner.closed.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = inner.shutdown.notified() => break,
                _ = interval.tick() => {
                    if inner.closed.load(Ordering::Acquire) {
                        break;
                    }
                    inner.reap();
                }
            }
        }
        debug!("agent pool reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentError, FnAgent};
    use std::sync::atomic::AtomicUsize;

    fn echo_factory() -> impl AgentFactory + 'static {
        factory_fn(|| async {
            Ok(Arc::new(FnAgent::new("echo", "echoes the task", |input: AgentInput| async move {
                Ok(AgentOutput::new(format!("echo: {}", input.task)))
            })) as Arc<dyn Agent>)
        })
    }

    fn small_config() -> AgentPoolConfig {
        AgentPoolConfig::new()
            .max_size(2)
            .acquire_timeout(Duration::from_millis(50))
    }

    #[test]
    fn test_config_defaults() {
        let config = AgentPoolConfig::default();
        assert_eq!(config.initial_size, 0);
        assert_eq!(config.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.acquire_timeout, DEFAULT_ACQUIRE_TIMEOUT);
    }

    #[test]
    fn test_config_normalization() {
        let config = AgentPoolConfig::new()
            .max_size(0)
            .initial_size(100)
            .cleanup_interval(Duration::ZERO)
            .normalized();
        assert_eq!(config.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(config.initial_size, DEFAULT_MAX_SIZE);
        assert_eq!(config.cleanup_interval, DEFAULT_CLEANUP_INTERVAL);
    }

    #[tokio::test]
    async fn test_acquire_creates_up_to_max() {
        let pool = AgentPool::new(echo_factory(), small_config()).await.unwrap();

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.id(), second.id());

        let stats = pool.stats();
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.active_count, 2);
        assert_eq!(stats.idle_count, 0);

        pool.release(&first).unwrap();
        pool.release(&second).unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pool = AgentPool::new(echo_factory(), small_config()).await.unwrap();
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();

        let started = Instant::now();
        let third = pool.acquire().await;
        assert!(matches!(third, Err(CoreError::PoolTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(500));

        // After a release the next acquire succeeds immediately.
        pool.release(&first).unwrap();
        let retry = pool.acquire().await.unwrap();
        assert_eq!(retry.id(), first.id());

        pool.release(&retry).unwrap();
        pool.release(&second).unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_released_worker_is_reused() {
        let pool = AgentPool::new(echo_factory(), small_config()).await.unwrap();
        let first = pool.acquire().await.unwrap();
        let id = first.id();
        pool.release(&first).unwrap();

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id, "idle worker should be handed out before creating");
        assert_eq!(pool.stats().created_total, 1);

        pool.release(&again).unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_double_release_fails() {
        let pool = AgentPool::new(echo_factory(), small_config()).await.unwrap();
        let worker = pool.acquire().await.unwrap();
        pool.release(&worker).unwrap();

        let err = pool.release(&worker).unwrap_err();
        assert!(matches!(err, CoreError::AgentNotInUse));

        pool.close().await;
    }

    #[tokio::test]
    async fn test_release_foreign_worker_fails() {
        let pool_a = AgentPool::new(echo_factory(), small_config()).await.unwrap();
        let pool_b = AgentPool::new(echo_factory(), small_config()).await.unwrap();

        let worker = pool_a.acquire().await.unwrap();
        let err = pool_b.release(&worker).unwrap_err();
        assert!(matches!(err, CoreError::AgentNotInPool));

        pool_a.release(&worker).unwrap();
        pool_a.close().await;
        pool_b.close().await;
    }

    #[tokio::test]
    async fn test_execute_invokes_and_releases() {
        let pool = AgentPool::new(echo_factory(), small_config()).await.unwrap();

        let output = pool.execute(AgentInput::new("ping")).await.unwrap();
        assert_eq!(output.content, "echo: ping");

        let stats = pool.stats();
        assert_eq!(stats.active_count, 0);
        assert_eq!(stats.idle_count, 1);
        assert_eq!(stats.acquired_total, 1);
        assert_eq!(stats.released_total, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_execute_surfaces_agent_error_and_releases() {
        let factory = factory_fn(|| async {
            Ok(Arc::new(FnAgent::new("flaky", "always fails", |_| async {
                Err(AgentError::ExecutionFailed("boom".into()))
            })) as Arc<dyn Agent>)
        });
        let pool = AgentPool::new(factory, small_config()).await.unwrap();

        let err = pool.execute(AgentInput::new("t")).await.unwrap_err();
        assert!(matches!(err, CoreError::Agent(AgentError::ExecutionFailed(_))));
        assert_eq!(pool.stats().idle_count, 1, "worker must return after a failed invoke");

        pool.close().await;
    }

    #[tokio::test]
    async fn test_initial_size_pre_creates() {
        let config = AgentPoolConfig::new().initial_size(2).max_size(4);
        let pool = AgentPool::new(echo_factory(), config).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.idle_count, 2);
        assert_eq!(stats.created_total, 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_factory_error_at_construction_surfaces() {
        let factory = factory_fn(|| async {
            Err::<Arc<dyn Agent>, _>(AgentError::ExecutionFailed("no cli".into()))
        });
        let result = AgentPool::new(factory, AgentPoolConfig::new().initial_size(1)).await;
        assert!(matches!(result, Err(CoreError::Factory(_))));
    }

    #[tokio::test]
    async fn test_factory_error_in_acquire_degrades_to_timeout() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_factory = Arc::clone(&calls);
        let factory = factory_fn(move || {
            let calls = Arc::clone(&calls_in_factory);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Arc<dyn Agent>, _>(AgentError::ExecutionFailed("spawn failed".into()))
            }
        });
        let pool = AgentPool::new(factory, small_config()).await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, CoreError::PoolTimeout(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total_count, 0, "failed creation must roll back the slot");

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_respects_initial_size_floor() {
        let config = AgentPoolConfig::new()
            .max_size(4)
            .initial_size(1)
            .idle_timeout(Duration::from_millis(200))
            .cleanup_interval(Duration::from_millis(100));
        let pool = AgentPool::new(echo_factory(), config).await.unwrap();

        // Force creation of the full population, then idle them all.
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(pool.acquire().await.unwrap());
        }
        for handle in &handles {
            pool.release(handle).unwrap();
        }
        assert_eq!(pool.stats().total_count, 4);

        tokio::time::sleep(Duration::from_millis(400)).await;

        let stats = pool.stats();
        assert_eq!(stats.total_count, 1, "reaper must keep initial_size workers");
        assert_eq!(stats.recycled_total, 3);

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_enforces_max_lifetime() {
        let config = AgentPoolConfig::new()
            .max_size(2)
            .initial_size(1)
            .max_lifetime(Duration::from_millis(150))
            .cleanup_interval(Duration::from_millis(50));
        let pool = AgentPool::new(echo_factory(), config).await.unwrap();
        assert_eq!(pool.stats().total_count, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;

        // Max lifetime reaps below initial_size as well.
        assert_eq!(pool.stats().total_count, 0);
        assert!(pool.stats().recycled_total >= 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_acquire() {
        let pool = AgentPool::new(echo_factory(), small_config()).await.unwrap();
        let worker = pool.acquire().await.unwrap();

        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, CoreError::PoolClosed));
        let err = pool.release(&worker).unwrap_err();
        assert!(matches!(err, CoreError::PoolClosed));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_waiters() {
        let pool = AgentPool::new(
            echo_factory(),
            AgentPoolConfig::new()
                .max_size(1)
                .acquire_timeout(Duration::from_secs(30)),
        )
        .await
        .unwrap();
        let held = pool.acquire().await.unwrap();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.close().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CoreError::PoolClosed)));
        drop(held);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_respects_bound() {
        let pool = Arc::new(
            AgentPool::new(
                echo_factory(),
                AgentPoolConfig::new()
                    .max_size(3)
                    .acquire_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap(),
        );

        let mut tasks = Vec::new();
        for i in 0..12 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                let output = pool
                    .execute(AgentInput::new(format!("task-{i}")))
                    .await
                    .unwrap();
                assert!(output.content.starts_with("echo:"));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats();
        assert!(stats.total_count <= 3, "population must stay bounded: {stats}");
        assert_eq!(stats.acquired_total, 12);
        assert_eq!(stats.released_total, 12);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_stats_display() {
        let pool = AgentPool::new(echo_factory(), small_config()).await.unwrap();
        let worker = pool.acquire().await.unwrap();
        let line = pool.stats().to_string();
        assert!(line.contains("1/2 agents"));
        assert!(line.contains("1 active"));
        pool.release(&worker).unwrap();
        pool.close().await;
    }
}
