//! Response cache wrapping an agent
//!
//! Identical inputs return previously computed outputs without re-invoking
//! the wrapped agent. Entries are bounded by count and by TTL, and a
//! background expirer sweeps stale entries. Everything stored and everything
//! returned is an owned deep copy; the cache never aliases mutable state
//! with callers.
//!
//! Caching applies to `invoke` only. The rest of the agent surface (name,
//! description, capabilities, stream, batch) delegates to the inner agent.

use crate::agent::{Agent, AgentError, AgentInput, AgentOutput, AgentResult, AgentStream};
use crate::pool::objects;
use crate::stats::{percentage, AtomicAverage};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default maximum number of cached entries
pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;
/// Default entry time-to-live
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
/// Default expirer period
pub const DEFAULT_CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Derives the cache key for an input
pub type KeyGenerator = Box<dyn Fn(&AgentInput) -> String + Send + Sync>;

/// Configuration for the response cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries; insertion at capacity evicts the oldest
    pub max_size: usize,
    /// Entry time-to-live; zero means entries never expire
    pub ttl: Duration,
    /// Period of the background expirer
    pub cleanup_interval: Duration,
    /// Record hit/miss timing
    pub enable_stats: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
            ttl: DEFAULT_CACHE_TTL,
            cleanup_interval: DEFAULT_CACHE_CLEANUP_INTERVAL,
            enable_stats: true,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum entry count
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the entry time-to-live; zero disables expiry
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the expirer period
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Enable or disable hit/miss timing
    pub fn enable_stats(mut self, enable: bool) -> Self {
        self.enable_stats = enable;
        self
    }

    fn normalized(mut self) -> Self {
        if self.max_size == 0 {
            self.max_size = DEFAULT_CACHE_MAX_SIZE;
        }
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = DEFAULT_CACHE_CLEANUP_INTERVAL;
        }
        self
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub avg_hit_time: Duration,
    pub avg_miss_time: Duration,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ResponseCache: {}/{} entries, {} hits, {} misses ({:.1}% hit rate)",
            self.size, self.max_size, self.hits, self.misses, self.hit_rate
        )
    }
}

struct CacheEntry {
    output: AgentOutput,
    created_at: Instant,
    expires_at: Option<Instant>,
    hit_count: AtomicU64,
}

struct CacheShared {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_size: usize,
    ttl: Duration,
    enable_stats: bool,
    closed: AtomicBool,
    shutdown: Notify,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    hit_time: AtomicAverage,
    miss_time: AtomicAverage,
}

impl CacheShared {
    /// Copy out an unexpired entry under the read lock
    ///
    /// The returned output is a deep copy built into a pooled target; the
    /// stored entry is never aliased to callers.
    fn lookup(&self, key: &str) -> Option<AgentOutput> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() > expires_at {
                return None;
            }
        }
        entry.hit_count.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(objects::global().clone_output(&entry.output))
    }

    /// Store a deep copy, evicting the oldest entry at capacity
    fn store(&self, key: String, output: &AgentOutput) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %oldest, "evicted oldest cache entry");
            }
        }
        let now = Instant::now();
        let expires_at = (!self.ttl.is_zero()).then(|| now + self.ttl);
        entries.insert(
            key,
            CacheEntry {
                output: objects::global().clone_output(output),
                created_at: now,
                expires_at,
                hit_count: AtomicU64::new(0),
            },
        );
    }

    /// Drop every entry past its deadline
    fn sweep_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| match entry.expires_at {
            Some(expires_at) => now <= expires_at,
            None => true,
        });
        let removed = before - entries.len();
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = entries.len(), "expired cache entries");
        }
    }
}

/// Caching wrapper around an agent
///
/// Implements [`Agent`] itself so it can replace the wrapped agent anywhere,
/// including inside the worker pool (via a caching factory) or the batch
/// executor.
pub struct ResponseCache<A> {
    agent: A,
    shared: Arc<CacheShared>,
    key_generator: KeyGenerator,
    expirer: Mutex<Option<JoinHandle<()>>>,
}

impl<A: Agent> ResponseCache<A> {
    /// Wrap an agent with the given cache configuration
    ///
    /// Spawns the background expirer, so this must be called within a Tokio
    /// runtime.
    pub fn new(agent: A, config: CacheConfig) -> Self {
        let config = config.normalized();
        let shared = Arc::new(CacheShared {
            entries: RwLock::new(HashMap::new()),
            max_size: config.max_size,
            ttl: config.ttl,
            enable_stats: config.enable_stats,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            hit_time: AtomicAverage::default(),
            miss_time: AtomicAverage::default(),
        });
        let expirer = spawn_expirer(&shared, config.cleanup_interval);
        Self {
            agent,
            shared,
            key_generator: Box::new(default_key),
            expirer: Mutex::new(Some(expirer)),
        }
    }

    /// Wrap an agent with the default configuration
    pub fn with_defaults(agent: A) -> Self {
        Self::new(agent, CacheConfig::default())
    }

    /// Replace the key generator
    pub fn with_key_generator(
        mut self,
        generator: impl Fn(&AgentInput) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_generator = Box::new(generator);
        self
    }

    /// The wrapped agent
    pub fn inner(&self) -> &A {
        &self.agent
    }

    /// Remove the entry for one input; true when an entry was present
    pub fn invalidate(&self, input: &AgentInput) -> bool {
        let key = (self.key_generator)(input);
        self.shared
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
            .is_some()
    }

    /// Drop every cached entry
    pub fn invalidate_all(&self) {
        let mut entries = self
            .shared
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *entries = HashMap::new();
    }

    /// Snapshot cache statistics
    pub fn stats(&self) -> CacheStats {
        let shared = &self.shared;
        let hits = shared.hits.load(Ordering::Relaxed);
        let misses = shared.misses.load(Ordering::Relaxed);
        CacheStats {
            size: shared
                .entries
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            max_size: shared.max_size,
            hits,
            misses,
            hit_rate: percentage(hits, hits + misses),
            evictions: shared.evictions.load(Ordering::Relaxed),
            expirations: shared.expirations.load(Ordering::Relaxed),
            avg_hit_time: shared.hit_time.average(),
            avg_miss_time: shared.miss_time.average(),
        }
    }

    /// Whether the cache has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop the expirer and reject further invocations
    ///
    /// Idempotent. In-flight invocations complete.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.notify_waiters();
        let expirer = self
            .expirer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = expirer {
            let _ = handle.await;
        }
        info!("response cache closed");
    }
}

#[async_trait]
impl<A: Agent> Agent for ResponseCache<A> {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn description(&self) -> &str {
        self.agent.description()
    }

    fn capabilities(&self) -> Vec<String> {
        self.agent.capabilities()
    }

    async fn invoke(&self, input: AgentInput) -> AgentResult<AgentOutput> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(AgentError::Closed);
        }
        let key = (self.key_generator)(&input);
        let started = Instant::now();

        if let Some(output) = self.shared.lookup(&key) {
            if self.shared.enable_stats {
                self.shared.hit_time.record(started.elapsed());
            }
            return Ok(output);
        }

        self.shared.misses.fetch_add(1, Ordering::Relaxed);
        // Errors are never cached; only successful outputs become entries.
        let output = self.agent.invoke(input).await?;
        self.shared.store(key, &output);
        if self.shared.enable_stats {
            self.shared.miss_time.record(started.elapsed());
        }
        Ok(output)
    }

    async fn stream(&self, input: AgentInput) -> AgentResult<AgentStream> {
        self.agent.stream(input).await
    }

    async fn batch(&self, inputs: Vec<AgentInput>) -> AgentResult<Vec<AgentOutput>> {
        self.agent.batch(inputs).await
    }
}

/// SHA-256 fingerprint over the JSON encoding of task, instruction, and
/// context; falls back to `task:instruction` when serialization fails
fn default_key(input: &AgentInput) -> String {
    #[derive(Serialize)]
    struct Fingerprint<'a> {
        task: &'a str,
        instruction: &'a str,
        context: BTreeMap<&'a str, &'a serde_json::Value>,
    }

    let fingerprint = Fingerprint {
        task: &input.task,
        instruction: &input.instruction,
        context: input
            .context
            .iter()
            .map(|(key, value)| (key.as_str(), value))
            .collect(),
    };
    match serde_json::to_vec(&fingerprint) {
        Ok(bytes) => {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())
        }
        Err(_) => format!("{}:{}", input.task, input.instruction),
    }
}

fn spawn_expirer(shared: &Arc<CacheShared>, period: Duration) -> JoinHandle<()> {
    let weak: Weak<CacheShared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let Some(shared) = weak.upgrade() else { break };
            if shared.closed.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = shared.shutdown.notified() => break,
                _ = interval.tick() => {
                    if shared.closed.load(Ordering::Acquire) {
                        break;
                    }
                    shared.sweep_expired();
                }
            }
        }
        debug!("cache expirer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FnAgent;
    use std::sync::atomic::AtomicUsize;

    /// Agent that counts invocations and echoes the task
    fn counted_agent(invocations: Arc<AtomicUsize>) -> impl Agent {
        FnAgent::new("counted", "echoes and counts", move |input: AgentInput| {
            let invocations = Arc::clone(&invocations);
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(AgentOutput::new(format!("reply: {}", input.task))
                    .with_metadata_value("model", serde_json::json!("test")))
            }
        })
    }

    fn same_input() -> AgentInput {
        AgentInput::new("what is the plan")
            .with_instruction("be brief")
            .with_session_id("fixed-session")
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let cache = ResponseCache::new(
            counted_agent(Arc::clone(&invocations)),
            CacheConfig::new().max_size(10).ttl(Duration::from_secs(60)),
        );

        let first = cache.invoke(same_input()).await.unwrap();
        let second = cache.invoke(same_input()).await.unwrap();

        assert_eq!(first.content, second.content);
        assert_eq!(invocations.load(Ordering::SeqCst), 1, "second call must be served from cache");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 50.0);
        assert_eq!(stats.size, 1);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_hit_returns_independent_copy() {
        let cache = ResponseCache::new(
            counted_agent(Arc::new(AtomicUsize::new(0))),
            CacheConfig::new().max_size(10),
        );

        let mut first = cache.invoke(same_input()).await.unwrap();
        first.content.push_str(" MUTATED");
        first.metadata.insert("poison".into(), serde_json::json!(true));

        let second = cache.invoke(same_input()).await.unwrap();
        assert_eq!(second.content, "reply: what is the plan");
        assert!(!second.metadata.contains_key("poison"));

        cache.close().await;
    }

    #[tokio::test]
    async fn test_key_depends_on_task_instruction_context() {
        let a = AgentInput::new("t").with_instruction("i");
        let b = AgentInput::new("t").with_instruction("i");
        let c = AgentInput::new("t").with_instruction("other");
        let d = AgentInput::new("t")
            .with_instruction("i")
            .with_context_value("k", serde_json::json!(1));

        assert_eq!(default_key(&a), default_key(&b), "session id must not affect the key");
        assert_ne!(default_key(&a), default_key(&c));
        assert_ne!(default_key(&a), default_key(&d));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_counts_as_miss() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let cache = ResponseCache::new(
            counted_agent(Arc::clone(&invocations)),
            CacheConfig::new()
                .max_size(10)
                .ttl(Duration::from_secs(1))
                .cleanup_interval(Duration::from_secs(60)),
        );

        let _ = cache.invoke(same_input()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let _ = cache.invoke(same_input()).await.unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 2, "expired entry must not be served");
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 2);

        cache.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expirer_sweeps_in_background() {
        let cache = ResponseCache::new(
            counted_agent(Arc::new(AtomicUsize::new(0))),
            CacheConfig::new()
                .ttl(Duration::from_millis(100))
                .cleanup_interval(Duration::from_millis(50)),
        );

        let _ = cache.invoke(same_input()).await.unwrap();
        assert_eq!(cache.stats().size, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;

        let stats = cache.stats();
        assert_eq!(stats.size, 0, "expirer should have removed the entry");
        assert_eq!(stats.expirations, 1);

        cache.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest_by_creation() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let cache = ResponseCache::new(
            counted_agent(Arc::clone(&invocations)),
            CacheConfig::new().max_size(2).ttl(Duration::ZERO),
        );

        let _ = cache.invoke(AgentInput::new("first")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = cache.invoke(AgentInput::new("second")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = cache.invoke(AgentInput::new("third")).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);

        // "first" was evicted; re-invoking it goes to the agent again.
        let _ = cache.invoke(AgentInput::new("first")).await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
        // "third" survived.
        let _ = cache.invoke(AgentInput::new("third")).await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 4);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let cache = ResponseCache::new(
            counted_agent(Arc::new(AtomicUsize::new(0))),
            CacheConfig::new().ttl(Duration::ZERO),
        );
        let _ = cache.invoke(same_input()).await.unwrap();
        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&invocations);
        let agent = FnAgent::new("flaky", "always fails", move |_| {
            let probe = Arc::clone(&probe);
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
                Err::<AgentOutput, _>(AgentError::ExecutionFailed("boom".into()))
            }
        });
        let cache = ResponseCache::with_defaults(agent);

        assert!(cache.invoke(same_input()).await.is_err());
        assert!(cache.invoke(same_input()).await.is_err());

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().size, 0);
        assert_eq!(cache.stats().misses, 2);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_invalidate_single_and_all() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let cache = ResponseCache::new(
            counted_agent(Arc::clone(&invocations)),
            CacheConfig::new().max_size(10),
        );

        let _ = cache.invoke(AgentInput::new("a")).await.unwrap();
        let _ = cache.invoke(AgentInput::new("b")).await.unwrap();
        assert_eq!(cache.stats().size, 2);

        assert!(cache.invalidate(&AgentInput::new("a")));
        assert!(!cache.invalidate(&AgentInput::new("a")));
        assert_eq!(cache.stats().size, 1);

        cache.invalidate_all();
        assert_eq!(cache.stats().size, 0);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_custom_key_generator() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let cache = ResponseCache::new(
            counted_agent(Arc::clone(&invocations)),
            CacheConfig::new().max_size(10),
        )
        .with_key_generator(|input| input.session_id.clone());

        let _ = cache
            .invoke(AgentInput::new("a").with_session_id("s1"))
            .await
            .unwrap();
        let _ = cache
            .invoke(AgentInput::new("different task").with_session_id("s1"))
            .await
            .unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 1, "same session key must hit");

        cache.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_invoke() {
        let cache = ResponseCache::with_defaults(counted_agent(Arc::new(AtomicUsize::new(0))));
        cache.close().await;
        cache.close().await;
        assert!(cache.is_closed());

        let err = cache.invoke(same_input()).await.unwrap_err();
        assert!(matches!(err, AgentError::Closed));
    }

    #[tokio::test]
    async fn test_delegation_to_inner_agent() {
        let cache = ResponseCache::with_defaults(counted_agent(Arc::new(AtomicUsize::new(0))));
        assert_eq!(cache.name(), "counted");
        assert_eq!(cache.description(), "echoes and counts");
        assert!(cache.capabilities().is_empty());

        let outputs = cache
            .batch(vec![AgentInput::new("x"), AgentInput::new("y")])
            .await
            .unwrap();
        assert_eq!(outputs.len(), 2);

        cache.close().await;
    }

    #[tokio::test]
    async fn test_stats_timing_disabled() {
        let cache = ResponseCache::new(
            counted_agent(Arc::new(AtomicUsize::new(0))),
            CacheConfig::new().enable_stats(false),
        );
        let _ = cache.invoke(same_input()).await.unwrap();
        let _ = cache.invoke(same_input()).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.avg_hit_time, Duration::ZERO);
        assert_eq!(stats.avg_miss_time, Duration::ZERO);
        // Hit/miss counting stays on either way.
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        cache.close().await;
    }
}
