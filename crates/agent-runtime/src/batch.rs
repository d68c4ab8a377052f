//! Bounded-concurrency batch execution
//!
//! Runs a vector of inputs against one agent with a fixed worker count. The
//! topology is a producer feeding a bounded work queue, K workers sharing the
//! receiver, and collectors draining index-tagged result/error channels; a
//! batch never spawns one task per item, so memory and scheduler pressure stay
//! flat no matter how large the input vector is.
//!
//! `results[i]` always corresponds to `inputs[i]`. Execution order across
//! indices is unspecified.

use crate::agent::{Agent, AgentError, AgentInput, AgentOutput};
use crate::stats::percentage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Default worker count
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// What to do when an item fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// First error stops dispatch; queued items are drained without executing
    FailFast,
    /// Record every error and keep going
    #[default]
    Continue,
}

/// Configuration for the batch executor
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Worker count; clamped down to the batch size per run
    pub max_concurrency: usize,
    /// Overall deadline for the whole batch
    pub timeout: Option<Duration>,
    /// Per-item failure handling
    pub error_policy: ErrorPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout: None,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl BatchConfig {
    /// Create a new batch configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count
    pub fn max_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = concurrency;
        self
    }

    /// Set the overall deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the error policy
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}

/// Error for one batch item, tagged with its input index
#[derive(Debug)]
pub struct BatchItemError {
    pub index: usize,
    pub error: AgentError,
}

impl std::fmt::Display for BatchItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "item {}: {}", self.index, self.error)
    }
}

/// Statistics for a single batch run
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    /// Wall-clock duration of the whole batch
    pub total_duration: Duration,
    /// Mean per-item latency over successful items
    pub avg_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
}

/// Outcome of one batch run
///
/// `results[i]` holds the output for `inputs[i]`; `None` marks a failed item
/// (its error is in `errors`) or one skipped after a fail-fast stop.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub results: Vec<Option<AgentOutput>>,
    pub errors: Vec<BatchItemError>,
    pub stats: BatchStats,
}

impl BatchResult {
    fn empty(elapsed: Duration) -> Self {
        Self {
            stats: BatchStats {
                total_duration: elapsed,
                ..BatchStats::default()
            },
            ..Self::default()
        }
    }

    /// Number of successful items
    pub fn success_count(&self) -> usize {
        self.stats.success
    }

    /// Whether every item produced an output
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && self.results.iter().all(|r| r.is_some())
    }
}

/// Cumulative executor counters snapshot
#[derive(Debug, Clone, Default)]
pub struct ExecutorStats {
    pub batches_total: u64,
    pub items_total: u64,
    pub success_total: u64,
    pub failure_total: u64,
    pub success_rate: f64,
}

#[derive(Default)]
struct ExecutorCounters {
    batches: AtomicU64,
    items: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Executes batches of inputs against one agent with bounded parallelism
#[derive(Clone, Default)]
pub struct BatchExecutor {
    config: BatchConfig,
    counters: Arc<ExecutorCounters>,
}

impl BatchExecutor {
    /// Create an executor with the given configuration
    pub fn new(config: BatchConfig) -> Self {
        let mut config = config;
        if config.max_concurrency == 0 {
            config.max_concurrency = DEFAULT_MAX_CONCURRENCY;
        }
        Self {
            config,
            counters: Arc::new(ExecutorCounters::default()),
        }
    }

    /// Create an executor with the default configuration
    pub fn with_defaults() -> Self {
        Self::new(BatchConfig::default())
    }

    /// Execute all inputs, collecting index-tagged outputs and errors
    pub async fn execute(&self, agent: Arc<dyn Agent>, inputs: Vec<AgentInput>) -> BatchResult {
        let started = Instant::now();
        let total = inputs.len();
        if total == 0 {
            self.counters.batches.fetch_add(1, Ordering::Relaxed);
            return BatchResult::empty(started.elapsed());
        }

        let workers = self.config.max_concurrency.min(total);
        let deadline = self.config.timeout.map(|t| started + t);
        let policy = self.config.error_policy;
        let stop = Arc::new(AtomicBool::new(false));
        debug!(total, workers, ?policy, "starting batch");

        let (work_tx, work_rx) = mpsc::channel::<(usize, AgentInput)>(total);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, AgentOutput, Duration)>(total);
        let (error_tx, mut error_rx) = mpsc::channel::<BatchItemError>(total);

        // Producer: feed the work queue in index order, honoring the stop flag.
        let producer_stop = Arc::clone(&stop);
        let producer = tokio::spawn(async move {
            for (index, input) in inputs.into_iter().enumerate() {
                if producer_stop.load(Ordering::Acquire) {
                    break;
                }
                if work_tx.send((index, input)).await.is_err() {
                    break;
                }
            }
        });

        // Workers: K tasks sharing the queue receiver.
        let mut worker_handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            let error_tx = error_tx.clone();
            let stop = Arc::clone(&stop);
            let agent = Arc::clone(&agent);
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let item = { work_rx.lock().await.recv().await };
                    let Some((index, input)) = item else { break };

                    if stop.load(Ordering::Acquire) {
                        // Drain without executing after a fail-fast stop.
                        continue;
                    }
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            let _ = error_tx
                                .send(BatchItemError {
                                    index,
                                    error: AgentError::Timeout,
                                })
                                .await;
                            continue;
                        }
                    }

                    let item_started = Instant::now();
                    let invoked = match deadline {
                        Some(deadline) => {
                            match tokio::time::timeout_at(deadline, agent.invoke(input)).await {
                                Ok(result) => result,
                                Err(_) => Err(AgentError::Timeout),
                            }
                        }
                        None => agent.invoke(input).await,
                    };
                    match invoked {
                        Ok(output) => {
                            let _ = result_tx.send((index, output, item_started.elapsed())).await;
                        }
                        Err(error) => {
                            let _ = error_tx.send(BatchItemError { index, error }).await;
                            if policy == ErrorPolicy::FailFast {
                                stop.store(true, Ordering::Release);
                            }
                        }
                    }
                }
            }));
        }
        drop(result_tx);
        drop(error_tx);

        // Collectors run concurrently with the workers; channels close once
        // every worker has exited and dropped its senders.
        let lifecycle = async {
            let _ = producer.await;
            for handle in worker_handles {
                let _ = handle.await;
            }
        };
        let collect_results = async {
            let mut results: Vec<Option<AgentOutput>> = (0..total).map(|_| None).collect();
            let mut durations: Vec<Duration> = Vec::with_capacity(total);
            while let Some((index, output, duration)) = result_rx.recv().await {
                results[index] = Some(output);
                durations.push(duration);
            }
            (results, durations)
        };
        let collect_errors = async {
            let mut errors = Vec::new();
            while let Some(error) = error_rx.recv().await {
                errors.push(error);
            }
            errors
        };
        let (_, (results, durations), mut errors) =
            tokio::join!(lifecycle, collect_results, collect_errors);
        errors.sort_by_key(|e| e.index);

        let success = durations.len();
        let failure = errors.len();
        let sum: Duration = durations.iter().sum();
        let stats = BatchStats {
            total,
            success,
            failure,
            total_duration: started.elapsed(),
            avg_duration: if success > 0 {
                sum / success as u32
            } else {
                Duration::ZERO
            },
            min_duration: durations.iter().min().copied().unwrap_or(Duration::ZERO),
            max_duration: durations.iter().max().copied().unwrap_or(Duration::ZERO),
        };

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters.items.fetch_add(total as u64, Ordering::Relaxed);
        self.counters
            .successes
            .fetch_add(success as u64, Ordering::Relaxed);
        self.counters
            .failures
            .fetch_add(failure as u64, Ordering::Relaxed);
        debug!(
            success,
            failure,
            elapsed = ?stats.total_duration,
            "batch finished"
        );

        BatchResult {
            results,
            errors,
            stats,
        }
    }

    /// Execute, then invoke `callback` once per completed item: successes
    /// first (in index order), then errors
    pub async fn execute_with_callback<F>(
        &self,
        agent: Arc<dyn Agent>,
        inputs: Vec<AgentInput>,
        mut callback: F,
    ) -> BatchResult
    where
        F: FnMut(usize, Option<&AgentOutput>, Option<&AgentError>),
    {
        let result = self.execute(agent, inputs).await;
        for (index, output) in result.results.iter().enumerate() {
            if let Some(output) = output {
                callback(index, Some(output), None);
            }
        }
        for error in &result.errors {
            callback(error.index, None, Some(&error.error));
        }
        result
    }

    /// Execute in the background, forwarding successes and errors to channels
    ///
    /// Both channels close once the batch completes.
    pub fn execute_stream(
        &self,
        agent: Arc<dyn Agent>,
        inputs: Vec<AgentInput>,
    ) -> (
        mpsc::Receiver<(usize, AgentOutput)>,
        mpsc::Receiver<BatchItemError>,
    ) {
        let capacity = inputs.len().max(1);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let (error_tx, error_rx) = mpsc::channel(capacity);
        let executor = self.clone();
        tokio::spawn(async move {
            let result = executor.execute(agent, inputs).await;
            for (index, output) in result.results.into_iter().enumerate() {
                if let Some(output) = output {
                    if output_tx.send((index, output)).await.is_err() {
                        break;
                    }
                }
            }
            for error in result.errors {
                if error_tx.send(error).await.is_err() {
                    break;
                }
            }
        });
        (output_rx, error_rx)
    }

    /// Snapshot cumulative executor counters
    pub fn stats(&self) -> ExecutorStats {
        let items = self.counters.items.load(Ordering::Relaxed);
        let successes = self.counters.successes.load(Ordering::Relaxed);
        ExecutorStats {
            batches_total: self.counters.batches.load(Ordering::Relaxed),
            items_total: items,
            success_total: successes,
            failure_total: self.counters.failures.load(Ordering::Relaxed),
            success_rate: percentage(successes, items),
        }
    }
}
