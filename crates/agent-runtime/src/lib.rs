//! # Agent Runtime
//!
//! Runtime performance core for AI-agent frameworks. Higher-level agents
//! (reasoning patterns, orchestrators, skills) execute on top of three
//! hot-path subsystems:
//!
//! - **Agent pool** ([`pool::AgentPool`]): a bounded population of reusable
//!   agent workers with O(1) channel-based acquire/release, idle and lifetime
//!   reaping, and a combined acquire-invoke-release path.
//! - **Batch executor** ([`batch::BatchExecutor`]): runs a vector of inputs
//!   against one agent with a fixed worker count, fail-fast or
//!   continue-on-error policies, a global deadline, and callback/streaming
//!   variants.
//! - **Response cache** ([`cache::ResponseCache`]): a TTL and size-bounded
//!   cache of input fingerprints to deep-copied outputs, with background
//!   expiry.
//!
//! [`pool::objects`] supplies recyclable inputs, outputs, and scratch
//! buffers so the steady-state invocation path allocates nothing, and every
//! component exposes atomic-counter statistics as value snapshots.
//!
//! ## Example
//!
//! ```no_run
//! use agent_runtime::pool::{factory_fn, AgentPool, AgentPoolConfig};
//! use agent_runtime::{Agent, AgentInput, AgentOutput, FnAgent};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = factory_fn(|| async {
//!     Ok(Arc::new(FnAgent::new("worker", "answers tasks", |input: AgentInput| async move {
//!         Ok(AgentOutput::new(format!("handled: {}", input.task)))
//!     })) as Arc<dyn Agent>)
//! });
//!
//! let pool = AgentPool::new(factory, AgentPoolConfig::new().max_size(8)).await?;
//! let output = pool.execute(AgentInput::new("summarize the incident")).await?;
//! println!("{}", output.content);
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod batch;
pub mod cache;
pub mod errors;
pub mod pool;

mod stats;

pub use agent::{
    Agent, AgentError, AgentInput, AgentOutput, AgentResult, AgentStream, FnAgent, InvokeOptions,
    OutputStatus, ReasoningStep, TokenUsage, ToolCallRecord,
};
pub use batch::{
    BatchConfig, BatchExecutor, BatchItemError, BatchResult, BatchStats, ErrorPolicy,
    ExecutorStats,
};
pub use cache::{CacheConfig, CacheStats, KeyGenerator, ResponseCache};
pub use errors::{CoreError, Result};
pub use pool::{
    factory_fn, AgentFactory, AgentPool, AgentPoolConfig, ObjectPool, ObjectPoolStats,
    ObjectPools, PoolStats, Pooled, PooledAgent, Reusable,
};
