//! # Pooling layer
//!
//! Two pools with different jobs: [`agent_pool`] keeps a bounded population
//! of expensive, reusable agent workers; [`objects`] recycles the cheap
//! request/response objects exchanged on every invocation.

pub mod agent_pool;
pub mod objects;

pub use agent_pool::{
    factory_fn, AgentFactory, AgentPool, AgentPoolConfig, FnFactory, PoolStats, PooledAgent,
};
pub use objects::{ObjectPool, ObjectPoolStats, ObjectPools, PoolCounters, Pooled, Reusable};
