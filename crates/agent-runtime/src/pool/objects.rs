//! Object pools for invocation inputs, outputs, and their building blocks
//!
//! Hot agent paths allocate the same shapes over and over: inputs, outputs,
//! reasoning-step and tool-call rows, context maps, and scratch buffers. The
//! pools here hand out zeroed instances from a free list and take them back
//! after use, so steady-state execution allocates nothing.
//!
//! Reset discipline: scalars are cleared, slices are truncated to `len = 0`
//! with capacity preserved, and maps are cleared in place. Objects that have
//! grown past the size-guard thresholds are dropped for the allocator instead
//! of being re-pooled, so one oversized execution cannot pin memory forever.

use crate::agent::{AgentInput, AgentOutput, InvokeOptions, OutputStatus, ReasoningStep, ToolCallRecord, TokenUsage};
use crate::stats::percentage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// Reasoning-step slices larger than this are not re-pooled
pub const MAX_POOLED_STEPS: usize = 100;
/// Tool-call slices larger than this are not re-pooled
pub const MAX_POOLED_TOOL_CALLS: usize = 50;
/// Context/metadata maps larger than this are not re-pooled
pub const MAX_POOLED_MAP_ENTRIES: usize = 32;
/// Byte buffers larger than this are not re-pooled
pub const MAX_POOLED_BUFFER_BYTES: usize = 64 * 1024;

/// Free-list capacity of each typed pool
const DEFAULT_MAX_IDLE: usize = 64;

/// An object that can live in an [`ObjectPool`]
///
/// `reset` restores the zeroed state while keeping allocated capacity;
/// `retain` is the size guard consulted before an object re-enters the pool.
pub trait Reusable: Default + Send {
    fn reset(&mut self);

    fn retain(&self) -> bool {
        true
    }
}

impl Reusable for AgentInput {
    fn reset(&mut self) {
        self.task.clear();
        self.instruction.clear();
        self.session_id.clear();
        self.timestamp = DateTime::<Utc>::UNIX_EPOCH;
        self.context.clear();
        self.options = InvokeOptions::default();
    }

    fn retain(&self) -> bool {
        self.context.len() <= MAX_POOLED_MAP_ENTRIES
    }
}

impl Reusable for AgentOutput {
    fn reset(&mut self) {
        self.content.clear();
        self.status = OutputStatus::Success;
        self.message = None;
        self.steps.clear();
        self.tool_calls.clear();
        self.usage = TokenUsage::default();
        self.latency = Duration::ZERO;
        self.timestamp = DateTime::<Utc>::UNIX_EPOCH;
        self.metadata.clear();
    }

    fn retain(&self) -> bool {
        self.steps.capacity() <= MAX_POOLED_STEPS
            && self.tool_calls.capacity() <= MAX_POOLED_TOOL_CALLS
            && self.metadata.len() <= MAX_POOLED_MAP_ENTRIES
    }
}

impl Reusable for ReasoningStep {
    fn reset(&mut self) {
        self.thought.clear();
        self.action.clear();
        self.observation.clear();
        self.duration = Duration::ZERO;
    }
}

impl Reusable for ToolCallRecord {
    fn reset(&mut self) {
        self.tool_name.clear();
        self.arguments.clear();
        self.result.clear();
        self.duration = Duration::ZERO;
        self.success = false;
    }

    fn retain(&self) -> bool {
        self.arguments.len() <= MAX_POOLED_MAP_ENTRIES
    }
}

impl Reusable for HashMap<String, serde_json::Value> {
    fn reset(&mut self) {
        self.clear();
    }

    fn retain(&self) -> bool {
        self.len() <= MAX_POOLED_MAP_ENTRIES
    }
}

impl Reusable for Vec<ReasoningStep> {
    fn reset(&mut self) {
        self.clear();
    }

    fn retain(&self) -> bool {
        self.capacity() <= MAX_POOLED_STEPS
    }
}

impl Reusable for Vec<ToolCallRecord> {
    fn reset(&mut self) {
        self.clear();
    }

    fn retain(&self) -> bool {
        self.capacity() <= MAX_POOLED_TOOL_CALLS
    }
}

impl Reusable for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }

    fn retain(&self) -> bool {
        self.capacity() <= MAX_POOLED_BUFFER_BYTES
    }
}

/// A typed free-list pool
///
/// `get` never fails: an empty free list falls back to `T::default()`.
/// `put` resets the object and returns it to the free list unless the size
/// guard rejects it or the free list is full.
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
    max_idle: usize,
    gets: AtomicU64,
    puts: AtomicU64,
    discards: AtomicU64,
}

impl<T: Reusable> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl<T: Reusable> ObjectPool<T> {
    /// Create a pool retaining at most `max_idle` free objects
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_idle.min(16))),
            max_idle,
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    /// Take an object from the pool, or allocate a fresh one
    pub fn get(&self) -> T {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.pop().unwrap_or_default()
    }

    /// Return an object to the pool
    ///
    /// Over-threshold objects are dropped for garbage collection by the
    /// allocator rather than re-pooled.
    pub fn put(&self, mut obj: T) {
        if !obj.retain() {
            self.discards.fetch_add(1, Ordering::Relaxed);
            return;
        }
        obj.reset();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.max_idle {
            free.push(obj);
            self.puts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.discards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take an object wrapped in a guard that returns it on drop
    pub fn scoped(&self) -> Pooled<'_, T> {
        Pooled {
            pool: self,
            value: Some(self.get()),
        }
    }

    /// Number of objects currently sitting in the free list
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn counters(&self) -> PoolCounters {
        PoolCounters {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            idle: self.idle(),
        }
    }
}

/// RAII guard pairing a `get` with a guaranteed `put` on every exit path
pub struct Pooled<'a, T: Reusable> {
    pool: &'a ObjectPool<T>,
    value: Option<T>,
}

impl<T: Reusable> Pooled<'_, T> {
    /// Detach the object from the guard; it will not return to the pool
    pub fn detach(mut self) -> T {
        self.value.take().unwrap_or_default()
    }
}

impl<T: Reusable> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value present until drop")
    }
}

impl<T: Reusable> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value present until drop")
    }
}

impl<T: Reusable> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.put(value);
        }
    }
}

/// Counter snapshot for one typed pool
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolCounters {
    pub gets: u64,
    pub puts: u64,
    pub discards: u64,
    pub idle: usize,
}

/// Counter snapshot across all typed pools
#[derive(Debug, Clone, Default)]
pub struct ObjectPoolStats {
    pub inputs: PoolCounters,
    pub outputs: PoolCounters,
    pub steps: PoolCounters,
    pub tool_calls: PoolCounters,
    pub maps: PoolCounters,
    pub step_lists: PoolCounters,
    pub tool_call_lists: PoolCounters,
    pub buffers: PoolCounters,

    /// Approximate reuse rate: puts / gets across all pools, percent
    pub hit_rate: f64,
}

/// The full set of typed pools used on the invocation hot path
#[derive(Default)]
pub struct ObjectPools {
    inputs: ObjectPool<AgentInput>,
    outputs: ObjectPool<AgentOutput>,
    steps: ObjectPool<ReasoningStep>,
    tool_calls: ObjectPool<ToolCallRecord>,
    maps: ObjectPool<HashMap<String, serde_json::Value>>,
    step_lists: ObjectPool<Vec<ReasoningStep>>,
    tool_call_lists: ObjectPool<Vec<ToolCallRecord>>,
    buffers: ObjectPool<Vec<u8>>,
}

impl ObjectPools {
    /// Create a fresh set of pools
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inputs(&self) -> &ObjectPool<AgentInput> {
        &self.inputs
    }

    pub fn outputs(&self) -> &ObjectPool<AgentOutput> {
        &self.outputs
    }

    pub fn steps(&self) -> &ObjectPool<ReasoningStep> {
        &self.steps
    }

    pub fn tool_calls(&self) -> &ObjectPool<ToolCallRecord> {
        &self.tool_calls
    }

    pub fn maps(&self) -> &ObjectPool<HashMap<String, serde_json::Value>> {
        &self.maps
    }

    pub fn step_lists(&self) -> &ObjectPool<Vec<ReasoningStep>> {
        &self.step_lists
    }

    pub fn tool_call_lists(&self) -> &ObjectPool<Vec<ToolCallRecord>> {
        &self.tool_call_lists
    }

    pub fn buffers(&self) -> &ObjectPool<Vec<u8>> {
        &self.buffers
    }

    /// Deep-copy an input into a pooled target
    ///
    /// The clone shares no mutable state with the source: strings are copied
    /// byte-for-byte, the context map key-by-key.
    pub fn clone_input(&self, src: &AgentInput) -> AgentInput {
        let mut dst = self.inputs.get();
        dst.task.push_str(&src.task);
        dst.instruction.push_str(&src.instruction);
        dst.session_id.push_str(&src.session_id);
        dst.timestamp = src.timestamp;
        for (key, value) in &src.context {
            dst.context.insert(key.clone(), value.clone());
        }
        dst.options = src.options.clone();
        dst
    }

    /// Deep-copy an output into a pooled target
    ///
    /// Reasoning steps and tool calls are copied element-by-element, the
    /// metadata map key-by-key.
    pub fn clone_output(&self, src: &AgentOutput) -> AgentOutput {
        let mut dst = self.outputs.get();
        dst.content.push_str(&src.content);
        dst.status = src.status;
        dst.message = src.message.clone();
        dst.steps.extend(src.steps.iter().cloned());
        dst.tool_calls.extend(src.tool_calls.iter().cloned());
        dst.usage = src.usage;
        dst.latency = src.latency;
        dst.timestamp = src.timestamp;
        for (key, value) in &src.metadata {
            dst.metadata.insert(key.clone(), value.clone());
        }
        dst
    }

    /// Snapshot all pool counters
    pub fn stats(&self) -> ObjectPoolStats {
        let stats = ObjectPoolStats {
            inputs: self.inputs.counters(),
            outputs: self.outputs.counters(),
            steps: self.steps.counters(),
            tool_calls: self.tool_calls.counters(),
            maps: self.maps.counters(),
            step_lists: self.step_lists.counters(),
            tool_call_lists: self.tool_call_lists.counters(),
            buffers: self.buffers.counters(),
            hit_rate: 0.0,
        };
        let all = [
            &stats.inputs,
            &stats.outputs,
            &stats.steps,
            &stats.tool_calls,
            &stats.maps,
            &stats.step_lists,
            &stats.tool_call_lists,
            &stats.buffers,
        ];
        let gets: u64 = all.iter().map(|c| c.gets).sum();
        let puts: u64 = all.iter().map(|c| c.puts).sum();
        ObjectPoolStats {
            hit_rate: percentage(puts, gets),
            ..stats
        }
    }
}

static GLOBAL_POOLS: OnceLock<ObjectPools> = OnceLock::new();

/// Process-wide pools shared by all runtime components
pub fn global() -> &'static ObjectPools {
    GLOBAL_POOLS.get_or_init(ObjectPools::new)
}
