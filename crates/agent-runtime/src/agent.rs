//! # Agent trait and invocation data model
//!
//! This module defines the `Agent` trait the runtime core consumes, together
//! with the invocation input/output types exchanged on every call. Concrete
//! agent implementations (reasoning patterns, LLM provider adapters) live
//! outside this crate; the pool, batch executor, and response cache only
//! require the contract defined here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Error type for agent invocations
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invocation timed out")]
    Timeout,

    #[error("component is closed")]
    Closed,

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result type for agent invocations
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Stream of incremental agent outputs
pub type AgentStream = Pin<Box<dyn Stream<Item = AgentResult<AgentOutput>> + Send>>;

/// Terminal status of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    #[default]
    Success,
    Failed,
    Partial,
}

impl std::fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStatus::Success => write!(f, "success"),
            OutputStatus::Failed => write!(f, "failed"),
            OutputStatus::Partial => write!(f, "partial"),
        }
    }
}

/// Per-invocation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InvokeOptions {
    /// Deadline for this single invocation
    pub timeout: Option<Duration>,

    /// Request incremental output where the agent supports it
    pub stream: bool,
}

/// Input to a single agent invocation
///
/// Immutable once dispatched: the caller (or the object pool) creates it, the
/// invocation owns it exclusively, and pooled instances are returned after the
/// call completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    /// Task description for the agent
    pub task: String,

    /// Additional instruction refining the task
    pub instruction: String,

    /// Session this invocation belongs to
    pub session_id: String,

    /// Creation timestamp
    pub timestamp: DateTime<Utc>,

    /// General-purpose context passed through to the agent
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,

    /// Invocation options
    #[serde(default)]
    pub options: InvokeOptions,
}

impl Default for AgentInput {
    fn default() -> Self {
        Self {
            task: String::new(),
            instruction: String::new(),
            session_id: String::new(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            context: HashMap::new(),
            options: InvokeOptions::default(),
        }
    }
}

impl AgentInput {
    /// Create a new input with a task description
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Set the instruction
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Set the session identifier
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Add a context value
    pub fn with_context_value(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Set the invocation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }
}

/// One step of the agent's reasoning trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReasoningStep {
    /// What the agent considered
    pub thought: String,

    /// Action the agent chose
    pub action: String,

    /// Observed result of the action
    pub observation: String,

    /// Time spent on this step
    pub duration: Duration,
}

/// Record of a single tool call made during an invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolCallRecord {
    /// Name of the tool
    pub tool_name: String,

    /// Arguments passed to the tool
    #[serde(default)]
    pub arguments: HashMap<String, serde_json::Value>,

    /// Tool result, serialized
    pub result: String,

    /// Tool execution time
    pub duration: Duration,

    /// Whether the call succeeded
    pub success: bool,
}

/// Token accounting for an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Output of a single agent invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Main response content
    pub content: String,

    /// Terminal status
    pub status: OutputStatus,

    /// Optional status message (failure reason, partial explanation)
    pub message: Option<String>,

    /// Ordered reasoning trace
    #[serde(default)]
    pub steps: Vec<ReasoningStep>,

    /// Ordered tool-call records
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,

    /// Token accounting
    #[serde(default)]
    pub usage: TokenUsage,

    /// Wall-clock latency of the invocation
    pub latency: Duration,

    /// Completion timestamp
    pub timestamp: DateTime<Utc>,

    /// Metadata key-value pairs
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for AgentOutput {
    fn default() -> Self {
        Self {
            content: String::new(),
            status: OutputStatus::Success,
            message: None,
            steps: Vec::new(),
            tool_calls: Vec::new(),
            usage: TokenUsage::default(),
            latency: Duration::ZERO,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            metadata: HashMap::new(),
        }
    }
}

impl AgentOutput {
    /// Create a new successful output with content
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Set the status
    pub fn with_status(mut self, status: OutputStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the status message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Append a reasoning step
    pub fn with_step(mut self, step: ReasoningStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a tool-call record
    pub fn with_tool_call(mut self, call: ToolCallRecord) -> Self {
        self.tool_calls.push(call);
        self
    }

    /// Set token usage
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Add a metadata value
    pub fn with_metadata_value(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the invocation completed successfully
    pub fn is_success(&self) -> bool {
        self.status == OutputStatus::Success
    }
}

/// The callable unit the runtime core executes
///
/// `invoke` is the only method the pool and the batch executor use; the
/// response cache additionally delegates the rest of the surface to the
/// wrapped agent. `stream` and `batch` have invoke-based defaults so simple
/// agents only implement the core contract.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Agent name (unique within a deployment)
    fn name(&self) -> &str;

    /// What this agent does
    fn description(&self) -> &str;

    /// Capability tags advertised by this agent
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Execute one invocation
    async fn invoke(&self, input: AgentInput) -> AgentResult<AgentOutput>;

    /// Execute one invocation, yielding incremental outputs
    ///
    /// The default implementation invokes once and yields the final output as
    /// a single chunk.
    async fn stream(&self, input: AgentInput) -> AgentResult<AgentStream> {
        let output = self.invoke(input).await?;
        Ok(Box::pin(async_stream::stream! {
            yield Ok(output);
        }))
    }

    /// Execute a sequence of invocations
    ///
    /// The default implementation runs them sequentially and fails on the
    /// first error. Callers wanting bounded parallelism and per-item error
    /// collection use [`crate::batch::BatchExecutor`] instead.
    async fn batch(&self, inputs: Vec<AgentInput>) -> AgentResult<Vec<AgentOutput>> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            outputs.push(self.invoke(input).await?);
        }
        Ok(outputs)
    }
}

#[async_trait]
impl<A: Agent + ?Sized> Agent for Arc<A> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn description(&self) -> &str {
        (**self).description()
    }

    fn capabilities(&self) -> Vec<String> {
        (**self).capabilities()
    }

    async fn invoke(&self, input: AgentInput) -> AgentResult<AgentOutput> {
        (**self).invoke(input).await
    }

    async fn stream(&self, input: AgentInput) -> AgentResult<AgentStream> {
        (**self).stream(input).await
    }

    async fn batch(&self, inputs: Vec<AgentInput>) -> AgentResult<Vec<AgentOutput>> {
        (**self).batch(inputs).await
    }
}

/// Wrapper agent over an async closure, for tests and simple deployments
pub struct FnAgent<F> {
    name: String,
    description: String,
    handler: F,
}

impl<F, Fut> FnAgent<F>
where
    F: Fn(AgentInput) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = AgentResult<AgentOutput>> + Send,
{
    /// Create a new closure-backed agent
    pub fn new(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Agent for FnAgent<F>
where
    F: Fn(AgentInput) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = AgentResult<AgentOutput>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, input: AgentInput) -> AgentResult<AgentOutput> {
        (self.handler)(input).await
    }
}
