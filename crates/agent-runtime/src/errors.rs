//! Error types for the runtime core
//!
//! The pool and the combined execute path surface their own taxonomy here;
//! invocation-level failures stay as [`AgentError`] and pass through
//! untouched.

use crate::agent::AgentError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the runtime core
#[derive(Debug, Error)]
pub enum CoreError {
    /// The pool has been closed; no further acquisitions are possible
    #[error("agent pool: pool is closed")]
    PoolClosed,

    /// No worker became available within the acquire deadline
    #[error("agent pool: acquire timed out after {0:?}")]
    PoolTimeout(Duration),

    /// The released worker does not belong to this pool
    #[error("agent pool: release: agent not found in pool")]
    AgentNotInPool,

    /// The released worker was not acquired (double release)
    #[error("agent pool: release: agent not in use")]
    AgentNotInUse,

    /// The worker factory failed to produce an agent
    #[error("agent pool: factory error: {0}")]
    Factory(#[source] AgentError),

    /// Error surfaced by the agent during an invocation
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Result type for the runtime core
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Whether the operation may succeed on retry (a worker may free up, the
    /// factory's transient failure may clear)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::PoolTimeout(_) | CoreError::Factory(_) | CoreError::Agent(AgentError::Timeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_component_and_operation() {
        let err = CoreError::PoolClosed;
        assert!(err.to_string().contains("agent pool"));

        let err = CoreError::PoolTimeout(Duration::from_secs(10));
        assert!(err.to_string().contains("acquire"));

        let err = CoreError::AgentNotInPool;
        assert!(err.to_string().contains("release"));
    }

    #[test]
    fn test_agent_error_passthrough() {
        let err: CoreError = AgentError::ExecutionFailed("llm refused".into()).into();
        assert!(matches!(err, CoreError::Agent(_)));
        assert!(err.to_string().contains("llm refused"));
    }

    #[test]
    fn test_retryable() {
        assert!(CoreError::PoolTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!CoreError::PoolClosed.is_retryable());
        assert!(!CoreError::AgentNotInUse.is_retryable());
    }
}
