//! Error types for agent-workflow-mcp.

use thiserror::Error;

/// Result type for agent-workflow-mcp operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for agent-workflow-mcp.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or inconsistent workflow definition.
    #[error("definition error: {0}")]
    Definition(String),

    /// Template referenced a step that has no recorded result.
    #[error("unresolved reference `{expression}`: step `{step_id}` has no result")]
    UnresolvedReference { step_id: String, expression: String },

    /// Template expression used outside its valid context.
    #[error("scope error: {0}")]
    Scope(String),

    /// Target agent is not registered.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// A step failed under the `fail` policy (or exhausted its retries).
    #[error("step `{step_id}` failed: {message}")]
    StepFailed { step_id: String, message: String },

    /// Agent or tool invocation failed.
    #[error("invocation of `{target}` failed: {message}")]
    Invocation { target: String, message: String },

    /// Invocation timed out.
    #[error("invocation of `{target}` timed out after {timeout_secs}s")]
    Timeout { target: String, timeout_secs: u64 },

    /// Orchestrator safety bound exceeded.
    #[error("safety limit exceeded: {0}")]
    SafetyLimit(String),

    /// Credential lookup failed.
    #[error("secret error: {0}")]
    Secret(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid parameters.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`], used to decide propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal, surfaced immediately, never retried.
    Definition,
    /// Expression used outside its valid context.
    Scope,
    /// Per-step failure governed by `on_error`.
    Runtime,
    /// Orchestrator bound exceeded.
    SafetyLimit,
    /// Everything else (configuration, IO, protocol).
    Other,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Definition(_) | Error::UnresolvedReference { .. } | Error::AgentNotFound(_) => {
                ErrorKind::Definition
            }
            Error::Scope(_) => ErrorKind::Scope,
            Error::StepFailed { .. } | Error::Invocation { .. } | Error::Timeout { .. } => {
                ErrorKind::Runtime
            }
            Error::SafetyLimit(_) => ErrorKind::SafetyLimit,
            _ => ErrorKind::Other,
        }
    }

    /// Whether a retry could plausibly change the outcome.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Runtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(Error::Definition("x".into()).kind(), ErrorKind::Definition);
        assert_eq!(
            Error::UnresolvedReference {
                step_id: "a".into(),
                expression: "steps.a.output".into()
            }
            .kind(),
            ErrorKind::Definition
        );
        assert_eq!(Error::AgentNotFound("a".into()).kind(), ErrorKind::Definition);
        assert_eq!(Error::Scope("x".into()).kind(), ErrorKind::Scope);
        assert_eq!(
            Error::Timeout {
                target: "a".into(),
                timeout_secs: 1
            }
            .kind(),
            ErrorKind::Runtime
        );
        assert_eq!(Error::SafetyLimit("x".into()).kind(), ErrorKind::SafetyLimit);
        assert!(!Error::Definition("x".into()).is_retryable());
    }
}
