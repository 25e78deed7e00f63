//! Agent Core error types.

use thiserror::Error;

use crate::stream::errors::StreamError;

/// Errors that can occur during agent core operations.
///
/// Validation, unknown-tool and execution errors are recoverable: the
/// dispatcher turns them into `ToolResult.error` for the model to see. The
/// rest end the turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Arguments failed the tool's schema.
    #[error("invalid arguments for tool '{tool}': field '{field}' {reason}")]
    Validation {
        tool: String,
        field: String,
        reason: String,
    },

    /// The model named a tool that is not registered.
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    /// The tool ran and failed.
    #[error("tool '{tool}' failed: {reason}")]
    ToolExecution {
        tool: String,
        reason: String,
        partial_output: Option<String>,
    },

    /// The event stream violated ordering rules.
    #[error("malformed stream: {reason}")]
    MalformedStream { reason: String },

    /// Every transport attempt failed.
    #[error("transport failed after {attempts} attempt(s): {reason}")]
    TransportExhausted { attempts: u32, reason: String },

    /// The request would exceed the rolling token budget.
    #[error("rate limit exceeded for {dimension}: {reason}")]
    RateLimitExceeded { dimension: String, reason: String },

    /// The caller cancelled the turn.
    #[error("turn cancelled")]
    Cancelled,

    /// The model kept requesting tools past the configured limit.
    #[error("tool round-trip limit reached ({limit})")]
    RoundTripLimit { limit: usize },

    /// A conversation invariant was violated.
    #[error("conversation error: {reason}")]
    Conversation { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },
}

impl AgentError {
    /// Whether the model should see this error as a tool result rather than
    /// the turn failing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::Validation { .. }
                | AgentError::UnknownTool { .. }
                | AgentError::ToolExecution { .. }
        )
    }
}

impl From<StreamError> for AgentError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::MalformedStream { reason } => AgentError::MalformedStream { reason },
            StreamError::ConfigError { reason } => AgentError::Config { reason },
            other => AgentError::TransportExhausted {
                attempts: 1,
                reason: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Config {
            reason: format!("I/O error: {e}"),
        }
    }
}

impl From<serde_yaml::Error> for AgentError {
    fn from(e: serde_yaml::Error) -> Self {
        AgentError::Config {
            reason: format!("failed to parse config: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_tool_and_field() {
        let err = AgentError::Validation {
            tool: "bash".into(),
            field: "command".into(),
            reason: "is required".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("bash"));
        assert!(msg.contains("command"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_fatal_errors_are_not_recoverable() {
        assert!(!AgentError::Cancelled.is_recoverable());
        assert!(!AgentError::TransportExhausted {
            attempts: 3,
            reason: "timeout".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_from_stream_error() {
        let err: AgentError = StreamError::MalformedStream {
            reason: "delta after end".into(),
        }
        .into();
        assert!(matches!(err, AgentError::MalformedStream { .. }));

        let err: AgentError = StreamError::Timeout { duration_secs: 3 }.into();
        assert!(matches!(err, AgentError::TransportExhausted { attempts: 1, .. }));
    }
}
