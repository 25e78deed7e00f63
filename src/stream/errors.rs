//! Stream-layer error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is left to the caller; these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors raised while opening, decoding, or reconstructing a response stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Stream events violated the ordering rules for a segment or turn.
    #[error("malformed stream: {reason}")]
    MalformedStream { reason: String },

    /// A closed tool-call segment did not parse into a usable call.
    #[error("malformed tool call at segment {index}: {reason}")]
    MalformedToolCall {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        raw: String,
        reason: String,
    },

    /// Dispatch was requested before the segment-end signal arrived.
    #[error("tool call at segment {index} is not complete ({buffered_bytes} bytes buffered)")]
    ToolCallIncomplete { index: usize, buffered_bytes: usize },

    /// A segment-end arrived for a segment that was already closed.
    #[error("duplicate segment-end for segment {index}")]
    DuplicateSegmentEnd { index: usize },

    /// The call for this segment was already handed out for execution.
    #[error("tool call at segment {index} was already dispatched")]
    AlreadyDispatched { index: usize },

    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("request timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The service rejected the request for exceeding its rate limits.
    #[error("rate limited by service (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Byte-stream read failure or a service-side error event.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl StreamError {
    /// Whether retrying the same request could succeed.
    ///
    /// Only transport-level failures qualify; reconstruction errors describe
    /// the content of a response and would recur.
    pub fn is_retriable(&self) -> bool {
        match self {
            StreamError::ConnectionFailed { .. }
            | StreamError::Timeout { .. }
            | StreamError::RateLimited { .. }
            | StreamError::Transport { .. } => true,
            StreamError::HttpError { status, .. } => *status == 408 || *status >= 500,
            _ => false,
        }
    }

    /// Service-suggested wait before retrying, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            StreamError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(std::time::Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retriable() {
        assert!(StreamError::Timeout { duration_secs: 5 }.is_retriable());
        assert!(StreamError::RateLimited {
            retry_after_secs: None
        }
        .is_retriable());
        assert!(StreamError::HttpError {
            status: 529,
            body: "overloaded".into()
        }
        .is_retriable());
        assert!(StreamError::ConnectionFailed {
            endpoint: "http://localhost".into(),
            reason: "refused".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_content_errors_are_not_retriable() {
        assert!(!StreamError::HttpError {
            status: 400,
            body: "bad request".into()
        }
        .is_retriable());
        assert!(!StreamError::MalformedStream {
            reason: "delta before start".into()
        }
        .is_retriable());
        assert!(!StreamError::MalformedToolCall {
            index: 1,
            id: None,
            name: Some("bash".into()),
            raw: "{".into(),
            reason: "eof".into(),
        }
        .is_retriable());
    }

    #[test]
    fn test_retry_after() {
        let err = StreamError::RateLimited {
            retry_after_secs: Some(7),
        };
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(7)));
        assert!(StreamError::Timeout { duration_secs: 1 }.retry_after().is_none());
    }
}
