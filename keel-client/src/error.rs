//! Error types for the Keel clients

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the orchestrator or an agent
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Peer returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the peer
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Connection refused or 404: nothing serves the agent API at that address
    ///
    /// The orchestrator marks an agent offline when a call fails this way.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::RequestFailed(e) => e.is_connect(),
            other => other.is_not_found(),
        }
    }

    /// 503: the peer is up but has no room for the request right now
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ApiError { status: 503, .. })
    }

    /// Check if this error is a server error (5xx status)
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if *status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_unreachable() {
        let err = ClientError::api_error(404, "unknown job runner");
        assert!(err.is_not_found());
        assert!(err.is_unreachable());
    }

    #[test]
    fn test_server_error_is_reachable() {
        let err = ClientError::api_error(500, "boom");
        assert!(err.is_server_error());
        assert!(!err.is_unreachable());
    }

    #[test]
    fn test_unavailable_is_transient() {
        let err = ClientError::api_error(503, "job queue is full");
        assert!(err.is_unavailable());
        assert!(!err.is_unreachable());
        assert!(!ClientError::api_error(500, "boom").is_unavailable());
    }

    #[test]
    fn test_parse_error_is_reachable() {
        assert!(!ClientError::ParseError("bad json".into()).is_unreachable());
    }
}
