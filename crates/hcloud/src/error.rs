//! Error types for cloud provider operations.

use thiserror::Error;

/// Errors that can occur during cloud provider operations.
#[derive(Error, Debug)]
pub enum CloudError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// The API returned a payload the client could not interpret.
    /// A server ID that does not parse as a decimal integer lands here
    /// and is fatal for the node being provisioned.
    #[error("Invalid response from API: {0}")]
    InvalidResponse(String),

    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CloudError {
    /// Whether the error is a transient server-side failure worth retrying
    /// on the next reconcile rather than acting on.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => *status >= 500,
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_5xx_is_transient() {
        let err = CloudError::Api {
            status: 503,
            code: "unavailable".to_string(),
            message: "service unavailable".to_string(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_api_4xx_is_not_transient() {
        let err = CloudError::Api {
            status: 422,
            code: "invalid_input".to_string(),
            message: "server type not found".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_invalid_response_is_fatal() {
        let err = CloudError::InvalidResponse("server id 'abc' is not numeric".to_string());
        assert!(!err.is_transient());
    }
}
