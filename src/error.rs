/// The main error type for Hireboard
#[derive(Debug, thiserror::Error)]
pub enum HireboardError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl HireboardError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn request_timeout() -> Self {
        Self::RequestTimeout
    }

    pub fn too_many_requests(msg: impl Into<String>) -> Self {
        Self::TooManyRequests(msg.into())
    }

    /// Whether retrying the same call later may succeed.
    ///
    /// Timeouts, unavailable upstreams and rate limits are transient. Everything
    /// else needs a different request or a code fix.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout | Self::ServiceUnavailable(_) | Self::TooManyRequests(_)
        )
    }

    /// Returns a message that is safe to show to an end user.
    ///
    /// Client errors carry their own message. Server-side failures are reduced
    /// to a generic message; the details belong in the logs.
    #[must_use]
    pub fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Unauthorized(msg) => format!("Unauthorized: {}", msg),
            Self::Forbidden(msg) => format!("Forbidden: {}", msg),
            Self::TooManyRequests(msg) => format!("Too many requests: {}", msg),
            Self::RequestTimeout => "Request timeout".to_string(),

            Self::Internal(_) => "Internal error".to_string(),
            Self::Anyhow(_) => "Internal error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),
        }
    }
}

/// Result type alias for Hireboard operations
pub type Result<T> = std::result::Result<T, HireboardError>;

// Common error type conversions

impl From<serde_json::Error> for HireboardError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            HireboardError::BadRequest(format!("JSON error: {}", err))
        } else {
            HireboardError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

impl From<reqwest::Error> for HireboardError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HireboardError::RequestTimeout
        } else if err.is_connect() {
            HireboardError::ServiceUnavailable(format!("Connection error: {}", err))
        } else if err.is_status() {
            // Map HTTP status codes from upstream services
            if let Some(status) = err.status() {
                match status.as_u16() {
                    401 => HireboardError::Unauthorized("Upstream authentication failed".to_string()),
                    403 => HireboardError::Forbidden("Upstream access denied".to_string()),
                    404 => HireboardError::NotFound("Upstream resource not found".to_string()),
                    429 => HireboardError::TooManyRequests("Upstream rate limit exceeded".to_string()),
                    503 => HireboardError::ServiceUnavailable("Upstream service unavailable".to_string()),
                    _ => HireboardError::Internal(format!("Upstream error: {}", err)),
                }
            } else {
                HireboardError::Internal(format!("HTTP error: {}", err))
            }
        } else {
            HireboardError::Internal(format!("Request error: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(HireboardError::RequestTimeout.is_retryable());
        assert!(HireboardError::service_unavailable("store down").is_retryable());
        assert!(HireboardError::too_many_requests("slow down").is_retryable());
        assert!(!HireboardError::not_found("row").is_retryable());
        assert!(!HireboardError::internal("bug").is_retryable());
    }

    #[test]
    fn test_safe_message_hides_internal_details() {
        let err = HireboardError::internal("connection string postgres://secret");
        assert_eq!(err.safe_message(), "Internal error");

        let err = HireboardError::forbidden("Upgrade required");
        assert_eq!(err.safe_message(), "Forbidden: Upgrade required");
    }

    #[test]
    fn test_json_error_is_bad_request() {
        let err: HireboardError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, HireboardError::BadRequest(_)));
    }

    #[test]
    fn test_anyhow_is_transparent() {
        let err: HireboardError = anyhow::anyhow!("wrapped failure").into();
        assert_eq!(err.to_string(), "wrapped failure");
    }
}
