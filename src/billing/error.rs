//! Billing-specific error types.
//!
//! Separates the failure modes the entitlement subsystem has to tell apart:
//! a missing row is not an error at all (stores return `Ok(None)`), while a
//! failed query, a failed billing check and a timeout are all transient and
//! must never be read as "this account has no subscription".

use std::fmt;

/// Billing-specific errors.
///
/// These can be converted to [`HireboardError`](crate::error::HireboardError)
/// when they cross the module boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// No signed-in identity to reconcile for.
    NoIdentity,

    // Store errors
    /// A query against one of the remote tables failed.
    StoreUnavailable {
        table: String,
        operation: String,
        message: String,
    },

    // Billing authority errors
    /// The external billing check could not be completed.
    BillingCheckFailed {
        message: String,
        http_status: Option<u16>,
    },
    /// The billing check answered with an explicit `{error}` body.
    BillingCheckRejected { message: String },

    /// A remote call did not resolve within the client-side timeout.
    Timeout { operation: String, after_ms: u64 },

    /// A tier string could not be parsed.
    UnknownTier { value: String },

    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl BillingError {
    /// Shorthand for a failed store call.
    pub fn store(table: &str, operation: &str, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            table: table.to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::NoIdentity | Self::UnknownTier { .. } | Self::BillingCheckRejected { .. } => true,
            Self::BillingCheckFailed { http_status, .. } => {
                matches!(http_status, Some(400..=499)) && !self.is_retryable()
            }
            _ => false,
        }
    }

    /// Check if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. } | Self::Timeout { .. } | Self::Internal { .. } => true,
            Self::BillingCheckFailed { http_status, .. } => {
                matches!(http_status, Some(500..=599) | None)
            }
            _ => false,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Retryable failures leave the cached entitlements in place and are picked
    /// up again by the next scheduled refresh.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. } | Self::Timeout { .. } => true,
            Self::BillingCheckFailed { http_status, .. } => {
                // Transport failure, request timeout, rate limit or server error
                matches!(http_status, None | Some(408) | Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoIdentity => write!(f, "No signed-in identity"),
            Self::StoreUnavailable { table, operation, message } => {
                write!(f, "Store error during '{}' on '{}': {}", operation, table, message)
            }
            Self::BillingCheckFailed { message, http_status } => {
                write!(f, "Billing check failed: {}", message)?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::BillingCheckRejected { message } => {
                write!(f, "Billing check rejected: {}", message)
            }
            Self::Timeout { operation, after_ms } => {
                write!(f, "Operation '{}' timed out after {} ms", operation, after_ms)
            }
            Self::UnknownTier { value } => write!(f, "Unknown tier: {}", value),
            Self::Internal { message } => write!(f, "Internal billing error: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::HireboardError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::NoIdentity => crate::error::HireboardError::Unauthorized(err.to_string()),

            BillingError::UnknownTier { .. } | BillingError::BillingCheckRejected { .. } => {
                crate::error::HireboardError::BadRequest(err.to_string())
            }

            BillingError::StoreUnavailable { .. } => {
                crate::error::HireboardError::ServiceUnavailable(err.to_string())
            }

            BillingError::Timeout { .. } => crate::error::HireboardError::RequestTimeout,

            BillingError::BillingCheckFailed { http_status, .. } => match http_status {
                Some(429) => crate::error::HireboardError::TooManyRequests(err.to_string()),
                Some(408) => crate::error::HireboardError::RequestTimeout,
                Some(400..=499) => crate::error::HireboardError::BadRequest(err.to_string()),
                _ => crate::error::HireboardError::ServiceUnavailable(err.to_string()),
            },

            BillingError::Internal { .. } => crate::error::HireboardError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HireboardError;

    #[test]
    fn test_error_display() {
        let err = BillingError::store("usage_limit", "read", "connection reset");
        assert_eq!(
            err.to_string(),
            "Store error during 'read' on 'usage_limit': connection reset"
        );

        let err = BillingError::BillingCheckFailed {
            message: "bad gateway".to_string(),
            http_status: Some(502),
        };
        assert_eq!(err.to_string(), "Billing check failed: bad gateway [HTTP 502]");

        let err = BillingError::Timeout {
            operation: "billing_check".to_string(),
            after_ms: 10_000,
        };
        assert_eq!(err.to_string(), "Operation 'billing_check' timed out after 10000 ms");
    }

    #[test]
    fn test_error_classification() {
        let err = BillingError::store("subscription", "read", "permission denied");
        assert!(err.is_retryable());
        assert!(err.is_server_error());
        assert!(!err.is_client_error());

        let err = BillingError::BillingCheckRejected {
            message: "invalid token".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_client_error());

        let err = BillingError::BillingCheckFailed {
            message: "rate limited".to_string(),
            http_status: Some(429),
        };
        assert!(err.is_retryable());
        assert!(!err.is_client_error());

        let err = BillingError::BillingCheckFailed {
            message: "not found".to_string(),
            http_status: Some(404),
        };
        assert!(!err.is_retryable());
        assert!(err.is_client_error());
    }

    #[test]
    fn test_convert_to_hireboard_error() {
        let err: HireboardError = BillingError::NoIdentity.into();
        assert!(matches!(err, HireboardError::Unauthorized(_)));

        let err: HireboardError = BillingError::store("usage_limit", "write", "boom").into();
        assert!(matches!(err, HireboardError::ServiceUnavailable(_)));
        assert!(err.is_retryable());

        let err: HireboardError = BillingError::Timeout {
            operation: "reconcile".to_string(),
            after_ms: 5,
        }
        .into();
        assert!(matches!(err, HireboardError::RequestTimeout));
    }
}
