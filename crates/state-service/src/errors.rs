//! State service error types.
//!
//! Every component translates backend failures into [`StateError`] so the
//! request layer never sees a raw Redis fault. Internal details are logged
//! server-side but not exposed to clients.

use thiserror::Error;

/// State service error type.
///
/// Maps to HTTP status codes for the surrounding request layer:
/// - `StoreUnavailable`: 503
/// - `NotFound`: 404
/// - `Conflict`: 409
/// - `RateLimited`: 429
/// - `Unauthorized`: 401
/// - `Malformed`, `Config`, `Internal`: 500
#[derive(Debug, Error)]
pub enum StateError {
    /// Backing store unreachable or timed out.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Key absent. Often a valid miss rather than a failure.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored value failed shape validation.
    #[error("Malformed value: {0}")]
    Malformed(String),

    /// Rate limiter rejected the request.
    #[error("Rate limited: {action} (retry after {retry_after_seconds}s)")]
    RateLimited {
        action: String,
        retry_after_seconds: u64,
    },

    /// Unexpected concurrent mutation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Credentials rejected by the identity provider.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (serialization and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StateError {
    /// Returns the HTTP status code the request layer should use.
    pub fn status_code(&self) -> u16 {
        match self {
            StateError::StoreUnavailable(_) => 503,
            StateError::NotFound(_) => 404,
            StateError::Conflict(_) => 409,
            StateError::RateLimited { .. } => 429,
            StateError::Unauthorized(_) => 401,
            StateError::Malformed(_) | StateError::Config(_) | StateError::Internal(_) => 500,
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            StateError::StoreUnavailable(_) => {
                "Service temporarily unavailable, please try again".to_string()
            }
            StateError::NotFound(_) => "Not found".to_string(),
            StateError::RateLimited { .. } => {
                "Too many requests. Please try again later.".to_string()
            }
            StateError::Unauthorized(_) => "Invalid credentials".to_string(),
            StateError::Conflict(msg) => msg.clone(),
            StateError::Malformed(_) | StateError::Config(_) | StateError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Seconds the client should wait before retrying, if known.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            StateError::RateLimited {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Whether the failure is transient and the caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::StoreUnavailable(_) | StateError::RateLimited { .. }
        )
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Internal(format!("serialization failed: {err}"))
    }
}
