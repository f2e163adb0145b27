//! Error types for the real-time core.

use thiserror::Error;

use crate::repositories::StoreError;

/// Result type alias for real-time operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Failure of a client command. Every variant maps to a stable wire code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Service unavailable: {message}")]
    Unavailable { message: String },

    #[error("Not found: {what}")]
    NotFound { what: String },
}

impl RealtimeError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Stable machine-readable code sent in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::Unauthorized { .. } => "unauthorized",
            RealtimeError::Forbidden { .. } => "forbidden",
            RealtimeError::InvalidArgument { .. } => "invalid_argument",
            RealtimeError::Conflict { .. } => "conflict",
            RealtimeError::Unavailable { .. } => "unavailable",
            RealtimeError::NotFound { .. } => "not_found",
        }
    }
}

impl From<StoreError> for RealtimeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => Self::Unavailable { message },
            StoreError::Duplicate(reason) => Self::Conflict { reason },
            StoreError::NotFound(what) => Self::NotFound { what },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_map_to_wire_codes() {
        let err: RealtimeError = StoreError::Unavailable("disk full".into()).into();
        assert_eq!(err.code(), "unavailable");

        let err: RealtimeError = StoreError::Duplicate("direct chat".into()).into();
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn display_includes_reason() {
        let err = RealtimeError::forbidden("only admins can post");
        assert_eq!(err.to_string(), "Forbidden: only admins can post");
    }
}
