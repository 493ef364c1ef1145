//! Gateway Error Types
//!
//! Centralized error handling. Every error class here is recoverable: at worst
//! it tears down the single connection it belongs to.

use thiserror::Error;

/// Gateway error type
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::InvalidFrame(_) => "invalid_frame",
            GatewayError::Validation(_) => "validation_failed",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::Database(_) => "persistence_failed",
            GatewayError::Broker(_) => "broker_unavailable",
            GatewayError::ConnectionClosed => "connection_closed",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to echo back to a client. Infrastructure details stay in
    /// the logs.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Database(e) => {
                tracing::error!(error = %e, "database error");
                "message could not be persisted".into()
            }
            GatewayError::Broker(e) => {
                tracing::error!(error = %e, "broker error");
                "event delivery temporarily unavailable".into()
            }
            GatewayError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                "internal error".into()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::Unauthorized("x".into()).code(), "unauthorized");
        assert_eq!(GatewayError::InvalidFrame("x".into()).code(), "invalid_frame");
        assert_eq!(GatewayError::ConnectionClosed.code(), "connection_closed");
    }

    #[test]
    fn client_message_hides_internals() {
        let err = GatewayError::Internal("pool exhausted".into());
        assert_eq!(err.client_message(), "internal error");
    }
}
