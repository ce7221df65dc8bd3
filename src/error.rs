// Relay error taxonomy - everything a client ack frame can carry
use serde_json::{json, Value};

/// Authentication failures surfaced at connection time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("token is expired or invalid")]
    ExpiredToken,
    #[error("identity service unreachable: {0}")]
    Unreachable(String),
}

/// A privileged action the caller's identity does not permit.
#[derive(Debug, Clone, thiserror::Error)]
#[error("permission denied: {action} requires {required}")]
pub struct PermissionError {
    pub action: String,
    pub required: String,
}

/// Failures of a single dispatched request. Always local to that request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// Client tried to forge reserved fields or sent a malformed action
    #[error("invalid request shape: {0}")]
    InvalidRequestShape(String),
    /// No response arrived before the deadline; the relay never auto-retries
    #[error("request timed out")]
    Timeout,
    /// The owning session disconnected before a response arrived
    #[error("request cancelled")]
    Cancelled,
    #[error("message bus unavailable: {0}")]
    BusUnavailable(String),
}

/// Top-level relay error, serialized into the `{success:false, error}` ack.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Client frame the relay could not interpret
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    /// Stable wire code for client handling
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Auth(AuthError::InvalidCredentials) => "INVALID_CREDENTIALS",
            RelayError::Auth(AuthError::ExpiredToken) => "TOKEN_EXPIRED",
            RelayError::Auth(AuthError::Unreachable(_)) => "IDENTITY_UNREACHABLE",
            RelayError::Permission(_) => "FORBIDDEN",
            RelayError::Dispatch(DispatchError::InvalidRequestShape(_)) => "INVALID_REQUEST_SHAPE",
            RelayError::Dispatch(DispatchError::Timeout) => "TIMEOUT",
            RelayError::Dispatch(DispatchError::Cancelled) => "CANCELLED",
            RelayError::Dispatch(DispatchError::BusUnavailable(_)) => "BUS_UNAVAILABLE",
            RelayError::Protocol(_) => "PROTOCOL_ERROR",
        }
    }

    /// Convert to the `error` object carried in a failed ack
    pub fn to_error_value(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}
