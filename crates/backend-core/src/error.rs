use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::ConnectionState;

/// Broad error category used for retry decisions and log triage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure (bad credentials, rejected login).
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Malformed frame, unexpected payload, or failed handshake.
    Protocol,
    /// Structured error payload returned by the remote service.
    Backend,
    /// A named room/channel/user could not be resolved.
    NotFound,
    /// Rate-limited by the remote service.
    RateLimited,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload returned by every connection operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BackendError {
    /// High-level error category.
    pub category: BackendErrorCategory,
    /// Stable machine-readable error code (backend error codes pass through).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl BackendError {
    /// Construct a new backend error.
    pub fn new(
        category: BackendErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            BackendErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is in state {current:?}"),
        )
    }

    /// Build a `NotFound` error for an unresolvable name.
    pub fn not_found(what: &str, name: &str) -> Self {
        Self::new(
            BackendErrorCategory::NotFound,
            "not_found",
            format!("{what} not found: {name}"),
        )
    }

    /// Build a transport error.
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Network, code, message)
    }

    /// Build a protocol error.
    pub fn protocol(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorCategory::Protocol, code, message)
    }

    /// Build an error for an operation that needs a live session.
    pub fn not_connected(connection: &str) -> Self {
        Self::new(
            BackendErrorCategory::Network,
            "not_connected",
            format!("connection '{connection}' is not connected"),
        )
    }

    /// Whether blindly retrying the failed operation may succeed.
    ///
    /// Credential and configuration failures are not retryable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            BackendErrorCategory::Network
                | BackendErrorCategory::Protocol
                | BackendErrorCategory::RateLimited
        )
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self::network("io_error", err.to_string())
    }
}

/// Map HTTP status codes to backend error categories.
pub fn classify_http_status(status: u16) -> BackendErrorCategory {
    match status {
        401 | 403 => BackendErrorCategory::Auth,
        404 => BackendErrorCategory::NotFound,
        408 | 429 => BackendErrorCategory::RateLimited,
        400..=499 => BackendErrorCategory::Backend,
        500..=599 => BackendErrorCategory::Network,
        _ => BackendErrorCategory::Internal,
    }
}
