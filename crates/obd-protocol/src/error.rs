//! OBD-II Error Types

use crate::session::ConnectionState;
use thiserror::Error;

/// Errors that can occur during OBD-II communication and decoding
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ObdError {
    /// Adapter unreachable, handshake failed or the channel went dead.
    /// Fatal to the current session; requires an explicit reconnect.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serial port I/O error
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Timeout waiting for response
    #[error("Timeout waiting for OBD response after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Adapter answered with something that is not a known response shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Adapter reported `NO DATA` for the request
    #[error("No data returned for request {0}")]
    NoData(String),

    /// ECU answered with a negative response (`7F <service> <code>`)
    #[error("Negative response to service {service:02X}: code {code:02X}")]
    NegativeResponse { service: u8, code: u8 },

    /// PID not supported by vehicle or unknown to the registry
    #[error("PID {mode:02X} {pid:02X} not supported")]
    NotSupported { mode: u8, pid: u8 },

    /// Wrong byte count or invalid bit pattern in a response
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// A multi-segment response is missing segments
    #[error("Incomplete data: {0}")]
    IncompleteData(String),

    /// Operation not allowed in the current adapter state
    #[error("Adapter is {actual}, operation requires {expected}")]
    InvalidState {
        expected: ConnectionState,
        actual: ConnectionState,
    },

    /// Request queue is full of urgent requests
    #[error("Request queue is full")]
    QueueFull,

    /// Request was evicted from the queue to make room for newer work
    #[error("Request dropped from queue")]
    Dropped,

    /// Request was cancelled by session teardown
    #[error("Request cancelled")]
    Cancelled,
}

impl ObdError {
    /// Only timeouts are worth retrying; everything else is surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ObdError::Timeout { .. })
    }

    /// Errors that end the session's connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ObdError::Connection(_) | ObdError::Serial(_))
    }

    /// Short label used for metrics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            ObdError::Connection(_) => "connection",
            ObdError::Serial(_) => "serial",
            ObdError::Timeout { .. } => "timeout",
            ObdError::Protocol(_) => "protocol",
            ObdError::NoData(_) => "no_data",
            ObdError::NegativeResponse { .. } => "negative_response",
            ObdError::NotSupported { .. } => "not_supported",
            ObdError::MalformedResponse(_) => "malformed_response",
            ObdError::IncompleteData(_) => "incomplete_data",
            ObdError::InvalidState { .. } => "invalid_state",
            ObdError::QueueFull => "queue_full",
            ObdError::Dropped => "dropped",
            ObdError::Cancelled => "cancelled",
        }
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Serial(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::Connection(err.to_string())
    }
}

/// Convenience alias for OBD results
pub type ObdResult<T> = Result<T, ObdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeout_is_retryable() {
        assert!(ObdError::Timeout { timeout_ms: 100 }.is_retryable());
        assert!(!ObdError::Protocol("?".into()).is_retryable());
        assert!(!ObdError::NoData("010C".into()).is_retryable());
        assert!(!ObdError::MalformedResponse("short".into()).is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ObdError::Connection("dead".into()).is_fatal());
        assert!(ObdError::Serial("unplugged".into()).is_fatal());
        assert!(!ObdError::Timeout { timeout_ms: 1 }.is_fatal());
    }

    #[test]
    fn test_display_formats_hex() {
        let err = ObdError::NotSupported { mode: 0x01, pid: 0x0C };
        assert_eq!(err.to_string(), "PID 01 0C not supported");
    }
}
