//! Engine Error Types

use obd_protocol::ObdError;
use thiserror::Error;

/// Errors raised while starting or stopping a diagnostic session
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Obd(#[from] ObdError),

    /// A configured parameter name is not in the registry
    #[error("Unknown parameter {0}")]
    UnknownParameter(String),

    #[error("Poll interval of {0} must be at least 1ms")]
    InvalidInterval(String),

    /// The session was already stopped through another handle
    #[error("Session already stopped")]
    Stopped,

    #[error("Dispatcher task failed: {0}")]
    Dispatcher(String),
}
