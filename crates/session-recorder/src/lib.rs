//! Session Recorder
//!
//! Accumulates the decoded samples and events of one logging session in
//! timestamp order and hands out an immutable [`Session`] when sealed.

mod export;
mod recorder;

pub use export::{export_session, to_json, ExportRow};
pub use recorder::{Session, SessionEntry, SessionEvent, SessionRecorder};

use thiserror::Error;

/// Recorder errors
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for RecorderError {
    fn from(err: serde_json::Error) -> Self {
        RecorderError::SerializationError(err.to_string())
    }
}
