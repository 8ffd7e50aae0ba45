//! Session export.
//!
//! Rows are handed to an external writer (CSV or otherwise); the JSON
//! document bundles rows, events and vehicle identification.

use chrono::{DateTime, Utc};
use obd_protocol::VehicleSnapshot;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::recorder::{Session, SessionEvent};
use crate::RecorderError;

/// One exported measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub timestamp_ms: u64,
    pub parameter: String,
    pub value: f64,
    pub unit: String,
}

/// Samples of a session as rows, in timestamp order
pub fn export_session(session: &Session) -> Vec<ExportRow> {
    session
        .samples()
        .map(|sample| ExportRow {
            timestamp_ms: sample.timestamp_ms,
            parameter: sample.name.clone(),
            value: sample.value,
            unit: sample.unit.clone(),
        })
        .collect()
}

#[derive(Serialize)]
struct EventRecord<'a> {
    timestamp_ms: u64,
    #[serde(flatten)]
    event: &'a SessionEvent,
}

#[derive(Serialize)]
struct SessionDocument<'a> {
    exported_at: DateTime<Utc>,
    application: String,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    vehicle: &'a VehicleSnapshot,
    rows: Vec<ExportRow>,
    events: Vec<EventRecord<'a>>,
}

/// Pretty-printed JSON document of the whole session
pub fn to_json(session: &Session) -> Result<String, RecorderError> {
    let document = SessionDocument {
        exported_at: Utc::now(),
        application: format!("obd-diagnostics v{}", env!("CARGO_PKG_VERSION")),
        session_id: session.id(),
        started_at: session.started_at(),
        ended_at: session.ended_at(),
        vehicle: session.vehicle(),
        rows: export_session(session),
        events: session
            .events()
            .map(|(timestamp_ms, event)| EventRecord {
                timestamp_ms,
                event,
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&document)?)
}
