//! Recorder Implementation

use chrono::{DateTime, Utc};
use obd_protocol::{ConnectionState, DtcKind, ParameterId, Sample, TroubleCode, VehicleSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Something that happened during a session other than a measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionStateChanged {
        state: ConnectionState,
    },
    DtcsRead {
        kind: DtcKind,
        codes: Vec<TroubleCode>,
    },
    DtcsCleared,
    /// A poll produced no sample; the value is missing, not defaulted
    SampleMissing {
        id: ParameterId,
        name: String,
        reason: String,
    },
}

/// One entry of the session log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum SessionEntry {
    Sample(Sample),
    Event {
        timestamp_ms: u64,
        event: SessionEvent,
    },
}

impl SessionEntry {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            SessionEntry::Sample(sample) => sample.timestamp_ms,
            SessionEntry::Event { timestamp_ms, .. } => *timestamp_ms,
        }
    }
}

/// Single writer of a session's log.
///
/// Entries are kept sorted by timestamp: a late arrival is inserted where
/// it belongs, after any entry with the same timestamp.
#[derive(Debug)]
pub struct SessionRecorder {
    id: Uuid,
    started_at: DateTime<Utc>,
    vehicle: VehicleSnapshot,
    entries: Vec<SessionEntry>,
}

impl SessionRecorder {
    /// Start a new session now
    pub fn new(vehicle: VehicleSnapshot) -> Self {
        Self::with_start(Uuid::new_v4(), Utc::now(), vehicle)
    }

    pub fn with_start(id: Uuid, started_at: DateTime<Utc>, vehicle: VehicleSnapshot) -> Self {
        info!("Recording session {}", id);
        Self {
            id,
            started_at,
            vehicle,
            entries: Vec::with_capacity(1024),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn append_sample(&mut self, sample: Sample) {
        self.insert(SessionEntry::Sample(sample));
        metrics::counter!("obd_samples_recorded_total").increment(1);
    }

    pub fn append_event(&mut self, timestamp_ms: u64, event: SessionEvent) {
        self.insert(SessionEntry::Event {
            timestamp_ms,
            event,
        });
    }

    fn insert(&mut self, entry: SessionEntry) {
        let timestamp = entry.timestamp_ms();
        let position = self
            .entries
            .partition_point(|e| e.timestamp_ms() <= timestamp);
        if position < self.entries.len() {
            debug!(
                "Late entry at {} inserted before {} newer entries",
                timestamp,
                self.entries.len() - position
            );
        }
        self.entries.insert(position, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seal the session. No further appends are possible.
    pub fn finalize(self) -> Session {
        let ended_at = Utc::now();
        info!(
            "Session {} finalized with {} entries",
            self.id,
            self.entries.len()
        );
        Session {
            id: self.id,
            started_at: self.started_at,
            ended_at,
            vehicle: self.vehicle,
            entries: self.entries,
        }
    }
}

/// A sealed, read-only session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    vehicle: VehicleSnapshot,
    entries: Vec<SessionEntry>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    pub fn vehicle(&self) -> &VehicleSnapshot {
        &self.vehicle
    }

    /// All entries in timestamp order
    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.entries.iter().filter_map(|e| match e {
            SessionEntry::Sample(sample) => Some(sample),
            _ => None,
        })
    }

    pub fn events(&self) -> impl Iterator<Item = (u64, &SessionEvent)> {
        self.entries.iter().filter_map(|e| match e {
            SessionEntry::Event {
                timestamp_ms,
                event,
            } => Some((*timestamp_ms, event)),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
