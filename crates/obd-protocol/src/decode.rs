//! Sample decoding.
//!
//! Pure functions from response bytes to typed samples. Out-of-range values
//! are clamped and flagged; a wrong byte count is always an error.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dtc::{DtcStatus, TroubleCode};
use crate::elm::RESPONSE_SID_OFFSET;
use crate::error::{ObdError, ObdResult};
use crate::pid::{ParameterDefinition, ParameterId};

/// A decoded measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: ParameterId,
    /// Configuration name of the parameter, e.g. `RPM`
    pub name: String,
    pub value: f64,
    pub unit: String,
    /// Unix time in milliseconds when the answer arrived
    pub timestamp_ms: u64,
    /// No fresh answer within the expected poll interval
    pub stale: bool,
    /// The raw value was outside the valid range and was clamped
    pub clamped: bool,
}

impl Sample {
    /// Copy of this sample with `stale` set if it is older than `max_age_ms`
    /// at `now_ms`.
    pub fn aged(&self, now_ms: u64, max_age_ms: u64) -> Self {
        Self {
            stale: self.stale || now_ms.saturating_sub(self.timestamp_ms) > max_age_ms,
            ..self.clone()
        }
    }
}

fn check_header(message: &[u8], header: &[u8], def: &ParameterDefinition) -> ObdResult<()> {
    if message.len() < header.len() || &message[..header.len()] != header {
        return Err(ObdError::MalformedResponse(format!(
            "{}: expected header {:02X?}, got {:02X?}",
            def.short_name, header, message
        )));
    }
    let data_len = message.len() - header.len();
    if data_len != def.response_len {
        return Err(ObdError::MalformedResponse(format!(
            "{}: expected {} data bytes, got {}",
            def.short_name, def.response_len, data_len
        )));
    }
    Ok(())
}

fn build_sample(def: &ParameterDefinition, data: &[u8], timestamp_ms: u64) -> ObdResult<Sample> {
    let raw = def.formula.decode(data).ok_or_else(|| {
        ObdError::MalformedResponse(format!(
            "{}: {} data bytes are too few for its formula",
            def.short_name,
            data.len()
        ))
    })?;
    let clamped = !def.in_range(raw);
    let value = if clamped {
        warn!(
            pid = %def.id,
            "{} value {} outside [{}, {}], clamping",
            def.short_name, raw, def.min, def.max
        );
        raw.clamp(def.min, def.max)
    } else {
        raw
    };

    Ok(Sample {
        id: def.id,
        name: def.short_name.to_string(),
        value,
        unit: def.unit.to_string(),
        timestamp_ms,
        stale: false,
        clamped,
    })
}

/// Decode a mode 01 message (`41 <pid> <data>`).
pub fn decode_sample(def: &ParameterDefinition, message: &[u8], timestamp_ms: u64) -> ObdResult<Sample> {
    let header = [def.id.mode + RESPONSE_SID_OFFSET, def.id.pid];
    check_header(message, &header, def)?;
    build_sample(def, &message[header.len()..], timestamp_ms)
}

/// Decode a mode 02 message (`42 <pid> <frame> <data>`) for a parameter
/// captured in freeze frame `frame`.
pub fn decode_freeze_frame(
    def: &ParameterDefinition,
    frame: u8,
    message: &[u8],
    timestamp_ms: u64,
) -> ObdResult<Sample> {
    let header = [crate::mode::FREEZE_FRAME + RESPONSE_SID_OFFSET, def.id.pid, frame];
    check_header(message, &header, def)?;
    let mut sample = build_sample(def, &message[header.len()..], timestamp_ms)?;
    sample.id = ParameterId::new(crate::mode::FREEZE_FRAME, def.id.pid);
    Ok(sample)
}

/// Decode the answer to `0202<frame>`: the code that stored the freeze
/// frame, or `None` when no frame is stored.
pub fn decode_freeze_frame_dtc(frame: u8, message: &[u8]) -> ObdResult<Option<TroubleCode>> {
    match message {
        [0x42, 0x02, f, high, low] if *f == frame => {
            let raw = u16::from_be_bytes([*high, *low]);
            Ok((raw != 0).then(|| TroubleCode::from_raw(raw, DtcStatus::Confirmed)))
        }
        _ => Err(ObdError::MalformedResponse(format!(
            "unexpected freeze frame DTC message {:02X?}",
            message
        ))),
    }
}
