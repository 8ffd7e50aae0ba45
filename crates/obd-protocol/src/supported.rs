//! Supported-PID snapshot.
//!
//! The vehicle advertises its mode 01 PIDs as 32-bit bitmaps answering
//! `0100`, `0120`, `0140`, ... The highest bit of byte A stands for PID
//! `base + 1`; the lowest bit of byte D for `base + 0x20`, which doubles as
//! "the next range is answered too". The snapshot is captured once per
//! session and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::elm::AdapterResponse;
use crate::error::{ObdError, ObdResult};
use crate::pid::{ParameterDefinition, ParameterId, REGISTRY};

/// Bases of the bitmap requests, in the order they are chained
pub const BITMAP_BASES: [u8; 7] = [0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0];

/// PIDs the vehicle said it answers in mode 01
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedPids {
    pids: BTreeSet<u8>,
}

impl SupportedPids {
    pub fn from_pids(pids: impl IntoIterator<Item = u8>) -> Self {
        Self {
            pids: pids.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: ParameterId) -> bool {
        id.mode == crate::mode::CURRENT_DATA && self.pids.contains(&id.pid)
    }

    /// Whether the bitmap for the range after `base` should be requested
    pub fn next_range_supported(&self, base: u8) -> bool {
        base.checked_add(0x20)
            .map(|next| self.pids.contains(&next))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = ParameterId> + '_ {
        self.pids.iter().map(|&pid| ParameterId::current(pid))
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// Expand one 4-byte bitmap into the PIDs it marks.
pub fn parse_bitmap(base: u8, data: &[u8]) -> ObdResult<Vec<u8>> {
    if data.len() != 4 {
        return Err(ObdError::MalformedResponse(format!(
            "supported-PID bitmap for {:02X} has {} bytes",
            base,
            data.len()
        )));
    }
    let mut pids = Vec::new();
    for (i, byte) in data.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) == 0 {
                continue;
            }
            // Past 0xFF in the last range
            if let Some(pid) = base.checked_add(1 + (i * 8 + bit) as u8) {
                pids.push(pid);
            }
        }
    }
    Ok(pids)
}

/// Union of the bitmaps every ECU sent in answer to `01<base>`.
pub fn decode_bitmap_response(base: u8, response: &AdapterResponse) -> ObdResult<Vec<u8>> {
    let mut pids = BTreeSet::new();
    for message in &response.messages {
        let data = message.get(2..).unwrap_or_default();
        pids.extend(parse_bitmap(base, data)?);
    }
    Ok(pids.into_iter().collect())
}

/// Registry entries the vehicle supports. Everything else is unavailable
/// and must not be polled.
pub fn supported_identifiers(snapshot: &SupportedPids) -> Vec<&'static ParameterDefinition> {
    REGISTRY
        .iter()
        .filter(|def| snapshot.contains(def.id))
        .collect()
}
