//! OBD-II PID Definitions
//!
//! Static, versioned table of the generic mode 01 parameters: how many data
//! bytes each answer carries, how those bytes become a physical value, the
//! unit and the valid range. Unknown identifiers fail fast.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ObdError, ObdResult};

/// Bumped whenever a definition in [`REGISTRY`] changes
pub const REGISTRY_VERSION: u32 = 1;

/// A parameter identifier: mode byte plus PID byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterId {
    pub mode: u8,
    pub pid: u8,
}

impl ParameterId {
    pub const fn new(mode: u8, pid: u8) -> Self {
        Self { mode, pid }
    }

    /// Mode 01 identifier
    pub const fn current(pid: u8) -> Self {
        Self::new(crate::mode::CURRENT_DATA, pid)
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.mode, self.pid)
    }
}

/// How the data bytes of an answer become a value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Formula {
    /// `A * scale + offset`
    Byte { scale: f64, offset: f64 },
    /// `(A * 256 + B) * scale + offset`
    Word { scale: f64, offset: f64 },
    /// `i16(A, B) * scale + offset`
    SignedWord { scale: f64, offset: f64 },
    /// Big-endian integer of all data bytes (bit-encoded parameters)
    Raw,
}

impl Formula {
    /// Data bytes the formula reads
    pub fn byte_len(&self) -> usize {
        match self {
            Formula::Byte { .. } => 1,
            Formula::Word { .. } | Formula::SignedWord { .. } => 2,
            Formula::Raw => 0,
        }
    }

    /// Apply the formula. `None` when `bytes` is shorter than
    /// [`Formula::byte_len`].
    pub fn decode(&self, bytes: &[u8]) -> Option<f64> {
        let value = match (*self, bytes) {
            (Formula::Byte { scale, offset }, [a, ..]) => *a as f64 * scale + offset,
            (Formula::Word { scale, offset }, [a, b, ..]) => {
                u16::from_be_bytes([*a, *b]) as f64 * scale + offset
            }
            (Formula::SignedWord { scale, offset }, [a, b, ..]) => {
                i16::from_be_bytes([*a, *b]) as f64 * scale + offset
            }
            (Formula::Raw, _) => bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64) as f64,
            _ => return None,
        };
        Some(value)
    }

    /// Inverse of [`Formula::decode`]: the bytes whose decode is closest to
    /// `value`, padded with zeros to `len`.
    pub fn encode(&self, value: f64, len: usize) -> Vec<u8> {
        let mut bytes = match *self {
            Formula::Byte { scale, offset } => {
                vec![((value - offset) / scale).round().clamp(0.0, 255.0) as u8]
            }
            Formula::Word { scale, offset } => {
                let raw = ((value - offset) / scale).round().clamp(0.0, u16::MAX as f64) as u16;
                raw.to_be_bytes().to_vec()
            }
            Formula::SignedWord { scale, offset } => {
                let raw = ((value - offset) / scale)
                    .round()
                    .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                raw.to_be_bytes().to_vec()
            }
            Formula::Raw => {
                let raw = value.round().max(0.0) as u64;
                let full = raw.to_be_bytes();
                full[full.len().saturating_sub(len)..].to_vec()
            }
        };
        bytes.resize(len.max(bytes.len()), 0);
        bytes
    }

    /// Largest error a decode of an encode may show: half a quantisation step
    pub fn tolerance(&self) -> f64 {
        match *self {
            Formula::Byte { scale, .. }
            | Formula::Word { scale, .. }
            | Formula::SignedWord { scale, .. } => scale.abs() / 2.0,
            Formula::Raw => 0.5,
        }
    }
}

/// Everything needed to request and interpret one parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDefinition {
    pub id: ParameterId,
    /// Human readable name
    pub name: &'static str,
    /// Configuration name, e.g. `RPM`
    pub short_name: &'static str,
    pub unit: &'static str,
    /// Data bytes after the service and PID echo
    pub response_len: usize,
    pub formula: Formula,
    pub min: f64,
    pub max: f64,
}

impl ParameterDefinition {
    /// Whether `value` lies inside the valid range
    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

const PERCENT: Formula = Formula::Byte {
    scale: 100.0 / 255.0,
    offset: 0.0,
};
const TEMPERATURE: Formula = Formula::Byte {
    scale: 1.0,
    offset: -40.0,
};
const FUEL_TRIM: Formula = Formula::Byte {
    scale: 100.0 / 128.0,
    offset: -100.0,
};
const COUNT: Formula = Formula::Word {
    scale: 1.0,
    offset: 0.0,
};

#[allow(clippy::too_many_arguments)]
const fn def(
    pid: u8,
    short_name: &'static str,
    name: &'static str,
    unit: &'static str,
    response_len: usize,
    formula: Formula,
    min: f64,
    max: f64,
) -> ParameterDefinition {
    ParameterDefinition {
        id: ParameterId::current(pid),
        name,
        short_name,
        unit,
        response_len,
        formula,
        min,
        max,
    }
}

/// Generic mode 01 parameters, sorted by PID
pub static REGISTRY: &[ParameterDefinition] = &[
    def(0x03, "FUEL_STATUS", "Fuel system status", "", 2, Formula::Raw, 0.0, 65535.0),
    def(0x04, "ENGINE_LOAD", "Calculated engine load", "%", 1, PERCENT, 0.0, 100.0),
    def(0x05, "COOLANT_TEMP", "Engine coolant temperature", "°C", 1, TEMPERATURE, -40.0, 215.0),
    def(0x06, "SHORT_FUEL_TRIM_1", "Short term fuel trim bank 1", "%", 1, FUEL_TRIM, -100.0, 99.21875),
    def(0x07, "LONG_FUEL_TRIM_1", "Long term fuel trim bank 1", "%", 1, FUEL_TRIM, -100.0, 99.21875),
    def(0x08, "SHORT_FUEL_TRIM_2", "Short term fuel trim bank 2", "%", 1, FUEL_TRIM, -100.0, 99.21875),
    def(0x09, "LONG_FUEL_TRIM_2", "Long term fuel trim bank 2", "%", 1, FUEL_TRIM, -100.0, 99.21875),
    def(0x0A, "FUEL_PRESSURE", "Fuel pressure", "kPa", 1, Formula::Byte { scale: 3.0, offset: 0.0 }, 0.0, 765.0),
    def(0x0B, "INTAKE_PRESSURE", "Intake manifold absolute pressure", "kPa", 1, Formula::Byte { scale: 1.0, offset: 0.0 }, 0.0, 255.0),
    def(0x0C, "RPM", "Engine speed", "rpm", 2, Formula::Word { scale: 0.25, offset: 0.0 }, 0.0, 16383.75),
    def(0x0D, "SPEED", "Vehicle speed", "km/h", 1, Formula::Byte { scale: 1.0, offset: 0.0 }, 0.0, 255.0),
    def(0x0E, "TIMING_ADVANCE", "Timing advance", "°", 1, Formula::Byte { scale: 0.5, offset: -64.0 }, -64.0, 63.5),
    def(0x0F, "INTAKE_TEMP", "Intake air temperature", "°C", 1, TEMPERATURE, -40.0, 215.0),
    def(0x10, "MAF", "Mass air flow rate", "g/s", 2, Formula::Word { scale: 0.01, offset: 0.0 }, 0.0, 655.35),
    def(0x11, "THROTTLE_POS", "Throttle position", "%", 1, PERCENT, 0.0, 100.0),
    def(0x14, "O2_B1S1", "Oxygen sensor bank 1 sensor 1 voltage", "V", 2, Formula::Byte { scale: 0.005, offset: 0.0 }, 0.0, 1.275),
    def(0x1F, "RUN_TIME", "Run time since engine start", "s", 2, COUNT, 0.0, 65535.0),
    def(0x21, "DISTANCE_W_MIL", "Distance traveled with MIL on", "km", 2, COUNT, 0.0, 65535.0),
    def(0x22, "FUEL_RAIL_PRESSURE_VAC", "Fuel rail pressure (relative to vacuum)", "kPa", 2, Formula::Word { scale: 0.079, offset: 0.0 }, 0.0, 5177.265),
    def(0x23, "FUEL_RAIL_PRESSURE_DIRECT", "Fuel rail gauge pressure", "kPa", 2, Formula::Word { scale: 10.0, offset: 0.0 }, 0.0, 655350.0),
    def(0x2C, "COMMANDED_EGR", "Commanded EGR", "%", 1, PERCENT, 0.0, 100.0),
    def(0x2F, "FUEL_LEVEL", "Fuel tank level input", "%", 1, PERCENT, 0.0, 100.0),
    def(0x31, "DISTANCE_SINCE_DTC_CLEAR", "Distance traveled since codes cleared", "km", 2, COUNT, 0.0, 65535.0),
    def(0x32, "EVAP_VAPOR_PRESSURE", "Evap system vapor pressure", "Pa", 2, Formula::SignedWord { scale: 0.25, offset: 0.0 }, -8192.0, 8191.75),
    def(0x33, "BAROMETRIC_PRESSURE", "Absolute barometric pressure", "kPa", 1, Formula::Byte { scale: 1.0, offset: 0.0 }, 0.0, 255.0),
    def(0x3C, "CATALYST_TEMP_B1S1", "Catalyst temperature bank 1 sensor 1", "°C", 2, Formula::Word { scale: 0.1, offset: -40.0 }, -40.0, 6513.5),
    def(0x42, "CONTROL_MODULE_VOLTAGE", "Control module voltage", "V", 2, Formula::Word { scale: 0.001, offset: 0.0 }, 0.0, 65.535),
    def(0x43, "ABSOLUTE_LOAD", "Absolute load value", "%", 2, Formula::Word { scale: 100.0 / 255.0, offset: 0.0 }, 0.0, 25700.0),
    def(0x44, "COMMANDED_EQUIV_RATIO", "Commanded air-fuel equivalence ratio", "ratio", 2, Formula::Word { scale: 2.0 / 65536.0, offset: 0.0 }, 0.0, 1.999969482421875),
    def(0x45, "RELATIVE_THROTTLE_POS", "Relative throttle position", "%", 1, PERCENT, 0.0, 100.0),
    def(0x46, "AMBIANT_AIR_TEMP", "Ambient air temperature", "°C", 1, TEMPERATURE, -40.0, 215.0),
    def(0x47, "THROTTLE_POS_B", "Absolute throttle position B", "%", 1, PERCENT, 0.0, 100.0),
    def(0x49, "ACCELERATOR_POS_D", "Accelerator pedal position D", "%", 1, PERCENT, 0.0, 100.0),
    def(0x4A, "ACCELERATOR_POS_E", "Accelerator pedal position E", "%", 1, PERCENT, 0.0, 100.0),
    def(0x4C, "THROTTLE_ACTUATOR", "Commanded throttle actuator", "%", 1, PERCENT, 0.0, 100.0),
    def(0x4D, "RUN_TIME_MIL", "Time run with MIL on", "min", 2, COUNT, 0.0, 65535.0),
    def(0x4E, "TIME_SINCE_DTC_CLEARED", "Time since trouble codes cleared", "min", 2, COUNT, 0.0, 65535.0),
    def(0x5C, "OIL_TEMP", "Engine oil temperature", "°C", 1, TEMPERATURE, -40.0, 210.0),
    def(0x5E, "FUEL_RATE", "Engine fuel rate", "L/h", 2, Formula::Word { scale: 0.05, offset: 0.0 }, 0.0, 3276.75),
];

/// Look up a parameter definition.
pub fn lookup(id: ParameterId) -> ObdResult<&'static ParameterDefinition> {
    if id.mode != crate::mode::CURRENT_DATA {
        return Err(ObdError::NotSupported {
            mode: id.mode,
            pid: id.pid,
        });
    }
    REGISTRY
        .binary_search_by_key(&id.pid, |d| d.id.pid)
        .map(|index| &REGISTRY[index])
        .map_err(|_| ObdError::NotSupported {
            mode: id.mode,
            pid: id.pid,
        })
}

/// Look up a parameter by its configuration name (case-insensitive).
pub fn lookup_name(short_name: &str) -> Option<&'static ParameterDefinition> {
    REGISTRY
        .iter()
        .find(|d| d.short_name.eq_ignore_ascii_case(short_name.trim()))
}
