//! Diagnostic trouble code decoding.
//!
//! Each code travels as two bytes:
//!
//! ```text
//!   byte 0: CC DD HHHH   CC = category (P/C/B/U), DD = first digit (0-3),
//!                        HHHH = second digit
//!   byte 1: HHHH HHHH    third and fourth digits
//! ```
//!
//! `0x0000` is padding, not `P0000`. CAN replies prefix the codes with a
//! count byte; legacy replies pad the frame with zero pairs instead.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::elm::AdapterResponse;
use crate::error::{ObdError, ObdResult};

/// Which trouble-code memory to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcKind {
    /// Mode 03: confirmed codes that lit the MIL
    Stored,
    /// Mode 07: codes detected during the current or last drive cycle
    Pending,
    /// Mode 0A: codes that survive a clear
    Permanent,
}

impl DtcKind {
    pub fn mode(&self) -> u8 {
        match self {
            DtcKind::Stored => crate::mode::READ_DTC,
            DtcKind::Pending => crate::mode::PENDING_DTC,
            DtcKind::Permanent => crate::mode::PERMANENT_DTC,
        }
    }

    /// Status given to every code read from this memory
    pub fn status(&self) -> DtcStatus {
        match self {
            DtcKind::Stored => DtcStatus::Confirmed,
            DtcKind::Pending => DtcStatus::Pending,
            DtcKind::Permanent => DtcStatus::Permanent,
        }
    }
}

/// DTC category from the two high bits of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcCategory {
    /// P: engine and transmission
    Powertrain,
    /// C: ABS, steering, suspension
    Chassis,
    /// B: airbags, climate, lighting
    Body,
    /// U: network and communication
    Network,
}

impl DtcCategory {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    fn bits(&self) -> u8 {
        match self {
            DtcCategory::Powertrain => 0,
            DtcCategory::Chassis => 1,
            DtcCategory::Body => 2,
            DtcCategory::Network => 3,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'P' => Some(DtcCategory::Powertrain),
            'C' => Some(DtcCategory::Chassis),
            'B' => Some(DtcCategory::Body),
            'U' => Some(DtcCategory::Network),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DtcCategory::Powertrain => "Powertrain",
            DtcCategory::Chassis => "Chassis",
            DtcCategory::Body => "Body",
            DtcCategory::Network => "Network",
        }
    }
}

/// SAE-defined code or one reserved for the manufacturer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcScope {
    Generic,
    Manufacturer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcStatus {
    Pending,
    Confirmed,
    Permanent,
}

impl fmt::Display for DtcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DtcStatus::Pending => "pending",
            DtcStatus::Confirmed => "confirmed",
            DtcStatus::Permanent => "permanent",
        })
    }
}

/// A decoded trouble code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TroubleCode {
    /// Canonical code string, e.g. `P0133`
    pub code: String,
    pub category: DtcCategory,
    pub scope: DtcScope,
    pub status: DtcStatus,
    /// The two bytes the code was decoded from
    pub raw: u16,
}

fn scope_of(category: DtcCategory, first_digit: u8, second_digit: u8) -> DtcScope {
    match (category, first_digit) {
        (_, 0) | (_, 2) => DtcScope::Generic,
        // P3400-P3999 are SAE, P3000-P33FF belong to the manufacturer
        (DtcCategory::Powertrain, 3) if second_digit >= 4 => DtcScope::Generic,
        _ => DtcScope::Manufacturer,
    }
}

impl TroubleCode {
    /// Decode one raw bitfield. Every `u16` maps to exactly one code.
    pub fn from_raw(raw: u16, status: DtcStatus) -> Self {
        let [high, low] = raw.to_be_bytes();
        let category = DtcCategory::from_bits(high >> 6);
        let first_digit = (high >> 4) & 0x03;
        let second_digit = high & 0x0F;
        let code = format!(
            "{}{}{:X}{:02X}",
            category.letter(),
            first_digit,
            second_digit,
            low
        );
        Self {
            code,
            category,
            scope: scope_of(category, first_digit, second_digit),
            status,
            raw,
        }
    }

    /// Parse a code string such as `P0133` or `u0100`.
    pub fn parse(code: &str, status: DtcStatus) -> ObdResult<Self> {
        let invalid = || ObdError::MalformedResponse(format!("invalid trouble code {:?}", code));
        let code = code.trim();
        let mut chars = code.chars();
        let category = chars
            .next()
            .and_then(DtcCategory::from_letter)
            .ok_or_else(invalid)?;
        let first_digit = chars
            .next()
            .and_then(|c| c.to_digit(4))
            .ok_or_else(invalid)? as u16;
        let rest = chars.as_str();
        if rest.len() != 3 || !rest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let digits = u16::from_str_radix(rest, 16).map_err(|_| invalid())?;
        let raw = ((category.bits() as u16) << 14) | (first_digit << 12) | digits;
        Ok(Self::from_raw(raw, status))
    }

    /// Raw two-byte form, the inverse of [`TroubleCode::from_raw`]
    pub fn encode(&self) -> u16 {
        self.raw
    }
}

impl fmt::Display for TroubleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

/// Decode one DTC message (service byte included).
pub fn decode_dtc_message(kind: DtcKind, message: &[u8]) -> ObdResult<Vec<TroubleCode>> {
    let service = kind.mode() + crate::elm::RESPONSE_SID_OFFSET;
    let payload = match message.split_first() {
        Some((&sid, payload)) if sid == service => payload,
        _ => {
            return Err(ObdError::MalformedResponse(format!(
                "expected service {:02X}, got {:02X?}",
                service, message
            )))
        }
    };

    let pairs = if payload.len() % 2 == 1 {
        let count = payload[0] as usize;
        let pairs = &payload[1..];
        if pairs.len() != count * 2 {
            return Err(ObdError::MalformedResponse(format!(
                "DTC count {} does not match {} data bytes",
                count,
                pairs.len()
            )));
        }
        pairs
    } else {
        payload
    };

    let status = kind.status();
    Ok(pairs
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .filter(|&raw| raw != 0)
        .map(|raw| TroubleCode::from_raw(raw, status))
        .collect())
}

/// Decode every ECU's answer to a DTC read.
///
/// An empty list is a valid result; a code reported by several ECUs
/// appears once.
pub fn decode_dtc_response(kind: DtcKind, response: &AdapterResponse) -> ObdResult<Vec<TroubleCode>> {
    let mut codes: Vec<TroubleCode> = Vec::new();
    for message in &response.messages {
        for code in decode_dtc_message(kind, message)? {
            if !codes.iter().any(|c| c.raw == code.raw) {
                codes.push(code);
            }
        }
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_two_stored_codes() {
        let codes = decode_dtc_message(DtcKind::Stored, &[0x43, 0x02, 0x01, 0x33, 0x04, 0x01]).unwrap();
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].code, "P0133");
        assert_eq!(codes[1].code, "P0401");
        for code in &codes {
            assert_eq!(code.category, DtcCategory::Powertrain);
            assert_eq!(code.scope, DtcScope::Generic);
            assert_eq!(code.status, DtcStatus::Confirmed);
        }
    }

    #[test]
    fn test_legacy_padded_layout() {
        let codes = decode_dtc_message(
            DtcKind::Stored,
            &[0x43, 0x01, 0x33, 0x00, 0x00, 0x00, 0x00],
        )
        .unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].code, "P0133");
    }

    #[test]
    fn test_zero_codes_is_valid() {
        assert!(decode_dtc_message(DtcKind::Pending, &[0x47, 0x00]).unwrap().is_empty());
        assert!(decode_dtc_message(DtcKind::Stored, &[0x43, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_count_mismatch_is_malformed() {
        let err = decode_dtc_message(DtcKind::Stored, &[0x43, 0x03, 0x01, 0x33, 0x04, 0x01]).unwrap_err();
        assert!(matches!(err, ObdError::MalformedResponse(_)));
    }

    #[test]
    fn test_wrong_service_is_malformed() {
        let err = decode_dtc_message(DtcKind::Pending, &[0x43, 0x00]).unwrap_err();
        assert!(matches!(err, ObdError::MalformedResponse(_)));
    }

    #[test]
    fn test_categories_and_scope() {
        let cases = [
            (0x0133, "P0133", DtcCategory::Powertrain, DtcScope::Generic),
            (0x1234, "P1234", DtcCategory::Powertrain, DtcScope::Manufacturer),
            (0x2101, "P2101", DtcCategory::Powertrain, DtcScope::Generic),
            (0x3000, "P3000", DtcCategory::Powertrain, DtcScope::Manufacturer),
            (0x3400, "P3400", DtcCategory::Powertrain, DtcScope::Generic),
            (0x4035, "C0035", DtcCategory::Chassis, DtcScope::Generic),
            (0x9000, "B1000", DtcCategory::Body, DtcScope::Manufacturer),
            (0xC100, "U0100", DtcCategory::Network, DtcScope::Generic),
            (0xF0AB, "U30AB", DtcCategory::Network, DtcScope::Manufacturer),
        ];
        for (raw, code, category, scope) in cases {
            let dtc = TroubleCode::from_raw(raw, DtcStatus::Confirmed);
            assert_eq!(dtc.code, code);
            assert_eq!(dtc.category, category);
            assert_eq!(dtc.scope, scope, "{code}");
        }
    }

    #[test]
    fn test_parse_code_string() {
        let dtc = TroubleCode::parse("u0100", DtcStatus::Pending).unwrap();
        assert_eq!(dtc.code, "U0100");
        assert_eq!(dtc.encode(), 0xC100);
        assert!(TroubleCode::parse("X0100", DtcStatus::Pending).is_err());
        assert!(TroubleCode::parse("P4100", DtcStatus::Pending).is_err());
        assert!(TroubleCode::parse("P010", DtcStatus::Pending).is_err());
        assert!(TroubleCode::parse("P01G0", DtcStatus::Pending).is_err());
    }

    #[test]
    fn test_response_deduplicates_across_ecus() {
        use crate::elm::AdapterRequest;
        let response = AdapterResponse {
            request: AdapterRequest::ReadDtcs(DtcKind::Stored),
            messages: vec![
                vec![0x43, 0x01, 0x01, 0x33],
                vec![0x43, 0x02, 0x01, 0x33, 0xC1, 0x00],
            ],
        };
        let codes = decode_dtc_response(DtcKind::Stored, &response).unwrap();
        let names: Vec<_> = codes.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(names, vec!["P0133", "U0100"]);
    }

    proptest! {
        #[test]
        fn prop_decode_encode_decode_is_identical(raws in proptest::collection::vec(1u16..=u16::MAX, 0..8)) {
            let mut message = vec![0x43, raws.len() as u8];
            for raw in &raws {
                message.extend_from_slice(&raw.to_be_bytes());
            }
            let first = decode_dtc_message(DtcKind::Stored, &message).unwrap();

            let mut again = vec![0x43, first.len() as u8];
            for code in &first {
                again.extend_from_slice(&code.encode().to_be_bytes());
            }
            let second = decode_dtc_message(DtcKind::Stored, &again).unwrap();
            prop_assert_eq!(&first, &second);

            for code in &first {
                let parsed = TroubleCode::parse(&code.code, code.status).unwrap();
                prop_assert_eq!(&parsed, code);
            }
        }
    }
}
