//! Vehicle information (mode 09) text decoding.
//!
//! Long strings are split across frames. On CAN the adapter numbers them
//! `0:`, `1:`, ... and they arrive here already joined; legacy protocols
//! send one `49 <pid> <index> A B C D` line per segment, which is
//! reassembled here by its index.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::elm::AdapterResponse;
use crate::error::{ObdError, ObdResult};
use crate::protocol::ObdProtocol;

/// Mode 09 PID of the vehicle identification number
pub const VIN_PID: u8 = 0x02;
/// Mode 09 PID of the calibration ID
pub const CALIBRATION_ID_PID: u8 = 0x04;
/// Mode 09 PID of the ECU name
pub const ECU_NAME_PID: u8 = 0x0A;

const VIN_LEN: usize = 17;
const LEGACY_SEGMENT_LEN: usize = 7;

/// Identification captured once at session start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub vin: Option<String>,
    pub calibration_id: Option<String>,
    pub ecu_name: Option<String>,
    pub protocol: Option<ObdProtocol>,
    /// Adapter banner, e.g. `ELM327 v1.5`
    pub adapter_version: Option<String>,
}

/// Join the data bytes of a mode 09 answer, header bytes removed.
pub fn reassemble(response: &AdapterResponse) -> ObdResult<Vec<u8>> {
    match response.messages.as_slice() {
        [] => Err(ObdError::IncompleteData("no vehicle info frames".to_string())),
        // CAN: one joined message, `49 <pid> <item count> data...`
        [message] if message.len() > LEGACY_SEGMENT_LEN => Ok(message[3..].to_vec()),
        messages => {
            let mut segments = BTreeMap::new();
            for message in messages {
                if message.len() != LEGACY_SEGMENT_LEN {
                    return Err(ObdError::MalformedResponse(format!(
                        "vehicle info segment has {} bytes",
                        message.len()
                    )));
                }
                segments.entry(message[2]).or_insert_with(|| message[3..].to_vec());
            }

            let mut data = Vec::new();
            for (expected, (index, bytes)) in (1u8..).zip(segments) {
                if index != expected {
                    return Err(ObdError::IncompleteData(format!(
                        "vehicle info segment {} missing",
                        expected
                    )));
                }
                data.extend(bytes);
            }
            Ok(data)
        }
    }
}

/// Printable text with NUL padding removed.
fn text_of(data: &[u8]) -> ObdResult<String> {
    if let Some(bad) = data.iter().find(|b| **b != 0 && !(0x20..0x7F).contains(*b)) {
        return Err(ObdError::MalformedResponse(format!(
            "non-printable byte {:02X} in vehicle info",
            bad
        )));
    }
    Ok(data
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<String>()
        .trim()
        .to_string())
}

/// Decode the 17-character VIN.
pub fn decode_vin(response: &AdapterResponse) -> ObdResult<String> {
    let vin = text_of(&reassemble(response)?)?;
    if vin.len() < VIN_LEN {
        return Err(ObdError::IncompleteData(format!(
            "VIN has {} of {} characters",
            vin.len(),
            VIN_LEN
        )));
    }
    if vin.len() > VIN_LEN || !vin.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ObdError::MalformedResponse(format!("invalid VIN {:?}", vin)));
    }
    Ok(vin)
}

pub fn decode_calibration_id(response: &AdapterResponse) -> ObdResult<String> {
    text_of(&reassemble(response)?)
}

pub fn decode_ecu_name(response: &AdapterResponse) -> ObdResult<String> {
    text_of(&reassemble(response)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elm::{parse_response, AdapterRequest};

    const VIN: AdapterRequest = AdapterRequest::VehicleInfo { pid: VIN_PID };

    #[test]
    fn test_can_vin() {
        let raw = "014\r0: 49 02 01 31 44 34\r1: 47 50 30 30 52 35 35\r2: 42 31 32 33 34 35 36\r>";
        let response = parse_response(VIN, raw).unwrap();
        assert_eq!(decode_vin(&response).unwrap(), "1D4GP00R55B123456");
    }

    #[test]
    fn test_legacy_vin_out_of_order() {
        let raw = "49 02 02 44 34 47 50\r\
                   49 02 01 00 00 00 31\r\
                   49 02 03 30 30 52 35\r\
                   49 02 05 31 32 33 34\r\
                   49 02 04 35 42 35 36\r>";
        let response = parse_response(VIN, raw).unwrap();
        assert_eq!(decode_vin(&response).unwrap(), "1D4GP00R55B561234");
    }

    #[test]
    fn test_legacy_vin_missing_segment() {
        let raw = "49 02 01 00 00 00 31\r49 02 02 44 34 47 50\r49 02 04 35 42 35 36\r49 02 05 31 32 33 34\r>";
        let response = parse_response(VIN, raw).unwrap();
        assert!(matches!(decode_vin(&response), Err(ObdError::IncompleteData(_))));
    }

    #[test]
    fn test_legacy_vin_missing_last_segment() {
        let raw = "49 02 01 00 00 00 31\r49 02 02 44 34 47 50\r49 02 03 30 30 52 35\r49 02 04 35 42 35 36\r>";
        let response = parse_response(VIN, raw).unwrap();
        assert!(matches!(decode_vin(&response), Err(ObdError::IncompleteData(_))));
    }

    #[test]
    fn test_vin_with_garbage_is_malformed() {
        let raw = "49 02 01 00 00 00 31\r49 02 02 44 34 47 50\r49 02 03 30 30 52 35\r49 02 04 35 42 2D 36\r49 02 05 31 32 33 34\r>";
        let response = parse_response(VIN, raw).unwrap();
        assert!(matches!(decode_vin(&response), Err(ObdError::MalformedResponse(_))));
    }

    #[test]
    fn test_ecu_name_and_calibration() {
        let raw = "017\r0: 49 0A 01 45 43 4D\r1: 00 2D 45 6E 67 69 6E\r2: 65 43 6F 6E 74 72 6F\r3: 6C 00 00\r>";
        let response =
            parse_response(AdapterRequest::VehicleInfo { pid: ECU_NAME_PID }, raw).unwrap();
        assert_eq!(decode_ecu_name(&response).unwrap(), "ECM-EngineControl");

        let raw = "013\r0: 49 04 01 53 57 2D\r1: 45 43 4D 2D 30 30 34\r2: 32 00 00 00 00 00\r>";
        let response =
            parse_response(AdapterRequest::VehicleInfo { pid: CALIBRATION_ID_PID }, raw).unwrap();
        assert_eq!(decode_calibration_id(&response).unwrap(), "SW-ECM-0042");
    }
}
