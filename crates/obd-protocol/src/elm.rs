//! ELM327 command dialect.
//!
//! The adapter speaks a line-oriented text protocol: a command terminated by
//! `\r`, answered by zero or more lines and finally the `>` prompt. Requests
//! are a closed set of typed variants, and every reply is parsed strictly
//! against the shape its request expects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::dtc::DtcKind;
use crate::error::{ObdError, ObdResult};
use crate::protocol::ObdProtocol;

/// Prompt byte that terminates every adapter reply
pub const PROMPT: u8 = b'>';

/// Offset added to request mode to get the response service byte
pub const RESPONSE_SID_OFFSET: u8 = 0x40;

/// Service byte of a negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Adapter-level (AT) commands used during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterCommand {
    /// `ATZ` full reset, answers with the version banner
    Reset,
    /// `ATE0` echo off
    EchoOff,
    /// `ATSPn` select bus protocol (`0` = automatic search)
    SetProtocol(ObdProtocol),
    /// `ATDPN` describe the active protocol by number
    DescribeProtocolNumber,
    /// `ATI` identify adapter version
    Identify,
}

impl AdapterCommand {
    /// Command text without terminator
    pub fn to_command(&self) -> String {
        match self {
            AdapterCommand::Reset => "ATZ".to_string(),
            AdapterCommand::EchoOff => "ATE0".to_string(),
            AdapterCommand::SetProtocol(protocol) => protocol.to_elm_command(),
            AdapterCommand::DescribeProtocolNumber => "ATDPN".to_string(),
            AdapterCommand::Identify => "ATI".to_string(),
        }
    }

    /// Parse the adapter's reply to this command.
    ///
    /// Returns the meaningful text (banner, protocol number) or `"OK"`.
    pub fn parse_reply(&self, raw: &str) -> ObdResult<String> {
        let command = self.to_command();
        let lines = clean_lines(raw, &command)?;
        match self {
            AdapterCommand::Reset | AdapterCommand::Identify => lines
                .into_iter()
                .find(|l| l.to_ascii_uppercase().contains("ELM"))
                .ok_or_else(|| {
                    ObdError::Protocol(format!("{} reply has no version banner", command))
                }),
            AdapterCommand::EchoOff | AdapterCommand::SetProtocol(_) => {
                if lines.iter().any(|l| l == "OK") {
                    Ok("OK".to_string())
                } else {
                    Err(ObdError::Protocol(format!(
                        "expected OK to {}, got {:?}",
                        command, lines
                    )))
                }
            }
            AdapterCommand::DescribeProtocolNumber => match lines.as_slice() {
                [line] if ObdProtocol::from_describe_reply(line).is_some() => Ok(line.clone()),
                _ => Err(ObdError::Protocol(format!(
                    "unexpected {} reply {:?}",
                    command, lines
                ))),
            },
        }
    }
}

/// An OBD-II request routed through the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterRequest {
    /// Mode 01 current data
    CurrentData { pid: u8 },
    /// Mode 02 freeze frame data
    FreezeFrame { pid: u8, frame: u8 },
    /// Mode 03 / 07 / 0A trouble codes
    ReadDtcs(DtcKind),
    /// Mode 04 clear trouble codes and freeze frames
    ClearDtcs,
    /// Mode 09 vehicle information
    VehicleInfo { pid: u8 },
}

impl AdapterRequest {
    /// OBD-II service (mode) byte
    pub fn mode(&self) -> u8 {
        match self {
            AdapterRequest::CurrentData { .. } => crate::mode::CURRENT_DATA,
            AdapterRequest::FreezeFrame { .. } => crate::mode::FREEZE_FRAME,
            AdapterRequest::ReadDtcs(kind) => kind.mode(),
            AdapterRequest::ClearDtcs => crate::mode::CLEAR_DTC,
            AdapterRequest::VehicleInfo { .. } => crate::mode::VEHICLE_INFO,
        }
    }

    /// PID byte, if the request carries one
    pub fn pid(&self) -> Option<u8> {
        match self {
            AdapterRequest::CurrentData { pid }
            | AdapterRequest::FreezeFrame { pid, .. }
            | AdapterRequest::VehicleInfo { pid } => Some(*pid),
            AdapterRequest::ReadDtcs(_) | AdapterRequest::ClearDtcs => None,
        }
    }

    /// Hex command text without terminator, e.g. `010C`
    pub fn to_command(&self) -> String {
        match self {
            AdapterRequest::FreezeFrame { pid, frame } => {
                format!("{:02X}{:02X}{:02X}", self.mode(), pid, frame)
            }
            _ => match self.pid() {
                Some(pid) => format!("{:02X}{:02X}", self.mode(), pid),
                None => format!("{:02X}", self.mode()),
            },
        }
    }

    /// Service byte a positive response starts with
    pub fn response_service(&self) -> u8 {
        self.mode() + RESPONSE_SID_OFFSET
    }
}

impl fmt::Display for AdapterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_command())
    }
}

/// Positive reply to an [`AdapterRequest`]: one byte message per responding
/// frame, with multi-frame CAN replies already joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterResponse {
    pub request: AdapterRequest,
    pub messages: Vec<Vec<u8>>,
}

impl AdapterResponse {
    /// Data bytes of the first message after the service and PID echo
    pub fn first_payload(&self) -> Option<&[u8]> {
        let skip = if self.request.pid().is_some() { 2 } else { 1 };
        self.messages.first().and_then(|m| m.get(skip..))
    }
}

/// One line of a reply as the adapter printed it
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplyLine {
    /// Hex bytes of a single frame
    Data(Vec<u8>),
    /// CAN multi-frame total byte count (`014`)
    ByteCount(usize),
    /// CAN multi-frame segment (`0: 49 02 01 ...`)
    Segment { index: u8, bytes: Vec<u8> },
}

/// Split the raw reply into meaningful lines, dropping the echo, the prompt
/// and status chatter, and mapping adapter error tokens to errors.
fn clean_lines(raw: &str, command: &str) -> ObdResult<Vec<String>> {
    let normalized_command = command.replace(' ', "").to_ascii_uppercase();
    let mut lines = Vec::new();

    for line in raw.split(['\r', '\n']) {
        let line = line.trim_matches(|c: char| c.is_whitespace() || c == '\0' || c == '>');
        if line.is_empty() {
            continue;
        }
        let upper = line.to_ascii_uppercase();
        if upper.replace(' ', "") == normalized_command {
            continue;
        }
        if upper.starts_with("SEARCHING") || upper == "BUS INIT: ...OK" || upper == "BUS INIT: OK" {
            continue;
        }
        if upper == "NO DATA" {
            return Err(ObdError::NoData(command.to_string()));
        }
        if upper == "?" {
            return Err(ObdError::Protocol(format!(
                "adapter rejected command {}",
                command
            )));
        }
        const FAILURES: [&str; 9] = [
            "UNABLE TO CONNECT",
            "BUS INIT",
            "CAN ERROR",
            "BUS ERROR",
            "BUS BUSY",
            "STOPPED",
            "BUFFER FULL",
            "FB ERROR",
            "DATA ERROR",
        ];
        if let Some(token) = FAILURES.iter().find(|t| upper.starts_with(*t)) {
            return Err(ObdError::Protocol(format!(
                "adapter reported {} for {}",
                token, command
            )));
        }
        lines.push(upper);
    }
    Ok(lines)
}

fn parse_hex_bytes(text: &str) -> Option<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}

fn parse_line(line: &str) -> Option<ReplyLine> {
    if line.len() == 3 && line.chars().all(|c| c.is_ascii_hexdigit()) {
        return usize::from_str_radix(line, 16).ok().map(ReplyLine::ByteCount);
    }
    if let Some((index, rest)) = line.split_once(':') {
        let index = index.trim();
        if index.len() == 1 {
            let index = u8::from_str_radix(index, 16).ok()?;
            let bytes = parse_hex_bytes(rest)?;
            return Some(ReplyLine::Segment { index, bytes });
        }
        return None;
    }
    parse_hex_bytes(line).map(ReplyLine::Data)
}

/// Join CAN multi-frame segments by their embedded index.
///
/// Indices wrap after `F`, so a running sequence number is rebuilt from the
/// order in which wraps happen.
fn join_segments(segments: Vec<(u8, Vec<u8>)>, byte_count: Option<usize>) -> ObdResult<Vec<u8>> {
    let mut ordered: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    let mut wraps = 0usize;
    let mut last: Option<u8> = None;
    for (index, bytes) in segments {
        if let Some(prev) = last {
            if index <= prev {
                wraps += 1;
            }
        }
        last = Some(index);
        let sequence = wraps * 16 + index as usize;
        if ordered.insert(sequence, bytes).is_some() {
            return Err(ObdError::MalformedResponse(format!(
                "duplicate segment {}",
                sequence
            )));
        }
    }

    let mut joined = Vec::new();
    for (expected, (sequence, bytes)) in ordered.into_iter().enumerate() {
        if sequence != expected {
            return Err(ObdError::IncompleteData(format!(
                "segment {} missing",
                expected
            )));
        }
        joined.extend_from_slice(&bytes);
    }

    if let Some(total) = byte_count {
        if joined.len() < total {
            return Err(ObdError::IncompleteData(format!(
                "expected {} bytes, got {}",
                total,
                joined.len()
            )));
        }
        joined.truncate(total);
    }
    Ok(joined)
}

/// Parse the raw text reply to an OBD request.
pub fn parse_response(request: AdapterRequest, raw: &str) -> ObdResult<AdapterResponse> {
    let command = request.to_command();
    let lines = clean_lines(raw, &command)?;
    if lines.is_empty() {
        return Err(ObdError::Protocol(format!("empty reply to {}", command)));
    }

    let mut messages = Vec::new();
    let mut segments = Vec::new();
    let mut byte_count = None;
    for line in &lines {
        match parse_line(line) {
            Some(ReplyLine::Data(bytes)) => messages.push(bytes),
            Some(ReplyLine::ByteCount(count)) => byte_count = Some(count),
            Some(ReplyLine::Segment { index, bytes }) => segments.push((index, bytes)),
            None => {
                return Err(ObdError::Protocol(format!(
                    "unexpected line {:?} in reply to {}",
                    line, command
                )))
            }
        }
    }
    if !segments.is_empty() {
        messages.push(join_segments(segments, byte_count)?);
    } else if byte_count.is_some() {
        return Err(ObdError::IncompleteData(format!(
            "byte count without segments in reply to {}",
            command
        )));
    }

    // A negative answer only fails the request when no ECU answered positively
    let is_negative = |m: &Vec<u8>| m.first() == Some(&NEGATIVE_RESPONSE_SID);
    if messages.iter().all(is_negative) {
        let negative = &messages[0];
        return Err(ObdError::NegativeResponse {
            service: negative.get(1).copied().unwrap_or(request.mode()),
            code: negative.get(2).copied().unwrap_or(0),
        });
    }
    messages.retain(|m| m.first() != Some(&NEGATIVE_RESPONSE_SID));

    let service = request.response_service();
    for message in &messages {
        if message.first() != Some(&service) {
            return Err(ObdError::Protocol(format!(
                "expected service {:02X} in reply to {}, got {:02X?}",
                service, command, message
            )));
        }
        if let Some(pid) = request.pid() {
            if message.get(1) != Some(&pid) {
                return Err(ObdError::Protocol(format!(
                    "reply to {} echoes wrong PID: {:02X?}",
                    command, message
                )));
            }
        }
    }

    Ok(AdapterResponse { request, messages })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RPM: AdapterRequest = AdapterRequest::CurrentData { pid: 0x0C };

    #[test]
    fn test_request_commands() {
        assert_eq!(RPM.to_command(), "010C");
        assert_eq!(AdapterRequest::ReadDtcs(DtcKind::Stored).to_command(), "03");
        assert_eq!(AdapterRequest::ReadDtcs(DtcKind::Pending).to_command(), "07");
        assert_eq!(AdapterRequest::ReadDtcs(DtcKind::Permanent).to_command(), "0A");
        assert_eq!(AdapterRequest::ClearDtcs.to_command(), "04");
        assert_eq!(AdapterRequest::VehicleInfo { pid: 0x02 }.to_command(), "0902");
        assert_eq!(
            AdapterRequest::FreezeFrame { pid: 0x0C, frame: 0 }.to_command(),
            "020C00"
        );
    }

    #[test]
    fn test_parse_single_frame() {
        let response = parse_response(RPM, "41 0C 1A F8\r\r>").unwrap();
        assert_eq!(response.messages, vec![vec![0x41, 0x0C, 0x1A, 0xF8]]);
        assert_eq!(response.first_payload(), Some(&[0x1A, 0xF8][..]));
    }

    #[test]
    fn test_parse_without_spaces_and_with_echo() {
        let response = parse_response(RPM, "010C\r410C1AF8\r\r>").unwrap();
        assert_eq!(response.messages, vec![vec![0x41, 0x0C, 0x1A, 0xF8]]);
    }

    #[test]
    fn test_parse_drops_searching() {
        let response = parse_response(RPM, "SEARCHING...\r41 0C 0B B8\r\r>").unwrap();
        assert_eq!(response.messages.len(), 1);
    }

    #[test]
    fn test_no_data() {
        let err = parse_response(RPM, "NO DATA\r\r>").unwrap_err();
        assert_eq!(err, ObdError::NoData("010C".to_string()));
    }

    #[test]
    fn test_adapter_error_tokens() {
        for raw in ["?\r>", "UNABLE TO CONNECT\r>", "CAN ERROR\r>", "BUS INIT: ...ERROR\r>"] {
            let err = parse_response(RPM, raw).unwrap_err();
            assert!(matches!(err, ObdError::Protocol(_)), "{raw}: {err:?}");
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = parse_response(RPM, "41 0C ZZ\r>").unwrap_err();
        assert!(matches!(err, ObdError::Protocol(_)));
        let err = parse_response(RPM, "41 0C 1\r>").unwrap_err();
        assert!(matches!(err, ObdError::Protocol(_)));
    }

    #[test]
    fn test_wrong_service_or_pid() {
        let err = parse_response(RPM, "41 0D 20\r>").unwrap_err();
        assert!(matches!(err, ObdError::Protocol(_)));
        let err = parse_response(RPM, "42 0C 1A F8\r>").unwrap_err();
        assert!(matches!(err, ObdError::Protocol(_)));
    }

    #[test]
    fn test_negative_response() {
        let err = parse_response(AdapterRequest::ClearDtcs, "7F 04 22\r>").unwrap_err();
        assert_eq!(err, ObdError::NegativeResponse { service: 0x04, code: 0x22 });
    }

    #[test]
    fn test_can_multi_frame_vin() {
        let raw = "014\r0: 49 02 01 31 44 34\r1: 47 50 30 30 52 35 35\r2: 42 31 32 33 34 35 36\r\r>";
        let response = parse_response(AdapterRequest::VehicleInfo { pid: 0x02 }, raw).unwrap();
        assert_eq!(response.messages.len(), 1);
        let message = &response.messages[0];
        assert_eq!(message.len(), 20);
        assert_eq!(&message[..3], &[0x49, 0x02, 0x01]);
        assert_eq!(&message[3..], b"1D4GP00R55B123456");
    }

    #[test]
    fn test_can_segment_index_going_backwards_reads_as_gap() {
        let raw = "014\r1: 47 50 30 30 52 35 35\r0: 49 02 01 31 44 34\r2: 42 31 32 33 34 35 36\r>";
        // 1 then 0 reads as a wrap, so the second segment lands after the first
        let err = parse_response(AdapterRequest::VehicleInfo { pid: 0x02 }, raw).unwrap_err();
        assert!(matches!(err, ObdError::IncompleteData(_)));
    }

    #[test]
    fn test_can_missing_segment() {
        let raw = "014\r0: 49 02 01 31 44 34\r2: 42 31 32 33 34 35 36\r>";
        let err = parse_response(AdapterRequest::VehicleInfo { pid: 0x02 }, raw).unwrap_err();
        assert!(matches!(err, ObdError::IncompleteData(_)));
    }

    #[test]
    fn test_multiple_ecus() {
        let raw = "41 00 BE 3F A8 13\r41 00 98 18 80 11\r>";
        let response = parse_response(AdapterRequest::CurrentData { pid: 0x00 }, raw).unwrap();
        assert_eq!(response.messages.len(), 2);
    }

    #[test]
    fn test_at_command_replies() {
        assert_eq!(
            AdapterCommand::Reset
                .parse_reply("ATZ\r\r\rELM327 v1.5\r\r>")
                .unwrap(),
            "ELM327 V1.5"
        );
        assert_eq!(AdapterCommand::EchoOff.parse_reply("ATE0\rOK\r\r>").unwrap(), "OK");
        assert_eq!(
            AdapterCommand::SetProtocol(ObdProtocol::Auto)
                .parse_reply("OK\r\r>")
                .unwrap(),
            "OK"
        );
        assert_eq!(
            AdapterCommand::DescribeProtocolNumber
                .parse_reply("A6\r\r>")
                .unwrap(),
            "A6"
        );
        assert!(AdapterCommand::EchoOff.parse_reply("?\r>").is_err());
        assert!(AdapterCommand::Reset.parse_reply("OK\r>").is_err());
    }
}
