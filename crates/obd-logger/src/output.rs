//! Human-readable lines and session output.

use obd_protocol::dtc_db::describe;
use obd_protocol::{PortInfo, Sample, TroubleCode};
use session_recorder::{export_session, to_json, Session};
use std::io::Write;

use crate::config::OutputFormat;

/// `RPM                         1726.00 rpm`, flagged when stale or clamped
pub fn sample_line(sample: &Sample) -> String {
    let mut line = format!("{:<26} {:>10.2} {}", sample.name, sample.value, sample.unit);
    if sample.stale {
        line.push_str(" (stale)");
    }
    if sample.clamped {
        line.push_str(" (clamped)");
    }
    line
}

/// `P0133 [Warning] O2 Sensor Circuit Slow Response (Bank 1 Sensor 1)`
pub fn dtc_line(code: &TroubleCode) -> String {
    let description = describe(code);
    format!(
        "{} [{:?}] {}",
        code.code, description.severity, description.description
    )
}

pub fn port_line(port: &PortInfo) -> String {
    let mut line = port.name.clone();
    if let Some(product) = &port.product {
        line.push_str(&format!(" ({})", product));
    }
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        line.push_str(&format!(" [{:04x}:{:04x}]", vid, pid));
    }
    line
}

/// Write a finished session in the chosen format
pub fn write_session(
    session: &Session,
    format: OutputFormat,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Rows => {
            for row in export_session(session) {
                writeln!(out, "{}", serde_json::to_string(&row)?)?;
            }
        }
        OutputFormat::Document => writeln!(out, "{}", to_json(session)?)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{DtcStatus, ParameterId, VehicleSnapshot};
    use session_recorder::{ExportRow, SessionRecorder};

    fn rpm(value: f64, timestamp_ms: u64) -> Sample {
        Sample {
            id: ParameterId::current(0x0C),
            name: "RPM".to_string(),
            value,
            unit: "rpm".to_string(),
            timestamp_ms,
            stale: false,
            clamped: false,
        }
    }

    #[test]
    fn test_sample_line() {
        let line = sample_line(&rpm(1726.0, 0));
        assert!(line.starts_with("RPM "));
        assert!(line.ends_with("1726.00 rpm"));

        let mut stale = rpm(800.0, 0);
        stale.stale = true;
        assert!(sample_line(&stale).ends_with("(stale)"));
    }

    #[test]
    fn test_dtc_line() {
        let code = TroubleCode::parse("P0133", DtcStatus::Confirmed).unwrap();
        assert_eq!(
            dtc_line(&code),
            "P0133 [Warning] O2 Sensor Circuit Slow Response (Bank 1 Sensor 1)"
        );
    }

    #[test]
    fn test_port_line() {
        let port = PortInfo {
            name: "/dev/ttyUSB0".to_string(),
            vid: Some(0x0403),
            pid: Some(0x6001),
            product: Some("FT232R USB UART".to_string()),
        };
        assert_eq!(port_line(&port), "/dev/ttyUSB0 (FT232R USB UART) [0403:6001]");
    }

    #[test]
    fn test_write_rows() {
        let mut recorder = SessionRecorder::new(VehicleSnapshot::default());
        recorder.append_sample(rpm(1726.0, 20));
        recorder.append_sample(rpm(1700.0, 10));
        let session = recorder.finalize();

        let mut out = Vec::new();
        write_session(&session, OutputFormat::Rows, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let rows: Vec<ExportRow> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp_ms, 10);
        assert_eq!(rows[1].value, 1726.0);
    }

    #[test]
    fn test_write_document() {
        let session = SessionRecorder::new(VehicleSnapshot::default()).finalize();
        let mut out = Vec::new();
        write_session(&session, OutputFormat::Document, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["session_id"], session.id().to_string());
    }
}
