//! Built-in descriptions of common trouble codes.
//!
//! Match-based lookup; codes missing from the table get a generic
//! description derived from their category and scope.

use serde::{Deserialize, Serialize};

use crate::dtc::{DtcScope, TroubleCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcSeverity {
    /// Stop driving or have it checked immediately
    Critical,
    /// Schedule a repair
    Warning,
}

/// Description and severity of a trouble code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcDescription {
    pub description: String,
    pub severity: DtcSeverity,
    /// False when the description is the category fallback
    pub known: bool,
}

fn table(code: &str) -> Option<(&'static str, DtcSeverity)> {
    use DtcSeverity::*;
    let entry = match code {
        // Camshaft timing
        "P0011" => ("Intake Camshaft Position Timing - Over-Advanced (Bank 1)", Warning),
        "P0012" => ("Intake Camshaft Position Timing - Over-Retarded (Bank 1)", Warning),
        "P0013" => ("Exhaust Camshaft Position Actuator Circuit (Bank 1)", Warning),
        "P0014" => ("Exhaust Camshaft Position Timing - Over-Advanced (Bank 1)", Warning),
        "P0015" => ("Exhaust Camshaft Position Timing - Over-Retarded (Bank 1)", Warning),
        "P0021" => ("Intake Camshaft Position Timing - Over-Advanced (Bank 2)", Warning),
        "P0022" => ("Intake Camshaft Position Timing - Over-Retarded (Bank 2)", Warning),

        // Fuel and air metering
        "P0100" => ("Mass or Volume Air Flow Circuit Malfunction", Warning),
        "P0101" => ("Mass or Volume Air Flow Circuit Range/Performance", Warning),
        "P0102" => ("Mass or Volume Air Flow Circuit Low Input", Warning),
        "P0103" => ("Mass or Volume Air Flow Circuit High Input", Warning),
        "P0104" => ("Mass or Volume Air Flow Circuit Intermittent", Warning),
        "P0105" => ("Manifold Absolute Pressure/Barometric Pressure Circuit Malfunction", Warning),
        "P0106" => ("Manifold Absolute Pressure/Barometric Pressure Circuit Range/Performance", Warning),
        "P0107" => ("Manifold Absolute Pressure/Barometric Pressure Circuit Low Input", Warning),
        "P0108" => ("Manifold Absolute Pressure/Barometric Pressure Circuit High Input", Warning),
        "P0110" => ("Intake Air Temperature Circuit Malfunction", Warning),
        "P0111" => ("Intake Air Temperature Circuit Range/Performance", Warning),
        "P0112" => ("Intake Air Temperature Circuit Low Input", Warning),
        "P0113" => ("Intake Air Temperature Circuit High Input", Warning),
        "P0115" => ("Engine Coolant Temperature Circuit Malfunction", Warning),
        "P0116" => ("Engine Coolant Temperature Circuit Range/Performance", Warning),
        "P0117" => ("Engine Coolant Temperature Circuit Low Input", Warning),
        "P0118" => ("Engine Coolant Temperature Circuit High Input", Warning),
        "P0120" => ("Throttle Position Sensor/Switch A Circuit Malfunction", Warning),
        "P0121" => ("Throttle Position Sensor/Switch A Circuit Range/Performance", Warning),
        "P0122" => ("Throttle Position Sensor/Switch A Circuit Low Input", Warning),
        "P0123" => ("Throttle Position Sensor/Switch A Circuit High Input", Warning),
        "P0125" => ("Insufficient Coolant Temperature for Closed Loop Fuel Control", Warning),
        "P0128" => ("Coolant Thermostat (Coolant Temperature Below Thermostat Regulating Temperature)", Warning),
        "P0130" => ("O2 Sensor Circuit Malfunction (Bank 1 Sensor 1)", Warning),
        "P0131" => ("O2 Sensor Circuit Low Voltage (Bank 1 Sensor 1)", Warning),
        "P0132" => ("O2 Sensor Circuit High Voltage (Bank 1 Sensor 1)", Warning),
        "P0133" => ("O2 Sensor Circuit Slow Response (Bank 1 Sensor 1)", Warning),
        "P0134" => ("O2 Sensor Circuit No Activity Detected (Bank 1 Sensor 1)", Warning),
        "P0135" => ("O2 Sensor Heater Circuit Malfunction (Bank 1 Sensor 1)", Warning),
        "P0136" => ("O2 Sensor Circuit Malfunction (Bank 1 Sensor 2)", Warning),
        "P0137" => ("O2 Sensor Circuit Low Voltage (Bank 1 Sensor 2)", Warning),
        "P0138" => ("O2 Sensor Circuit High Voltage (Bank 1 Sensor 2)", Warning),
        "P0139" => ("O2 Sensor Circuit Slow Response (Bank 1 Sensor 2)", Warning),
        "P0140" => ("O2 Sensor Circuit No Activity Detected (Bank 1 Sensor 2)", Warning),
        "P0141" => ("O2 Sensor Heater Circuit Malfunction (Bank 1 Sensor 2)", Warning),
        "P0150" => ("O2 Sensor Circuit Malfunction (Bank 2 Sensor 1)", Warning),
        "P0151" => ("O2 Sensor Circuit Low Voltage (Bank 2 Sensor 1)", Warning),
        "P0152" => ("O2 Sensor Circuit High Voltage (Bank 2 Sensor 1)", Warning),
        "P0153" => ("O2 Sensor Circuit Slow Response (Bank 2 Sensor 1)", Warning),
        "P0154" => ("O2 Sensor Circuit No Activity Detected (Bank 2 Sensor 1)", Warning),
        "P0155" => ("O2 Sensor Heater Circuit Malfunction (Bank 2 Sensor 1)", Warning),
        "P0156" => ("O2 Sensor Circuit Malfunction (Bank 2 Sensor 2)", Warning),
        "P0157" => ("O2 Sensor Circuit Low Voltage (Bank 2 Sensor 2)", Warning),
        "P0158" => ("O2 Sensor Circuit High Voltage (Bank 2 Sensor 2)", Warning),
        "P0159" => ("O2 Sensor Circuit Slow Response (Bank 2 Sensor 2)", Warning),
        "P0160" => ("O2 Sensor Circuit No Activity Detected (Bank 2 Sensor 2)", Warning),
        "P0161" => ("O2 Sensor Heater Circuit Malfunction (Bank 2 Sensor 2)", Warning),
        "P0170" => ("Fuel Trim Malfunction (Bank 1)", Warning),
        "P0171" => ("System Too Lean (Bank 1)", Warning),
        "P0172" => ("System Too Rich (Bank 1)", Warning),
        "P0173" => ("Fuel Trim Malfunction (Bank 2)", Warning),
        "P0174" => ("System Too Lean (Bank 2)", Warning),
        "P0175" => ("System Too Rich (Bank 2)", Warning),

        // Turbo and boost
        "P0234" => ("Engine Overboost Condition", Critical),
        "P0235" => ("Turbocharger Boost Sensor A Circuit Malfunction", Warning),
        "P0236" => ("Turbocharger Boost Sensor A Circuit Range/Performance", Warning),
        "P0237" => ("Turbocharger Boost Sensor A Circuit Low", Warning),
        "P0238" => ("Turbocharger Boost Sensor A Circuit High", Warning),
        "P0243" => ("Turbocharger Wastegate Solenoid A Malfunction", Warning),
        "P0244" => ("Turbocharger Wastegate Solenoid A Range/Performance", Warning),
        "P0245" => ("Turbocharger Wastegate Solenoid A Low", Warning),
        "P0246" => ("Turbocharger Wastegate Solenoid A High", Warning),
        "P0299" => ("Turbocharger/Supercharger Underboost", Warning),

        // Ignition system or misfire
        "P0300" => ("Random/Multiple Cylinder Misfire Detected", Critical),
        "P0301" => ("Cylinder 1 Misfire Detected", Critical),
        "P0302" => ("Cylinder 2 Misfire Detected", Critical),
        "P0303" => ("Cylinder 3 Misfire Detected", Critical),
        "P0304" => ("Cylinder 4 Misfire Detected", Critical),
        "P0305" => ("Cylinder 5 Misfire Detected", Critical),
        "P0306" => ("Cylinder 6 Misfire Detected", Critical),
        "P0307" => ("Cylinder 7 Misfire Detected", Critical),
        "P0308" => ("Cylinder 8 Misfire Detected", Critical),
        "P0309" => ("Cylinder 9 Misfire Detected", Critical),
        "P0310" => ("Cylinder 10 Misfire Detected", Critical),
        "P0311" => ("Cylinder 11 Misfire Detected", Critical),
        "P0312" => ("Cylinder 12 Misfire Detected", Critical),
        "P0325" => ("Knock Sensor 1 Circuit Malfunction (Bank 1)", Warning),
        "P0326" => ("Knock Sensor 1 Circuit Range/Performance (Bank 1)", Warning),
        "P0327" => ("Knock Sensor 1 Circuit Low Input (Bank 1)", Warning),
        "P0328" => ("Knock Sensor 1 Circuit High Input (Bank 1)", Warning),
        "P0330" => ("Knock Sensor 2 Circuit Malfunction (Bank 2)", Warning),
        "P0335" => ("Crankshaft Position Sensor A Circuit Malfunction", Critical),
        "P0336" => ("Crankshaft Position Sensor A Circuit Range/Performance", Critical),
        "P0340" => ("Camshaft Position Sensor Circuit Malfunction (Bank 1)", Critical),
        "P0341" => ("Camshaft Position Sensor Circuit Range/Performance (Bank 1)", Warning),

        // Auxiliary emission controls
        "P0400" => ("Exhaust Gas Recirculation Flow Malfunction", Warning),
        "P0401" => ("Exhaust Gas Recirculation Flow Insufficient Detected", Warning),
        "P0402" => ("Exhaust Gas Recirculation Flow Excessive Detected", Warning),
        "P0410" => ("Secondary Air Injection System Malfunction", Warning),
        "P0411" => ("Secondary Air Injection System Incorrect Flow Detected", Warning),
        "P0420" => ("Catalyst System Efficiency Below Threshold (Bank 1)", Warning),
        "P0421" => ("Warm Up Catalyst Efficiency Below Threshold (Bank 1)", Warning),
        "P0430" => ("Catalyst System Efficiency Below Threshold (Bank 2)", Warning),
        "P0440" => ("Evaporative Emission Control System Malfunction", Warning),
        "P0441" => ("Evaporative Emission Control System Incorrect Purge Flow", Warning),
        "P0442" => ("Evaporative Emission Control System Leak Detected (small leak)", Warning),
        "P0443" => ("Evaporative Emission Control System Purge Control Valve Circuit Malfunction", Warning),
        "P0446" => ("Evaporative Emission Control System Vent Control Circuit Malfunction", Warning),
        "P0450" => ("Evaporative Emission Control System Pressure Sensor Malfunction", Warning),
        "P0455" => ("Evaporative Emission Control System Leak Detected (large leak)", Warning),
        "P0456" => ("Evaporative Emission Control System Leak Detected (very small leak)", Warning),

        // Vehicle speed and idle control
        "P0500" => ("Vehicle Speed Sensor Malfunction", Warning),
        "P0501" => ("Vehicle Speed Sensor Range/Performance", Warning),
        "P0505" => ("Idle Control System Malfunction", Warning),
        "P0506" => ("Idle Control System RPM Lower Than Expected", Warning),
        "P0507" => ("Idle Control System RPM Higher Than Expected", Warning),

        // Computer output circuit
        "P0600" => ("Serial Communication Link Malfunction", Critical),
        "P0601" => ("Internal Control Module Memory Check Sum Error", Critical),
        "P0602" => ("Control Module Programming Error", Critical),

        // Transmission
        "P0700" => ("Transmission Control System Malfunction", Critical),
        "P0705" => ("Transmission Range Sensor Circuit Malfunction", Warning),
        "P0710" => ("Transmission Fluid Temperature Sensor Circuit Malfunction", Warning),
        "P0715" => ("Input/Turbine Speed Sensor Circuit Malfunction", Warning),
        "P0720" => ("Output Speed Sensor Circuit Malfunction", Warning),
        "P0725" => ("Engine Speed Input Circuit Malfunction", Warning),
        "P0730" => ("Incorrect Gear Ratio", Warning),
        "P0740" => ("Torque Converter Clutch Circuit Malfunction", Warning),
        "P0741" => ("Torque Converter Clutch Circuit Performance or Stuck Off", Warning),
        "P0750" => ("Shift Solenoid A Malfunction", Warning),
        "P0755" => ("Shift Solenoid B Malfunction", Warning),
        "P0760" => ("Shift Solenoid C Malfunction", Warning),

        // Chassis
        "C0035" => ("Left Front Wheel Speed Sensor Circuit Malfunction", Warning),
        "C0040" => ("Right Front Wheel Speed Sensor Circuit Malfunction", Warning),
        "C0045" => ("Left Rear Wheel Speed Sensor Circuit Malfunction", Warning),
        "C0050" => ("Right Rear Wheel Speed Sensor Circuit Malfunction", Warning),

        // Body
        "B1000" => ("ECU Malfunction", Critical),
        "B1001" => ("Option Configuration Error", Warning),

        // Network
        "U0100" => ("Lost Communication with ECM/PCM", Critical),
        "U0101" => ("Lost Communication with TCM", Critical),
        "U0121" => ("Lost Communication with ABS", Critical),
        "U0140" => ("Lost Communication with Body Control Module", Warning),
        "U0155" => ("Lost Communication with Instrument Panel Cluster", Warning),

        _ => return None,
    };
    Some(entry)
}

/// Look up a code string (case-insensitive).
pub fn lookup(code: &str) -> Option<DtcDescription> {
    let code = code.trim().to_ascii_uppercase();
    table(&code).map(|(description, severity)| DtcDescription {
        description: description.to_string(),
        severity,
        known: true,
    })
}

/// Describe a decoded code, falling back to its category.
pub fn describe(code: &TroubleCode) -> DtcDescription {
    lookup(&code.code).unwrap_or_else(|| {
        let scope = match code.scope {
            DtcScope::Generic => "Generic OBD-II",
            DtcScope::Manufacturer => "Manufacturer Specific",
        };
        DtcDescription {
            description: format!("{} ({}) Code {}", code.category.name(), scope, code.code),
            severity: DtcSeverity::Warning,
            known: false,
        }
    })
}
