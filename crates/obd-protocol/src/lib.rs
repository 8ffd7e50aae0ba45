//! OBD-II Protocol Engine
//!
//! This crate turns a half-duplex serial channel to an ELM327-compatible
//! adapter into typed vehicle data: a byte transport, the adapter's text
//! command dialect, the adapter session state machine, the generic PID
//! registry and the decoders for samples, trouble codes and vehicle info.

pub mod decode;
pub mod dtc;
pub mod dtc_db;
pub mod elm;
mod error;
pub mod mock;
pub mod pid;
mod protocol;
pub mod session;
pub mod supported;
pub mod transport;
pub mod vin;

pub use decode::{decode_freeze_frame, decode_freeze_frame_dtc, decode_sample, Sample};
pub use dtc::{DtcCategory, DtcKind, DtcScope, DtcStatus, TroubleCode};
pub use elm::{AdapterCommand, AdapterRequest, AdapterResponse};
pub use error::{ObdError, ObdResult};
pub use mock::{MockReply, MockTransport};
pub use pid::{lookup, lookup_name, Formula, ParameterDefinition, ParameterId, REGISTRY_VERSION};
pub use protocol::ObdProtocol;
pub use session::{AdapterConfig, AdapterSession, ConnectionState};
pub use supported::{supported_identifiers, SupportedPids};
pub use transport::{list_ports, PortInfo, SerialTransport, Transport};
pub use vin::VehicleSnapshot;

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Stored diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
}
