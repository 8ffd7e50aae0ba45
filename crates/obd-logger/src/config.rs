//! Logger configuration, loadable from TOML and `OBD_LOGGER__*` environment
//! variables.

use config::{Config, Environment, File, FileFormat};
use obd_protocol::transport::DEFAULT_BAUD_RATE;
use obd_scheduler::{EngineConfig, VehicleConfig};
use serde::{Deserialize, Serialize};

/// Config file read when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "obd-logger.toml";

/// Port name that selects the simulated vehicle instead of a serial device
pub const MOCK_PORT: &str = "mock";

/// How the finished session is written out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// One JSON object per sample row
    #[default]
    Rows,
    /// A single JSON document with rows, events and vehicle identification
    Document,
}

/// Top-level configuration for the logger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Serial device, or `mock`
    pub port: String,
    pub baud_rate: u32,
    /// Stop after this many seconds. None runs until interrupted.
    pub duration_secs: Option<u64>,
    /// How often the live values are logged
    pub display_interval_ms: u64,
    /// Read stored trouble codes right after connecting
    pub read_dtcs: bool,
    pub output: OutputFormat,
    /// Write the session here instead of stdout
    pub output_path: Option<String>,
    /// Serve Prometheus metrics on this address, e.g. `0.0.0.0:9184`
    pub metrics_addr: Option<String>,
    /// Emit logs as JSON lines
    pub log_json: bool,
    pub engine: EngineConfig,
    pub vehicle: VehicleConfig,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            duration_secs: None,
            display_interval_ms: 1000,
            read_dtcs: true,
            output: OutputFormat::Rows,
            output_path: None,
            metrics_addr: None,
            log_json: false,
            engine: EngineConfig::default(),
            vehicle: VehicleConfig::default(),
        }
    }
}

impl LoggerConfig {
    /// Load from `path` (optional) overlaid with `OBD_LOGGER__*` variables,
    /// e.g. `OBD_LOGGER__PORT=mock` or `OBD_LOGGER__ENGINE__QUEUE_CAPACITY=8`.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("OBD_LOGGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse TOML text without consulting the environment
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
