//! # Simulator Configuration
//!
//! [`SimulatorConfig`] gathers every tunable of the simulator. All sections
//! have defaults, so a file only needs the keys it changes:
//!
//! ```yaml
//! tcp:
//!   port: 5020
//! simulation:
//!   reg_min: 10
//!   reg_max: 20
//! engine: tokio-modbus
//! ```
//!
//! Files ending in `.json` are parsed as JSON, anything else as YAML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{EngineKind, SerialSettings, TcpSettings, TransportKind};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::LoggingConfig;
use crate::register_store::DEFAULT_BLOCK_SIZE;

/// Start and size of every block a new slave receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    pub start: u16,
    pub size: u16,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            start: 0,
            size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Simulation interval and value ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub interval_secs: u64,
    pub bin_min: u16,
    pub bin_max: u16,
    pub reg_min: u16,
    pub reg_max: u16,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            bin_min: 0,
            bin_max: 1,
            reg_min: 0,
            reg_max: u16::MAX,
        }
    }
}

impl SimulationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// State file handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub load_state: bool,
    pub file: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            load_state: true,
            file: PathBuf::from("slaves.json"),
        }
    }
}

/// Complete simulator configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Transport selected at startup
    pub transport: TransportKind,
    pub engine: EngineKind,
    pub tcp: TcpSettings,
    pub serial: SerialSettings,
    pub block: BlockConfig,
    pub simulation: SimulationConfig,
    pub sync: SyncConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
}

impl SimulatorConfig {
    /// Load from a YAML or JSON file and validate
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_yaml(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> ModbusResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> ModbusResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| ModbusError::configuration(format!("JSON error: {}", e)))
    }

    pub fn to_yaml(&self) -> ModbusResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check every section for values the simulator cannot run with
    pub fn validate(&self) -> ModbusResult<()> {
        self.tcp.validate()?;
        self.serial.validate()?;

        if self.block.size == 0 {
            return Err(ModbusError::configuration("Block size must be positive"));
        }
        if self.block.start as u32 + self.block.size as u32 > u16::MAX as u32 + 1 {
            return Err(ModbusError::configuration(format!(
                "Block start {} with size {} runs past address 65535",
                self.block.start, self.block.size
            )));
        }

        let sim = &self.simulation;
        if sim.interval_secs == 0 || self.sync.interval_secs == 0 {
            return Err(ModbusError::configuration("Intervals must be positive"));
        }
        if sim.bin_min > sim.bin_max || sim.bin_max > 1 {
            return Err(ModbusError::configuration(format!(
                "Invalid bit range [{}, {}], expected a range within [0, 1]",
                sim.bin_min, sim.bin_max
            )));
        }
        if sim.reg_min > sim.reg_max {
            return Err(ModbusError::configuration(format!(
                "Invalid register range [{}, {}]",
                sim.reg_min, sim.reg_max
            )));
        }

        self.logging.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SimulatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.engine, EngineKind::Native);
        assert_eq!(config.tcp.ip, "127.0.0.1");
        assert_eq!(config.tcp.port, 5440);
        assert_eq!(config.serial.port, "/dev/ttyp0");
        assert_eq!(config.serial.baudrate, 9600);
        assert_eq!(config.block.size, 100);
        assert_eq!(config.simulation.interval(), Duration::from_secs(1));
        assert_eq!(config.sync.interval(), Duration::from_secs(5));
        assert_eq!(config.state.file, PathBuf::from("slaves.json"));
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = concat!(
            "tcp:\n  port: 5020\n",
            "simulation:\n  reg_min: 10\n  reg_max: 20\n",
            "engine: tokio-modbus\n",
            "serial:\n  parity: E\n  stopbits: 2\n",
        );
        let config = SimulatorConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tcp.port, 5020);
        assert_eq!(config.tcp.ip, "127.0.0.1");
        assert_eq!(config.simulation.reg_min, 10);
        assert_eq!(config.engine, EngineKind::TokioModbus);
        assert_eq!(config.serial.stopbits, 2.0);
    }

    #[test]
    fn test_validation_failures() {
        let check = |f: fn(&mut SimulatorConfig)| {
            let mut config = SimulatorConfig::default();
            f(&mut config);
            config.validate()
        };

        assert!(check(|c| c.block.size = 0).is_err());
        assert!(check(|c| {
            c.block.start = 65500;
            c.block.size = 100;
        })
        .is_err());
        assert!(check(|c| c.simulation.interval_secs = 0).is_err());
        assert!(check(|c| c.sync.interval_secs = 0).is_err());
        assert!(check(|c| c.simulation.bin_max = 2).is_err());
        assert!(check(|c| {
            c.simulation.reg_min = 30;
            c.simulation.reg_max = 20;
        })
        .is_err());
        assert!(check(|c| c.serial.bytesize = 9).is_err());
        assert!(check(|c| c.serial.parity = "M".to_string()).is_err());
        assert!(check(|c| c.serial.stopbits = 1.5).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"block": {{"size": 20}}, "transport": "rtu"}}"#).unwrap();
        let config = SimulatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.block.size, 20);
        assert_eq!(config.transport, TransportKind::Rtu);

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "sync:\n  interval_secs: 0\n").unwrap();
        assert!(matches!(
            SimulatorConfig::from_file(file.path()),
            Err(ModbusError::Configuration { .. })
        ));

        let yaml = SimulatorConfig::default().to_yaml().unwrap();
        assert_eq!(SimulatorConfig::from_yaml(&yaml).unwrap(), SimulatorConfig::default());
    }
}
