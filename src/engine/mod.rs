/// Protocol engines
///
/// A protocol engine exposes a live [`RegisterStore`] to Modbus clients
/// over one transport. Two interchangeable backends implement the same
/// [`ProtocolEngine`] contract:
///
/// - [`NativeEngine`]: MBAP and RTU framing handled in this crate, running
///   on the caller's tokio runtime.
/// - [`TokioModbusEngine`]: the `tokio-modbus` server on a dedicated
///   runtime.
///
/// The backend and transport are fixed when the engine is built. The store
/// is shared, so an engine can be replaced without losing data.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{BlockKind, ModbusAddress, ModbusValue, SlaveId};
use crate::register_store::{RegisterStore, RegisterStoreStats};

pub mod handler;
pub mod native;
pub mod serial;
pub mod tokio_backend;

pub use native::NativeEngine;
pub use serial::SerialSettings;
pub use tokio_backend::TokioModbusEngine;

/// Default Modbus TCP port of the simulator
pub const DEFAULT_TCP_PORT: u16 = 5440;

/// Engine statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
    pub register_store_stats: Option<RegisterStoreStats>,
}

/// Transport kind of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Rtu,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Rtu => "rtu",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "rtu" => Ok(TransportKind::Rtu),
            other => Err(ModbusError::configuration(format!("Unknown transport: {}", other))),
        }
    }
}

/// Backend implementation of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineKind {
    #[default]
    #[serde(rename = "native")]
    Native,
    #[serde(rename = "tokio-modbus")]
    TokioModbus,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Native => f.write_str("native"),
            EngineKind::TokioModbus => f.write_str("tokio-modbus"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(EngineKind::Native),
            "tokio-modbus" | "tokio_modbus" => Ok(EngineKind::TokioModbus),
            other => Err(ModbusError::configuration(format!("Unknown engine: {}", other))),
        }
    }
}

/// Modbus TCP listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    pub ip: String,
    pub port: u16,
    /// Idle clients are disconnected after this long
    pub request_timeout_ms: u64,
    pub max_connections: usize,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
            request_timeout_ms: 30_000,
            max_connections: 100,
        }
    }
}

impl TcpSettings {
    /// `ip:port` string handed to the listener
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.ip.is_empty() {
            return Err(ModbusError::configuration("TCP ip is empty"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ModbusError::configuration("TCP request timeout must be positive"));
        }
        if self.max_connections == 0 {
            return Err(ModbusError::configuration("max_connections must be positive"));
        }
        Ok(())
    }
}

/// Transport an engine serves on
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Tcp(TcpSettings),
    Rtu(SerialSettings),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Tcp(_) => TransportKind::Tcp,
            TransportConfig::Rtu(_) => TransportKind::Rtu,
        }
    }

    /// Human-readable endpoint: `ip:port` or the serial device
    pub fn describe(&self) -> String {
        match self {
            TransportConfig::Tcp(settings) => settings.endpoint(),
            TransportConfig::Rtu(settings) => settings.port.clone(),
        }
    }
}

/// Contract shared by every protocol backend
///
/// `start` acquires the transport and returns once the engine is serving;
/// acquisition failures come back as `Bind` or `Serial` and leave the
/// engine stopped. `stop` is idempotent and returns only after every task
/// the engine spawned has finished.
///
/// The data operations act on the live store and are valid whether or not
/// the engine is running.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Start serving
    async fn start(&self) -> ModbusResult<()>;

    /// Stop serving and release the transport
    async fn stop(&self) -> ModbusResult<()>;

    /// Check if the engine is serving
    fn is_running(&self) -> bool;

    fn engine_kind(&self) -> EngineKind;

    fn transport(&self) -> &TransportConfig;

    /// Store served to clients
    fn store(&self) -> &Arc<RegisterStore>;

    /// Bound TCP address while running
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Get engine statistics
    fn get_stats(&self) -> ServerStats;

    fn add_slave(&self, slave_id: SlaveId) -> ModbusResult<()> {
        self.store().add_slave(slave_id)
    }

    fn remove_slave(&self, slave_id: SlaveId) -> ModbusResult<()> {
        self.store().remove_slave(slave_id)
    }

    fn add_block(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        start: ModbusAddress,
        size: u16,
    ) -> ModbusResult<()> {
        self.store().add_block(slave_id, kind, start, size)
    }

    fn remove_block(&self, slave_id: SlaveId, kind: BlockKind) -> ModbusResult<()> {
        self.store().remove_block(slave_id, kind)
    }

    /// Write consecutive values starting at a block offset
    fn set_values(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        offset: ModbusAddress,
        values: &[ModbusValue],
    ) -> ModbusResult<()> {
        self.store().write_range(slave_id, kind, offset, values)
    }

    /// Read `count` values; `OutOfRange` if `offset + count > size`
    fn get_values(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        offset: ModbusAddress,
        count: u16,
    ) -> ModbusResult<Vec<ModbusValue>> {
        self.store().read_range(slave_id, kind, offset, count)
    }
}

/// Build an engine of the given backend over a shared store
pub fn create_engine(
    kind: EngineKind,
    transport: TransportConfig,
    store: Arc<RegisterStore>,
) -> Box<dyn ProtocolEngine> {
    match kind {
        EngineKind::Native => Box::new(NativeEngine::new(transport, store)),
        EngineKind::TokioModbus => Box::new(TokioModbusEngine::new(transport, store)),
    }
}
