//! # Modbus Simu - Modbus TCP/RTU Slave Simulator
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! A Modbus slave simulator: it hosts any number of slave devices, serves
//! their coils, discrete inputs, holding registers and input registers to
//! real Modbus masters over TCP or RTU, and keeps the values moving with
//! periodic random simulation.
//!
//! ## Features
//!
//! - **Two protocol engines**: a native tokio implementation and one built on
//!   `tokio-modbus`, answering with the same bytes
//! - **Per-block locking**: simulation ticks, reconciliation and client
//!   handlers only contend on the block they touch
//! - **Client write reconciliation**: values written by masters flow back
//!   into the simulator's own view
//! - **State file**: slaves and tracked values survive restarts
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Block |
//! |------|----------|-------|
//! | 0x01 | Read Coils | Coil |
//! | 0x02 | Read Discrete Inputs | DiscreteInput |
//! | 0x03 | Read Holding Registers | HoldingRegister |
//! | 0x04 | Read Input Registers | InputRegister |
//! | 0x05 | Write Single Coil | Coil |
//! | 0x06 | Write Single Register | HoldingRegister |
//! | 0x0F | Write Multiple Coils | Coil |
//! | 0x10 | Write Multiple Registers | HoldingRegister |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_simu::{BlockKind, Simulator, SimulatorConfig, ValueGroup};
//!
//! #[tokio::main]
//! async fn main() -> modbus_simu::ModbusResult<()> {
//!     let config = SimulatorConfig::from_file("simulator.yaml")?;
//!     modbus_simu::init_logging(&config.logging)?;
//!
//!     let simulator = Simulator::new(config).await?;
//!     simulator.add_slaves(1, 3)?;
//!     simulator.add_entries(1, BlockKind::HoldingRegister, 10, 0)?;
//!     simulator.change_range(ValueGroup::Registers, Some(10), Some(20)).await?;
//!
//!     simulator.start_server().await?;
//!     simulator.start_stop_simulation(true).await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     simulator.save_state("slaves.json")?;
//!     simulator.shutdown().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  Simulator                   │
//! └──────────────────────────────────────────────┘
//!        │                 │                 │
//! ┌─────────────┐  ┌───────────────┐  ┌──────────────┐
//! │ Simulation  │  │ Reconciliation│  │  State file  │
//! │ Scheduler   │  │      Job      │  │              │
//! └─────────────┘  └───────────────┘  └──────────────┘
//!        │                 │
//! ┌──────────────────────────────────────────────┐
//! │       AddressSpace (TCP) / AddressSpace (RTU)│
//! │   shadow RegisterStore ◄── live RegisterStore│
//! └──────────────────────────────────────────────┘
//!                          │
//!               ┌─────────────────────┐
//!               │   ProtocolEngine    │
//!               │ native/tokio-modbus │
//!               └─────────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions
pub mod protocol;

/// Slave devices and their value blocks
pub mod register_store;

/// MBAP and RTU framing
pub mod codec;

/// Protocol engines serving a register store
pub mod engine;

/// Interval-driven background tasks
pub mod periodic;

/// Shadow and live stores of one transport
pub mod address_space;

/// Random value simulation
pub mod simulation;

/// Folding client writes back into the shadow store
pub mod reconcile;

/// Simulator facade
pub mod simulator;

/// JSON state file
pub mod state;

/// Configuration loading
pub mod config;

/// Logger setup
pub mod logging;

/// Utility functions
pub mod utils;

// Re-export main types for convenience
pub use address_space::AddressSpace;
pub use config::SimulatorConfig;
pub use engine::{
    create_engine, EngineKind, ProtocolEngine, SerialSettings, ServerStats, TcpSettings,
    TransportConfig, TransportKind,
};
pub use error::{ModbusError, ModbusResult};
pub use logging::{init_logging, LoggingConfig};
pub use protocol::{BlockKind, ModbusAddress, ModbusFunction, ModbusValue, SlaveId};
pub use reconcile::ReconciliationJob;
pub use register_store::{RegisterStore, RegisterStoreStats, ValueChange};
pub use simulation::{SimulationParams, SimulationScheduler, ValueGroup};
pub use simulator::Simulator;
pub use state::SimulationState;
pub use utils::OperationTimer;

/// Maximum number of coils that can be read/written in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read/written in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Simu v{} - Modbus TCP/RTU slave simulator", VERSION)
}
