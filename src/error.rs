//! # Simulator Error Handling
//!
//! Every fallible operation of the simulator returns [`ModbusResult`], whose
//! error type [`ModbusError`] covers the data model (slave and block
//! bookkeeping), transport acquisition, wire protocol handling and state
//! restoration.
//!
//! ## Error Categories
//!
//! ### Data Model Errors
//! - **InvalidAddress**: slave id outside 1-247, or a slave range running past 247
//! - **DuplicateSlave / DuplicateBlock**: the slave or block already exists
//! - **NotFound**: missing slave, block or populated address
//! - **OutOfRange**: an offset at or beyond the block size
//!
//! ### Transport Errors
//! - **Bind**: the TCP listener could not be acquired
//! - **Serial**: the serial device is absent, busy or not permitted
//! - **Timeout**: an I/O call exceeded its bound
//! - **Io**: any other I/O failure
//!
//! ### Protocol Errors
//! - **Protocol / Frame / CrcMismatch / InvalidFunction / Exception**
//!
//! ### System Errors
//! - **Restore**: malformed or incomplete state snapshot
//! - **Configuration / InvalidData / Internal**
//!
//! ## Example
//!
//! ```rust
//! use modbus_simu::{BlockKind, ModbusError, RegisterStore};
//!
//! let store = RegisterStore::new();
//! store.add_slave(10).unwrap();
//! store.add_block(10, BlockKind::HoldingRegister, 0, 5).unwrap();
//!
//! match store.set_value(10, BlockKind::HoldingRegister, 5, 1) {
//!     Err(ModbusError::OutOfRange { size, .. }) => assert_eq!(size, 5),
//!     other => panic!("unexpected result: {:?}", other),
//! }
//! ```

use thiserror::Error;

use crate::protocol::BlockKind;

/// Result type alias for simulator operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Simulator error types
///
/// Variants carry enough context to be shown to a user as-is; the
/// surrounding application decides whether to retry, report or ignore.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// Slave id outside 1-247, or a slave range that would run past 247
    #[error("Invalid slave address {address}: {reason}")]
    InvalidAddress { address: u32, reason: String },

    /// The slave is already registered
    #[error("Slave {slave_id} already present")]
    DuplicateSlave { slave_id: u8 },

    /// The slave already owns a block of this kind
    #[error("Slave {slave_id} already has a {kind} block")]
    DuplicateBlock { slave_id: u8, kind: BlockKind },

    /// Slave, block or populated address is absent
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// Offset at or beyond the block size
    ///
    /// Raised before any state is touched, so a failed write leaves the
    /// block unchanged.
    #[error("OutOfModbusBlockError: address {address} is out of {kind} block size {size}")]
    OutOfRange { kind: BlockKind, address: u32, size: u16 },

    /// The TCP listener could not be bound
    #[error("Failed to bind {endpoint}: {message}")]
    Bind { endpoint: String, message: String },

    /// The serial device could not be opened or configured
    #[error("Error in opening serial port {port}: {message}")]
    Serial { port: String, message: String },

    /// I/O related errors (network, serial)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// An I/O call exceeded its bound
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Unsupported function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// CRC validation failure on an RTU frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Modbus exception response
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Malformed or incomplete state snapshot
    #[error("LoadError: Failed to load previous simulation state: {message}")]
    Restore { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create an invalid slave address error
    pub fn invalid_address<S: Into<String>>(address: u32, reason: S) -> Self {
        Self::InvalidAddress {
            address,
            reason: reason.into(),
        }
    }

    pub fn duplicate_slave(slave_id: u8) -> Self {
        Self::DuplicateSlave { slave_id }
    }

    pub fn duplicate_block(slave_id: u8, kind: BlockKind) -> Self {
        Self::DuplicateBlock { slave_id, kind }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn out_of_range(kind: BlockKind, address: u32, size: u16) -> Self {
        Self::OutOfRange { kind, address, size }
    }

    /// Create a bind error for a TCP endpoint
    pub fn bind<E: Into<String>, S: Into<String>>(endpoint: E, message: S) -> Self {
        Self::Bind {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a serial port error
    pub fn serial<P: Into<String>, S: Into<String>>(port: P, message: S) -> Self {
        Self::Serial {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Standard exception codes are mapped to their human-readable names.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a restore error
    pub fn restore<S: Into<String>>(message: S) -> Self {
        Self::Restore { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is a network/transport issue
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_simu::ModbusError;
    ///
    /// assert!(ModbusError::bind("127.0.0.1:502", "address in use").is_transport_error());
    /// assert!(!ModbusError::duplicate_slave(3).is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Bind { .. } | Self::Serial { .. } | Self::Io { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }

    /// Check if the error comes from slave/block/address bookkeeping
    ///
    /// These are the errors a simulation or reconciliation tick swallows
    /// per address before moving on to the next one.
    pub fn is_data_model_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress { .. }
                | Self::DuplicateSlave { .. }
                | Self::DuplicateBlock { .. }
                | Self::NotFound { .. }
                | Self::OutOfRange { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
///
/// The duration is unknown at this point; callers that know it build the
/// error with [`ModbusError::timeout`] instead.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
