/// Modbus protocol definitions and data structures
///
/// This module contains the data table kinds a simulated slave exposes,
/// the supported function codes, exception codes, and the decoded
/// request/response shapes shared by both protocol engines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value, 0/1 for bit tables)
pub type ModbusValue = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Lowest addressable slave
pub const MIN_SLAVE_ID: SlaveId = 1;

/// Highest addressable slave
pub const MAX_SLAVE_ID: SlaveId = 247;

/// The four standard Modbus data tables a slave can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockKind {
    /// Read/write bits (0x01, 0x05, 0x0F)
    #[serde(alias = "Fun_Code15")]
    Coil,
    /// Read-only bits (0x02)
    #[serde(alias = "Fun_Code02")]
    DiscreteInput,
    /// Read/write 16-bit registers (0x03, 0x06, 0x10)
    #[serde(alias = "Fun_Code16")]
    HoldingRegister,
    /// Read-only 16-bit registers (0x04)
    #[serde(alias = "Fun_Code03")]
    InputRegister,
}

impl BlockKind {
    /// All block kinds, in the order slaves are provisioned
    pub const ALL: [BlockKind; 4] = [
        BlockKind::Coil,
        BlockKind::DiscreteInput,
        BlockKind::HoldingRegister,
        BlockKind::InputRegister,
    ];

    /// Whether the table holds single bits rather than registers
    pub fn is_bit(self) -> bool {
        matches!(self, BlockKind::Coil | BlockKind::DiscreteInput)
    }

    /// Whether protocol clients may write this table
    pub fn is_writable(self) -> bool {
        matches!(self, BlockKind::Coil | BlockKind::HoldingRegister)
    }

    /// Largest value the table can hold
    pub fn max_value(self) -> ModbusValue {
        if self.is_bit() {
            1
        } else {
            u16::MAX
        }
    }

    /// Normalize a value for storage: bit tables keep 0 or 1
    pub fn normalize(self, value: ModbusValue) -> ModbusValue {
        if self.is_bit() {
            (value != 0) as ModbusValue
        } else {
            value
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockKind::Coil => "Coil",
            BlockKind::DiscreteInput => "DiscreteInput",
            BlockKind::HoldingRegister => "HoldingRegister",
            BlockKind::InputRegister => "InputRegister",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockKind {
    type Err = ModbusError;

    /// Accepts the variant names and the legacy function-code tab names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Coil" | "Fun_Code15" => Ok(BlockKind::Coil),
            "DiscreteInput" | "Fun_Code02" => Ok(BlockKind::DiscreteInput),
            "HoldingRegister" | "Fun_Code16" => Ok(BlockKind::HoldingRegister),
            "InputRegister" | "Fun_Code03" => Ok(BlockKind::InputRegister),
            other => Err(ModbusError::invalid_data(format!("Unknown block kind: {}", other))),
        }
    }
}

/// Modbus function codes served by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// The data table this function operates on
    pub fn block_kind(self) -> BlockKind {
        match self {
            ModbusFunction::ReadCoils
            | ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteMultipleCoils => BlockKind::Coil,
            ModbusFunction::ReadDiscreteInputs => BlockKind::DiscreteInput,
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::WriteMultipleRegisters => BlockKind::HoldingRegister,
            ModbusFunction::ReadInputRegisters => BlockKind::InputRegister,
        }
    }

    /// Largest quantity a single read or multi-write may carry
    pub fn max_quantity(self) -> u16 {
        if self.block_kind().is_bit() {
            crate::MAX_COILS_PER_REQUEST
        } else {
            crate::MAX_REGISTERS_PER_REQUEST
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// A decoded request PDU, independent of the framing it arrived in
#[derive(Debug, Clone, PartialEq)]
pub enum ModbusRequest {
    /// Any of the four read functions
    Read {
        function: ModbusFunction,
        address: ModbusAddress,
        quantity: u16,
    },
    WriteSingleCoil {
        address: ModbusAddress,
        value: bool,
    },
    WriteSingleRegister {
        address: ModbusAddress,
        value: ModbusValue,
    },
    WriteMultipleCoils {
        address: ModbusAddress,
        values: Vec<bool>,
    },
    WriteMultipleRegisters {
        address: ModbusAddress,
        values: Vec<ModbusValue>,
    },
    /// A function code outside the four data tables
    Unsupported { function_code: u8 },
}

impl ModbusRequest {
    /// Raw function code of the request
    pub fn function_code(&self) -> u8 {
        match self {
            ModbusRequest::Read { function, .. } => function.to_u8(),
            ModbusRequest::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil.to_u8(),
            ModbusRequest::WriteSingleRegister { .. } => {
                ModbusFunction::WriteSingleRegister.to_u8()
            }
            ModbusRequest::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils.to_u8(),
            ModbusRequest::WriteMultipleRegisters { .. } => {
                ModbusFunction::WriteMultipleRegisters.to_u8()
            }
            ModbusRequest::Unsupported { function_code } => *function_code,
        }
    }
}

/// A successful response, before framing
#[derive(Debug, Clone, PartialEq)]
pub enum ModbusResponse {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<ModbusValue>),
    ReadInputRegisters(Vec<ModbusValue>),
    WriteSingleCoil(ModbusAddress, bool),
    WriteSingleRegister(ModbusAddress, ModbusValue),
    WriteMultipleCoils(ModbusAddress, u16),
    WriteMultipleRegisters(ModbusAddress, u16),
}

impl ModbusResponse {
    pub fn function(&self) -> ModbusFunction {
        match self {
            ModbusResponse::ReadCoils(_) => ModbusFunction::ReadCoils,
            ModbusResponse::ReadDiscreteInputs(_) => ModbusFunction::ReadDiscreteInputs,
            ModbusResponse::ReadHoldingRegisters(_) => ModbusFunction::ReadHoldingRegisters,
            ModbusResponse::ReadInputRegisters(_) => ModbusFunction::ReadInputRegisters,
            ModbusResponse::WriteSingleCoil(..) => ModbusFunction::WriteSingleCoil,
            ModbusResponse::WriteSingleRegister(..) => ModbusFunction::WriteSingleRegister,
            ModbusResponse::WriteMultipleCoils(..) => ModbusFunction::WriteMultipleCoils,
            ModbusResponse::WriteMultipleRegisters(..) => ModbusFunction::WriteMultipleRegisters,
        }
    }
}

/// Validate a slave id (1-247)
pub fn validate_slave_id(slave_id: u32) -> ModbusResult<SlaveId> {
    if slave_id < MIN_SLAVE_ID as u32 {
        return Err(ModbusError::invalid_address(
            slave_id,
            format!("slave address should be greater than {}", MIN_SLAVE_ID - 1),
        ));
    }
    if slave_id > MAX_SLAVE_ID as u32 {
        return Err(ModbusError::invalid_address(
            slave_id,
            format!("beyond supported modbus slave device address ({})", MAX_SLAVE_ID),
        ));
    }
    Ok(slave_id as SlaveId)
}

/// Bit packing helpers
pub mod data_utils {
    /// Pack boolean values into bytes, LSB first
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map(|byte| byte & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert_eq!(ModbusFunction::WriteMultipleCoils.block_kind(), BlockKind::Coil);
        assert!(ModbusFunction::from_u8(0x2B).is_err());
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(ModbusException::from_u8(0x02).unwrap(), ModbusException::IllegalDataAddress);
        assert_eq!(ModbusException::GatewayTargetDeviceFailedToRespond.to_u8(), 0x0B);
    }

    #[test]
    fn test_block_kind_parsing() {
        assert_eq!("HoldingRegister".parse::<BlockKind>().unwrap(), BlockKind::HoldingRegister);
        assert_eq!("Fun_Code15".parse::<BlockKind>().unwrap(), BlockKind::Coil);
        assert!("Fun_Code99".parse::<BlockKind>().is_err());
        assert_eq!(BlockKind::Coil.normalize(7), 1);
        assert_eq!(BlockKind::InputRegister.normalize(7), 7);
        assert!(BlockKind::Coil.is_writable());
        assert!(!BlockKind::DiscreteInput.is_writable());
        assert!(!BlockKind::InputRegister.is_writable());
    }

    #[test]
    fn test_slave_id_validation() {
        assert_eq!(validate_slave_id(1).unwrap(), 1);
        assert_eq!(validate_slave_id(247).unwrap(), 247);
        assert!(matches!(validate_slave_id(0), Err(ModbusError::InvalidAddress { .. })));
        assert!(matches!(validate_slave_id(248), Err(ModbusError::InvalidAddress { .. })));
    }

    #[test]
    fn test_bit_packing() {
        let bits = vec![true, false, true, true, false, false, false, false, true];
        let packed = data_utils::pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(data_utils::unpack_bits(&packed, bits.len()), bits);
    }
}
