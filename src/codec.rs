//! # Modbus Wire Codec
//!
//! PDU decoding and encoding plus the two framings the simulator serves:
//!
//! - **MBAP** (Modbus TCP): 7-byte header `transaction id | protocol id (0)
//!   | length | unit id` followed by the PDU. Responses echo the
//!   transaction and unit ids.
//! - **RTU** (serial): `slave | PDU | CRC-16/MODBUS`, CRC transmitted low
//!   byte first.
//!
//! All multi-byte fields inside the PDU are big-endian.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{
    data_utils, ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId,
};

/// MBAP header size including the unit id
pub const MBAP_HEADER_SIZE: usize = 7;

/// Maximum frame size for Modbus TCP
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum frame size for Modbus RTU
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Maximum PDU size
pub const MAX_PDU_SIZE: usize = 253;

/// CRC calculator for RTU
pub const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

fn malformed(function_code: u8) -> ModbusError {
    ModbusError::exception(function_code, ModbusException::IllegalDataValue.to_u8())
}

/// Decode a request PDU (function code + data)
///
/// Function codes outside the served set decode to
/// [`ModbusRequest::Unsupported`]. A body that does not match its function
/// code fails with an `Exception` carrying code 0x03.
pub fn decode_request(pdu: &[u8]) -> ModbusResult<ModbusRequest> {
    let (&function_code, body) = pdu
        .split_first()
        .ok_or_else(|| ModbusError::frame("Empty PDU"))?;

    let function = match ModbusFunction::from_u8(function_code) {
        Ok(function) => function,
        Err(_) => return Ok(ModbusRequest::Unsupported { function_code }),
    };

    if body.len() < 4 {
        return Err(malformed(function_code));
    }
    let address = BigEndian::read_u16(&body[0..2]);
    let field = BigEndian::read_u16(&body[2..4]);

    let request = match function {
        ModbusFunction::ReadCoils
        | ModbusFunction::ReadDiscreteInputs
        | ModbusFunction::ReadHoldingRegisters
        | ModbusFunction::ReadInputRegisters => ModbusRequest::Read {
            function,
            address,
            quantity: field,
        },
        ModbusFunction::WriteSingleCoil => {
            let value = match field {
                COIL_ON => true,
                COIL_OFF => false,
                _ => return Err(malformed(function_code)),
            };
            ModbusRequest::WriteSingleCoil { address, value }
        }
        ModbusFunction::WriteSingleRegister => ModbusRequest::WriteSingleRegister {
            address,
            value: field,
        },
        ModbusFunction::WriteMultipleCoils => {
            let data = multi_write_data(function_code, body)?;
            if data.len() != (field as usize + 7) / 8 {
                return Err(malformed(function_code));
            }
            ModbusRequest::WriteMultipleCoils {
                address,
                values: data_utils::unpack_bits(data, field as usize),
            }
        }
        ModbusFunction::WriteMultipleRegisters => {
            let data = multi_write_data(function_code, body)?;
            if data.len() != field as usize * 2 {
                return Err(malformed(function_code));
            }
            ModbusRequest::WriteMultipleRegisters {
                address,
                values: data.chunks_exact(2).map(BigEndian::read_u16).collect(),
            }
        }
    };

    Ok(request)
}

/// Payload of a multi-write body, checked against its byte count field
fn multi_write_data(function_code: u8, body: &[u8]) -> ModbusResult<&[u8]> {
    let byte_count = *body.get(4).ok_or_else(|| malformed(function_code))? as usize;
    let data = &body[5..];
    if data.len() != byte_count {
        return Err(malformed(function_code));
    }
    Ok(data)
}

/// Encode a successful response PDU
pub fn encode_response(response: &ModbusResponse) -> Vec<u8> {
    let mut pdu = vec![response.function().to_u8()];

    match response {
        ModbusResponse::ReadCoils(bits) | ModbusResponse::ReadDiscreteInputs(bits) => {
            let packed = data_utils::pack_bits(bits);
            pdu.push(packed.len() as u8);
            pdu.extend_from_slice(&packed);
        }
        ModbusResponse::ReadHoldingRegisters(values)
        | ModbusResponse::ReadInputRegisters(values) => {
            pdu.push((values.len() * 2) as u8);
            let mut data = vec![0u8; values.len() * 2];
            BigEndian::write_u16_into(values, &mut data);
            pdu.extend_from_slice(&data);
        }
        ModbusResponse::WriteSingleCoil(address, value) => {
            push_u16(&mut pdu, *address);
            push_u16(&mut pdu, if *value { COIL_ON } else { COIL_OFF });
        }
        ModbusResponse::WriteSingleRegister(address, value) => {
            push_u16(&mut pdu, *address);
            push_u16(&mut pdu, *value);
        }
        ModbusResponse::WriteMultipleCoils(address, quantity)
        | ModbusResponse::WriteMultipleRegisters(address, quantity) => {
            push_u16(&mut pdu, *address);
            push_u16(&mut pdu, *quantity);
        }
    }

    pdu
}

/// Encode an exception response PDU
pub fn encode_exception(function_code: u8, exception: ModbusException) -> Vec<u8> {
    vec![function_code | 0x80, exception.to_u8()]
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    let mut bytes = [0u8; 2];
    BigEndian::write_u16(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

/// Modbus TCP application protocol header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit id plus PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse the first [`MBAP_HEADER_SIZE`] bytes of a frame
    pub fn parse(bytes: &[u8]) -> ModbusResult<Self> {
        if bytes.len() < MBAP_HEADER_SIZE {
            return Err(ModbusError::frame("Frame too short"));
        }

        let header = Self {
            transaction_id: BigEndian::read_u16(&bytes[0..2]),
            protocol_id: BigEndian::read_u16(&bytes[2..4]),
            length: BigEndian::read_u16(&bytes[4..6]),
            unit_id: bytes[6],
        };

        if header.protocol_id != 0 {
            return Err(ModbusError::frame(format!(
                "Invalid protocol ID: {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || header.length as usize > MAX_PDU_SIZE + 1 {
            return Err(ModbusError::frame(format!("Invalid MBAP length: {}", header.length)));
        }

        Ok(header)
    }

    /// Number of PDU bytes following the header
    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

/// Wrap a PDU in an MBAP header
pub fn encode_mbap(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
    push_u16(&mut frame, transaction_id);
    push_u16(&mut frame, 0);
    push_u16(&mut frame, (pdu.len() + 1) as u16);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// CRC-16/MODBUS of a byte slice
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Build an RTU frame: slave, PDU, CRC (little-endian)
pub fn encode_rtu(slave_id: SlaveId, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(slave_id);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Split an RTU frame into slave id and PDU after checking its CRC
pub fn decode_rtu(frame: &[u8]) -> ModbusResult<(SlaveId, &[u8])> {
    if frame.len() < 4 {
        return Err(ModbusError::frame("RTU frame too short"));
    }
    if frame.len() > MAX_RTU_FRAME_SIZE {
        return Err(ModbusError::frame("RTU frame too large"));
    }

    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let calculated = crc16(&frame[..data_len]);
    if received != calculated {
        return Err(ModbusError::crc_mismatch(calculated, received));
    }

    Ok((frame[0], &frame[1..data_len]))
}
