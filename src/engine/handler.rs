/// Request handling shared by every protocol engine
///
/// Both backends funnel decoded requests through [`handle_request`], so the
/// same store state always yields the same response bytes regardless of
/// which engine is serving.

use log::{debug, warn};

use crate::codec;
use crate::error::ModbusError;
use crate::protocol::{
    ModbusAddress, ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, ModbusValue,
    SlaveId,
};
use crate::register_store::RegisterStore;

/// Serve one decoded request against the live store
///
/// | condition                                   | exception |
/// |---------------------------------------------|-----------|
/// | slave not registered                        | 0x0B      |
/// | function code not served                    | 0x01      |
/// | quantity 0 or above the per-request maximum | 0x03      |
/// | no block of that kind on the slave          | 0x02      |
/// | range outside `start..start + size`         | 0x02      |
pub fn handle_request(
    store: &RegisterStore,
    slave_id: SlaveId,
    request: &ModbusRequest,
) -> Result<ModbusResponse, ModbusException> {
    if !store.contains_slave(slave_id) {
        debug!("Request for unknown slave {}", slave_id);
        return Err(ModbusException::GatewayTargetDeviceFailedToRespond);
    }

    match request {
        ModbusRequest::Unsupported { function_code } => {
            debug!("Unsupported function code 0x{:02X} for slave {}", function_code, slave_id);
            Err(ModbusException::IllegalFunction)
        }
        ModbusRequest::Read {
            function,
            address,
            quantity,
        } => {
            check_quantity(*function, *quantity as usize)?;
            let kind = function.block_kind();
            let values = store
                .read_wire(slave_id, kind, *address, *quantity)
                .map_err(|e| to_exception(slave_id, e))?;
            Ok(read_response(*function, values))
        }
        ModbusRequest::WriteSingleCoil { address, value } => {
            let values = [*value as ModbusValue];
            write(store, slave_id, ModbusFunction::WriteSingleCoil, *address, &values)?;
            Ok(ModbusResponse::WriteSingleCoil(*address, *value))
        }
        ModbusRequest::WriteSingleRegister { address, value } => {
            write(store, slave_id, ModbusFunction::WriteSingleRegister, *address, &[*value])?;
            Ok(ModbusResponse::WriteSingleRegister(*address, *value))
        }
        ModbusRequest::WriteMultipleCoils { address, values } => {
            let function = ModbusFunction::WriteMultipleCoils;
            check_quantity(function, values.len())?;
            let values: Vec<ModbusValue> = values.iter().map(|&bit| bit as ModbusValue).collect();
            write(store, slave_id, function, *address, &values)?;
            Ok(ModbusResponse::WriteMultipleCoils(*address, values.len() as u16))
        }
        ModbusRequest::WriteMultipleRegisters { address, values } => {
            let function = ModbusFunction::WriteMultipleRegisters;
            check_quantity(function, values.len())?;
            write(store, slave_id, function, *address, values)?;
            Ok(ModbusResponse::WriteMultipleRegisters(*address, values.len() as u16))
        }
    }
}

/// Decode a request PDU, serve it and encode the reply PDU
///
/// Returns `None` when the PDU is too damaged to answer at all.
pub fn process_pdu(store: &RegisterStore, slave_id: SlaveId, pdu: &[u8]) -> Option<Vec<u8>> {
    let function_code = *pdu.first()?;

    let request = match codec::decode_request(pdu) {
        Ok(request) => request,
        Err(ModbusError::Exception { code, .. }) => {
            let exception = ModbusException::from_u8(code)
                .unwrap_or(ModbusException::IllegalDataValue);
            return Some(codec::encode_exception(function_code, exception));
        }
        Err(err) => {
            warn!("Dropping undecodable PDU for slave {}: {}", slave_id, err);
            return None;
        }
    };

    Some(match handle_request(store, slave_id, &request) {
        Ok(response) => codec::encode_response(&response),
        Err(exception) => codec::encode_exception(function_code, exception),
    })
}

fn check_quantity(function: ModbusFunction, quantity: usize) -> Result<(), ModbusException> {
    if quantity == 0 || quantity > function.max_quantity() as usize {
        debug!("Illegal quantity {} for {}", quantity, function);
        return Err(ModbusException::IllegalDataValue);
    }
    Ok(())
}

fn write(
    store: &RegisterStore,
    slave_id: SlaveId,
    function: ModbusFunction,
    address: ModbusAddress,
    values: &[ModbusValue],
) -> Result<(), ModbusException> {
    let kind = function.block_kind();
    if !kind.is_writable() {
        debug!("{} targets read-only {} table", function, kind);
        return Err(ModbusException::IllegalFunction);
    }
    store
        .write_wire(slave_id, kind, address, values)
        .map_err(|e| to_exception(slave_id, e))
}

fn read_response(function: ModbusFunction, values: Vec<ModbusValue>) -> ModbusResponse {
    let bits = || values.iter().map(|&v| v != 0).collect();
    match function {
        ModbusFunction::ReadCoils => ModbusResponse::ReadCoils(bits()),
        ModbusFunction::ReadDiscreteInputs => ModbusResponse::ReadDiscreteInputs(bits()),
        ModbusFunction::ReadInputRegisters => ModbusResponse::ReadInputRegisters(values),
        _ => ModbusResponse::ReadHoldingRegisters(values),
    }
}

/// Store errors seen while serving a request
fn to_exception(slave_id: SlaveId, err: ModbusError) -> ModbusException {
    match err {
        ModbusError::NotFound { .. } | ModbusError::OutOfRange { .. } => {
            debug!("Slave {}: {}", slave_id, err);
            ModbusException::IllegalDataAddress
        }
        other => {
            warn!("Request failed: {}", other);
            ModbusException::ServerDeviceFailure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BlockKind;

    fn store() -> RegisterStore {
        let store = RegisterStore::new();
        store.add_slave(1).unwrap();
        store.add_block(1, BlockKind::HoldingRegister, 100, 10).unwrap();
        store.add_block(1, BlockKind::Coil, 0, 16).unwrap();
        store
    }

    #[test]
    fn test_read_translates_wire_address() {
        let store = store();
        store.set_value(1, BlockKind::HoldingRegister, 2, 0x1234).unwrap();
        let response = handle_request(
            &store,
            1,
            &ModbusRequest::Read {
                function: ModbusFunction::ReadHoldingRegisters,
                address: 101,
                quantity: 2,
            },
        )
        .unwrap();
        assert_eq!(response, ModbusResponse::ReadHoldingRegisters(vec![0, 0x1234]));
    }

    #[test]
    fn test_exception_table() {
        let store = store();
        let read = |slave_id, function, address, quantity| {
            handle_request(
                &store,
                slave_id,
                &ModbusRequest::Read {
                    function,
                    address,
                    quantity,
                },
            )
        };

        assert_eq!(
            read(9, ModbusFunction::ReadHoldingRegisters, 100, 1),
            Err(ModbusException::GatewayTargetDeviceFailedToRespond)
        );
        assert_eq!(
            handle_request(&store, 1, &ModbusRequest::Unsupported { function_code: 0x17 }),
            Err(ModbusException::IllegalFunction)
        );
        assert_eq!(
            read(1, ModbusFunction::ReadInputRegisters, 0, 1),
            Err(ModbusException::IllegalDataAddress)
        );
        assert_eq!(
            read(1, ModbusFunction::ReadHoldingRegisters, 99, 1),
            Err(ModbusException::IllegalDataAddress)
        );
        assert_eq!(
            read(1, ModbusFunction::ReadHoldingRegisters, 105, 6),
            Err(ModbusException::IllegalDataAddress)
        );
        assert_eq!(
            read(1, ModbusFunction::ReadHoldingRegisters, 100, 0),
            Err(ModbusException::IllegalDataValue)
        );
        assert_eq!(
            read(1, ModbusFunction::ReadHoldingRegisters, 100, 126),
            Err(ModbusException::IllegalDataValue)
        );
        assert_eq!(
            read(1, ModbusFunction::ReadCoils, 0, 2001),
            Err(ModbusException::IllegalDataValue)
        );
    }

    #[test]
    fn test_writes_update_store() {
        let store = store();
        handle_request(
            &store,
            1,
            &ModbusRequest::WriteMultipleRegisters {
                address: 108,
                values: vec![7, 8],
            },
        )
        .unwrap();
        let coil = ModbusRequest::WriteSingleCoil {
            address: 15,
            value: true,
        };
        handle_request(&store, 1, &coil).unwrap();

        assert_eq!(store.get_value(1, BlockKind::HoldingRegister, 8).unwrap(), 7);
        assert_eq!(store.get_value(1, BlockKind::HoldingRegister, 9).unwrap(), 8);
        assert_eq!(store.get_value(1, BlockKind::Coil, 15).unwrap(), 1);

        let overflow = handle_request(
            &store,
            1,
            &ModbusRequest::WriteMultipleRegisters {
                address: 109,
                values: vec![1, 2],
            },
        );
        assert_eq!(overflow, Err(ModbusException::IllegalDataAddress));
        assert_eq!(store.get_value(1, BlockKind::HoldingRegister, 9).unwrap(), 8);
    }

    #[test]
    fn test_process_pdu() {
        let store = store();
        store.set_value(1, BlockKind::Coil, 0, 1).unwrap();
        store.set_value(1, BlockKind::Coil, 2, 1).unwrap();

        assert_eq!(
            process_pdu(&store, 1, &[0x01, 0x00, 0x00, 0x00, 0x03]),
            Some(vec![0x01, 0x01, 0x05])
        );
        assert_eq!(
            process_pdu(&store, 1, &[0x05, 0x00, 0x00, 0x12, 0x34]),
            Some(vec![0x85, 0x03])
        );
        assert_eq!(process_pdu(&store, 2, &[0x03, 0x00, 0x00, 0x00, 0x01]), Some(vec![0x83, 0x0B]));
        assert_eq!(process_pdu(&store, 1, &[]), None);
    }

    #[test]
    fn test_block_replaced_between_requests() {
        let store = store();
        let mut changes = store.subscribe();
        let write = ModbusRequest::WriteSingleRegister {
            address: 102,
            value: 9,
        };
        handle_request(&store, 1, &write).unwrap();
        let change = changes.try_recv().unwrap();
        assert_eq!((change.kind, change.address, change.value), (BlockKind::HoldingRegister, 2, 9));

        // Same wire address, new layout: the offset follows the new start
        store.remove_block(1, BlockKind::HoldingRegister).unwrap();
        store.add_block(1, BlockKind::HoldingRegister, 0, 200).unwrap();
        handle_request(&store, 1, &write).unwrap();
        assert_eq!(store.get_value(1, BlockKind::HoldingRegister, 102).unwrap(), 9);
        assert!(store.get_value(1, BlockKind::HoldingRegister, 2).is_err());

        store.remove_block(1, BlockKind::HoldingRegister).unwrap();
        assert_eq!(
            handle_request(&store, 1, &write),
            Err(ModbusException::IllegalDataAddress)
        );
    }
}
