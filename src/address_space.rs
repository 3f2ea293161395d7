/// Per-transport address space
///
/// An [`AddressSpace`] pairs the simulator's shadow store with the live
/// store served to clients, plus the engine currently serving it (if any).
/// Mutations go to the live side first and then to the shadow, so a client
/// never observes a value the shadow does not yet know about for longer
/// than one write.

use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::engine::{ProtocolEngine, TransportKind};
use crate::error::ModbusResult;
use crate::protocol::{BlockKind, ModbusAddress, ModbusValue, SlaveId};
use crate::register_store::RegisterStore;

pub struct AddressSpace {
    transport: TransportKind,
    shadow: Arc<RegisterStore>,
    live: Arc<RegisterStore>,
    engine: RwLock<Option<Arc<dyn ProtocolEngine>>>,
}

impl AddressSpace {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            shadow: Arc::new(RegisterStore::new()),
            live: Arc::new(RegisterStore::new()),
            engine: RwLock::new(None),
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// The simulator's own view of tracked addresses
    pub fn shadow(&self) -> &Arc<RegisterStore> {
        &self.shadow
    }

    /// The store engines serve to clients
    pub fn live(&self) -> &Arc<RegisterStore> {
        &self.live
    }

    pub fn engine(&self) -> Option<Arc<dyn ProtocolEngine>> {
        self.engine.read().clone()
    }

    /// Install an engine, returning the previous one
    pub fn replace_engine(
        &self,
        engine: Option<Arc<dyn ProtocolEngine>>,
    ) -> Option<Arc<dyn ProtocolEngine>> {
        std::mem::replace(&mut *self.engine.write(), engine)
    }

    /// Engine that is currently serving, if any
    pub fn running_engine(&self) -> Option<Arc<dyn ProtocolEngine>> {
        self.engine().filter(|engine| engine.is_running())
    }

    pub fn add_slave(&self, slave_id: SlaveId) -> ModbusResult<()> {
        match self.engine() {
            Some(engine) => engine.add_slave(slave_id)?,
            None => self.live.add_slave(slave_id)?,
        }
        self.shadow.add_slave(slave_id)
    }

    pub fn remove_slave(&self, slave_id: SlaveId) -> ModbusResult<()> {
        match self.engine() {
            Some(engine) => engine.remove_slave(slave_id)?,
            None => self.live.remove_slave(slave_id)?,
        }
        self.shadow.remove_slave(slave_id)
    }

    pub fn add_block(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        start: ModbusAddress,
        size: u16,
    ) -> ModbusResult<()> {
        match self.engine() {
            Some(engine) => engine.add_block(slave_id, kind, start, size)?,
            None => self.live.add_block(slave_id, kind, start, size)?,
        }
        self.shadow.add_block(slave_id, kind, start, size)
    }

    pub fn remove_block(&self, slave_id: SlaveId, kind: BlockKind) -> ModbusResult<()> {
        match self.engine() {
            Some(engine) => engine.remove_block(slave_id, kind)?,
            None => self.live.remove_block(slave_id, kind)?,
        }
        self.shadow.remove_block(slave_id, kind)
    }

    /// Write one value, live side first
    pub fn set_value(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        offset: ModbusAddress,
        value: ModbusValue,
    ) -> ModbusResult<()> {
        match self.engine() {
            Some(engine) => engine.set_values(slave_id, kind, offset, &[value])?,
            None => self.live.set_value(slave_id, kind, offset, value)?,
        }
        self.shadow.set_value(slave_id, kind, offset, value)
    }

    /// Shadow value of a tracked address
    pub fn get_value(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        offset: ModbusAddress,
    ) -> ModbusResult<ModbusValue> {
        self.shadow.get_value(slave_id, kind, offset)
    }

    /// Value clients currently see at an address
    pub fn live_value(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        offset: ModbusAddress,
    ) -> ModbusResult<ModbusValue> {
        let values = match self.engine() {
            Some(engine) => engine.get_values(slave_id, kind, offset, 1)?,
            None => self.live.read_range(slave_id, kind, offset, 1)?,
        };
        Ok(values.first().copied().unwrap_or_default())
    }

    /// Stop tracking some offsets and rebuild the live block from the rest
    ///
    /// Dropped addresses read back as 0 on the wire.
    pub fn remove_entries(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        offsets: &[ModbusAddress],
    ) -> ModbusResult<usize> {
        let (start, size) = self.shadow.block_layout(slave_id, kind)?;
        let removed = offsets
            .iter()
            .filter(|&&offset| self.shadow.clear_value(slave_id, kind, offset).is_ok())
            .count();

        self.live.remove_block(slave_id, kind)?;
        self.live.add_block(slave_id, kind, start, size)?;
        for (offset, value) in self.shadow.entries(slave_id, kind)? {
            self.live.set_value(slave_id, kind, offset, value)?;
        }

        debug!("Removed {} {} entries from slave {}", removed, kind, slave_id);
        Ok(removed)
    }

    /// Tracked `(slave, offsets)` of a kind
    pub fn tracked(&self, kind: BlockKind) -> Vec<(SlaveId, Vec<ModbusAddress>)> {
        self.shadow.tracked(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{create_engine, EngineKind, TcpSettings, TransportConfig};

    fn space_with_slave() -> AddressSpace {
        let space = AddressSpace::new(TransportKind::Tcp);
        space.add_slave(1).unwrap();
        space.add_block(1, BlockKind::HoldingRegister, 0, 10).unwrap();
        space
    }

    #[test]
    fn test_writes_reach_both_stores() {
        let space = space_with_slave();
        space.set_value(1, BlockKind::HoldingRegister, 3, 77).unwrap();
        assert_eq!(space.get_value(1, BlockKind::HoldingRegister, 3).unwrap(), 77);
        assert_eq!(space.live_value(1, BlockKind::HoldingRegister, 3).unwrap(), 77);
        assert!(space.set_value(1, BlockKind::HoldingRegister, 10, 1).is_err());
    }

    #[test]
    fn test_engine_shares_live_store() {
        let space = space_with_slave();
        let engine = create_engine(
            EngineKind::Native,
            TransportConfig::Tcp(TcpSettings::default()),
            Arc::clone(space.live()),
        );
        assert!(space.replace_engine(Some(Arc::from(engine))).is_none());
        assert!(space.running_engine().is_none());

        space.set_value(1, BlockKind::HoldingRegister, 0, 5).unwrap();
        assert_eq!(space.live().get_value(1, BlockKind::HoldingRegister, 0).unwrap(), 5);
        assert!(space.replace_engine(None).is_some());
    }

    #[test]
    fn test_remove_entries_rebuilds_live_block() {
        let space = space_with_slave();
        for offset in 0..4 {
            space.set_value(1, BlockKind::HoldingRegister, offset, offset + 10).unwrap();
        }

        assert_eq!(space.remove_entries(1, BlockKind::HoldingRegister, &[1, 2, 9]).unwrap(), 2);
        assert_eq!(space.tracked(BlockKind::HoldingRegister), vec![(1, vec![0, 3])]);
        assert_eq!(
            space.live().read_range(1, BlockKind::HoldingRegister, 0, 4).unwrap(),
            vec![10, 0, 0, 13]
        );
    }
}
