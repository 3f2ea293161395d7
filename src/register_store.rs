/// Slave/block register storage
///
/// The store models every simulated slave, the data tables (blocks) it
/// exposes and the values at each populated offset. It performs no I/O.
///
/// Locking is two-level: slave and block maps sit behind `RwLock`s that
/// are held only long enough to clone an `Arc`, and every block carries
/// its own `Mutex`. A write to one (slave, block) pair is therefore atomic
/// with respect to other writers of the same pair while writers to other
/// pairs proceed in parallel.

use indexmap::IndexMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{validate_slave_id, BlockKind, ModbusAddress, ModbusValue, SlaveId};

/// Default number of addresses in a block
pub const DEFAULT_BLOCK_SIZE: u16 = 100;

/// Capacity of the value-change broadcast channel
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Notification emitted for every successful value write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueChange {
    pub slave_id: SlaveId,
    pub kind: BlockKind,
    pub address: ModbusAddress,
    pub value: ModbusValue,
}

/// One data table of a slave
///
/// Offsets run from 0 to `size - 1`; the wire address of offset 0 is
/// `start`. Populated offsets keep their insertion order.
#[derive(Debug, Clone)]
pub struct Block {
    kind: BlockKind,
    start: ModbusAddress,
    size: u16,
    values: IndexMap<ModbusAddress, ModbusValue>,
}

impl Block {
    pub fn new(kind: BlockKind, start: ModbusAddress, size: u16) -> Self {
        Self {
            kind,
            start,
            size,
            values: IndexMap::new(),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn start(&self) -> ModbusAddress {
        self.start
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Number of populated offsets
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn check_offset(&self, offset: u32) -> ModbusResult<()> {
        if offset >= self.size as u32 {
            return Err(ModbusError::out_of_range(self.kind, offset, self.size));
        }
        Ok(())
    }

    /// Store a value, returning it as stored (bits normalized to 0/1)
    pub fn set(&mut self, offset: ModbusAddress, value: ModbusValue) -> ModbusResult<ModbusValue> {
        self.check_offset(offset as u32)?;
        let value = self.kind.normalize(value);
        self.values.insert(offset, value);
        Ok(value)
    }

    /// Value at a populated offset
    pub fn get(&self, offset: ModbusAddress) -> ModbusResult<ModbusValue> {
        self.check_offset(offset as u32)?;
        self.values.get(&offset).copied().ok_or_else(|| {
            ModbusError::not_found(format!("{} address {}", self.kind, offset))
        })
    }

    /// Values of `count` offsets starting at `offset`; unpopulated ones read as 0
    pub fn read_range(&self, offset: ModbusAddress, count: u16) -> ModbusResult<Vec<ModbusValue>> {
        let end = offset as u32 + count as u32;
        if count > 0 {
            self.check_offset(end - 1)?;
        }
        Ok((offset..offset + count)
            .map(|addr| self.values.get(&addr).copied().unwrap_or(0))
            .collect())
    }

    /// Write consecutive values; nothing is written unless all of them fit
    pub fn write_range(
        &mut self,
        offset: ModbusAddress,
        values: &[ModbusValue],
    ) -> ModbusResult<Vec<ModbusValue>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        self.check_offset(offset as u32 + values.len() as u32 - 1)?;
        Ok(values
            .iter()
            .enumerate()
            .map(|(i, &value)| {
                let value = self.kind.normalize(value);
                self.values.insert(offset + i as u16, value);
                value
            })
            .collect())
    }

    /// Drop a populated offset, keeping the order of the others
    pub fn remove(&mut self, offset: ModbusAddress) -> Option<ModbusValue> {
        self.values.shift_remove(&offset)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Populated offsets in insertion order
    pub fn offsets(&self) -> Vec<ModbusAddress> {
        self.values.keys().copied().collect()
    }

    /// Populated `(offset, value)` pairs in insertion order
    pub fn entries(&self) -> Vec<(ModbusAddress, ModbusValue)> {
        self.values.iter().map(|(&k, &v)| (k, v)).collect()
    }

    /// Translate a wire address range into a block offset
    ///
    /// Returns `None` when any part of `address..address + quantity` lies
    /// outside `start..start + size`.
    pub fn wire_offset(&self, address: ModbusAddress, quantity: u16) -> Option<ModbusAddress> {
        let offset = address.checked_sub(self.start)?;
        if offset as u32 + quantity as u32 > self.size as u32 {
            return None;
        }
        Some(offset)
    }
}

fn wire_offset_or_err(
    block: &Block,
    address: ModbusAddress,
    count: u16,
) -> ModbusResult<ModbusAddress> {
    block
        .wire_offset(address, count)
        .ok_or_else(|| ModbusError::out_of_range(block.kind(), address as u32, block.size()))
}

type SharedBlock = Arc<Mutex<Block>>;

#[derive(Debug)]
struct SlaveDevice {
    blocks: RwLock<HashMap<BlockKind, SharedBlock>>,
}

impl SlaveDevice {
    fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
        }
    }
}

/// Serializable image of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub kind: BlockKind,
    pub start: ModbusAddress,
    pub size: u16,
    /// Populated `(offset, value)` pairs in insertion order
    pub values: Vec<(ModbusAddress, ModbusValue)>,
}

/// Serializable image of one slave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveSnapshot {
    pub slave_id: SlaveId,
    pub blocks: Vec<BlockSnapshot>,
}

/// Serializable image of a whole store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub slaves: Vec<SlaveSnapshot>,
}

/// Register store statistics
#[derive(Debug, Clone, Default)]
pub struct RegisterStoreStats {
    pub slaves_count: usize,
    pub blocks_count: usize,
    pub tracked_addresses: usize,
}

/// In-memory model of slaves, blocks and values
#[derive(Debug)]
pub struct RegisterStore {
    slaves: RwLock<BTreeMap<SlaveId, Arc<SlaveDevice>>>,
    changes: broadcast::Sender<ValueChange>,
}

impl RegisterStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            slaves: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Receive a [`ValueChange`] for every successful write from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ValueChange> {
        self.changes.subscribe()
    }

    fn notify(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        address: ModbusAddress,
        value: ModbusValue,
    ) {
        // No receivers is fine
        let _ = self.changes.send(ValueChange {
            slave_id,
            kind,
            address,
            value,
        });
    }

    fn slave(&self, slave_id: SlaveId) -> ModbusResult<Arc<SlaveDevice>> {
        self.slaves
            .read()
            .get(&slave_id)
            .cloned()
            .ok_or_else(|| ModbusError::not_found(format!("slave {}", slave_id)))
    }

    fn block(&self, slave_id: SlaveId, kind: BlockKind) -> ModbusResult<SharedBlock> {
        self.slave(slave_id)?
            .blocks
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| ModbusError::not_found(format!("{} block on slave {}", kind, slave_id)))
    }

    /// Run `f` while holding the (slave, block) lock
    pub fn with_block<R>(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        f: impl FnOnce(&mut Block) -> ModbusResult<R>,
    ) -> ModbusResult<R> {
        let block = self.block(slave_id, kind)?;
        let mut guard = block.lock();
        f(&mut guard)
    }

    /// Register a new slave
    pub fn add_slave(&self, slave_id: SlaveId) -> ModbusResult<()> {
        validate_slave_id(slave_id as u32)?;
        let mut slaves = self.slaves.write();
        if slaves.contains_key(&slave_id) {
            return Err(ModbusError::duplicate_slave(slave_id));
        }
        slaves.insert(slave_id, Arc::new(SlaveDevice::new()));
        debug!("Added slave {}", slave_id);
        Ok(())
    }

    /// Remove a slave and release all of its blocks
    pub fn remove_slave(&self, slave_id: SlaveId) -> ModbusResult<()> {
        let slave = self
            .slaves
            .write()
            .remove(&slave_id)
            .ok_or_else(|| ModbusError::not_found(format!("slave {}", slave_id)))?;
        let blocks: Vec<SharedBlock> = slave.blocks.write().drain().map(|(_, b)| b).collect();
        for block in blocks {
            block.lock().clear();
        }
        debug!("Removed slave {}", slave_id);
        Ok(())
    }

    pub fn contains_slave(&self, slave_id: SlaveId) -> bool {
        self.slaves.read().contains_key(&slave_id)
    }

    /// Registered slave ids in ascending order
    pub fn slave_ids(&self) -> Vec<SlaveId> {
        self.slaves.read().keys().copied().collect()
    }

    /// Attach a block to a slave
    pub fn add_block(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        start: ModbusAddress,
        size: u16,
    ) -> ModbusResult<()> {
        if start as u32 + size as u32 > u16::MAX as u32 + 1 {
            return Err(ModbusError::invalid_data(format!(
                "{} block start {} with size {} exceeds the Modbus address space",
                kind, start, size
            )));
        }
        let slave = self.slave(slave_id)?;
        let mut blocks = slave.blocks.write();
        if blocks.contains_key(&kind) {
            return Err(ModbusError::duplicate_block(slave_id, kind));
        }
        blocks.insert(kind, Arc::new(Mutex::new(Block::new(kind, start, size))));
        debug!("Added {} block to slave {} (start={}, size={})", kind, slave_id, start, size);
        Ok(())
    }

    /// Detach a block from a slave, clearing its addresses first
    pub fn remove_block(&self, slave_id: SlaveId, kind: BlockKind) -> ModbusResult<()> {
        let slave = self.slave(slave_id)?;
        let block = slave
            .blocks
            .write()
            .remove(&kind)
            .ok_or_else(|| {
                ModbusError::not_found(format!("{} block on slave {}", kind, slave_id))
            })?;
        block.lock().clear();
        debug!("Removed {} block from slave {}", kind, slave_id);
        Ok(())
    }

    pub fn has_block(&self, slave_id: SlaveId, kind: BlockKind) -> bool {
        self.block(slave_id, kind).is_ok()
    }

    /// `(start, size)` of a block
    pub fn block_layout(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
    ) -> ModbusResult<(ModbusAddress, u16)> {
        self.with_block(slave_id, kind, |block| Ok((block.start(), block.size())))
    }

    /// Write one value
    ///
    /// Fails with `OutOfRange` when `address >= size`. The magnitude is not
    /// checked; bit blocks store any non-zero value as 1.
    pub fn set_value(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        address: ModbusAddress,
        value: ModbusValue,
    ) -> ModbusResult<()> {
        let stored = self.with_block(slave_id, kind, |block| block.set(address, value))?;
        self.notify(slave_id, kind, address, stored);
        Ok(())
    }

    /// Read one populated value
    pub fn get_value(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        address: ModbusAddress,
    ) -> ModbusResult<ModbusValue> {
        self.with_block(slave_id, kind, |block| block.get(address))
    }

    /// Read `count` consecutive values; unpopulated addresses read as 0
    pub fn read_range(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        address: ModbusAddress,
        count: u16,
    ) -> ModbusResult<Vec<ModbusValue>> {
        self.with_block(slave_id, kind, |block| block.read_range(address, count))
    }

    /// Write consecutive values atomically
    pub fn write_range(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        address: ModbusAddress,
        values: &[ModbusValue],
    ) -> ModbusResult<()> {
        let stored = self.with_block(slave_id, kind, |block| block.write_range(address, values))?;
        for (i, value) in stored.into_iter().enumerate() {
            self.notify(slave_id, kind, address + i as u16, value);
        }
        Ok(())
    }

    /// Read `count` values at a wire address
    ///
    /// The address is translated and read under one block lock. Fails with
    /// `OutOfRange` when the range leaves `start..start + size`.
    pub fn read_wire(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        address: ModbusAddress,
        count: u16,
    ) -> ModbusResult<Vec<ModbusValue>> {
        self.with_block(slave_id, kind, |block| {
            let offset = wire_offset_or_err(block, address, count)?;
            block.read_range(offset, count)
        })
    }

    /// Write consecutive values at a wire address atomically
    ///
    /// Translation and write happen under one block lock.
    pub fn write_wire(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        address: ModbusAddress,
        values: &[ModbusValue],
    ) -> ModbusResult<()> {
        let (offset, stored) = self.with_block(slave_id, kind, |block| {
            let offset = wire_offset_or_err(block, address, values.len() as u16)?;
            Ok((offset, block.write_range(offset, values)?))
        })?;
        for (i, value) in stored.into_iter().enumerate() {
            self.notify(slave_id, kind, offset + i as u16, value);
        }
        Ok(())
    }

    /// Replace a populated value with the one `source` reports, if different
    ///
    /// `source` runs under the block lock, so a concurrent writer cannot
    /// slip between the comparison and the update. Returns the new value
    /// when it changed.
    pub fn sync_value(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        address: ModbusAddress,
        source: impl FnOnce() -> ModbusResult<ModbusValue>,
    ) -> ModbusResult<Option<ModbusValue>> {
        let changed = self.with_block(slave_id, kind, |block| {
            let current = block.get(address)?;
            let value = kind.normalize(source()?);
            if value == current {
                return Ok(None);
            }
            block.set(address, value).map(Some)
        })?;
        if let Some(value) = changed {
            self.notify(slave_id, kind, address, value);
        }
        Ok(changed)
    }

    /// Stop tracking an address, returning its last value
    pub fn clear_value(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        address: ModbusAddress,
    ) -> ModbusResult<ModbusValue> {
        self.with_block(slave_id, kind, |block| {
            block
                .remove(address)
                .ok_or_else(|| ModbusError::not_found(format!("{} address {}", kind, address)))
        })
    }

    /// Populated offsets of a block in insertion order
    pub fn offsets(&self, slave_id: SlaveId, kind: BlockKind) -> ModbusResult<Vec<ModbusAddress>> {
        self.with_block(slave_id, kind, |block| Ok(block.offsets()))
    }

    /// Populated `(offset, value)` pairs of a block in insertion order
    pub fn entries(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
    ) -> ModbusResult<Vec<(ModbusAddress, ModbusValue)>> {
        self.with_block(slave_id, kind, |block| Ok(block.entries()))
    }

    /// Every slave with populated addresses of `kind`, with those offsets
    pub fn tracked(&self, kind: BlockKind) -> Vec<(SlaveId, Vec<ModbusAddress>)> {
        self.slave_ids()
            .into_iter()
            .filter_map(|slave_id| {
                let offsets = self.offsets(slave_id, kind).ok()?;
                (!offsets.is_empty()).then_some((slave_id, offsets))
            })
            .collect()
    }

    /// Set every populated address of `kind` back to zero, across all slaves
    pub fn reset_kind(&self, kind: BlockKind) -> usize {
        let mut reset = 0;
        for (slave_id, offsets) in self.tracked(kind) {
            for address in offsets {
                if self.set_value(slave_id, kind, address, 0).is_ok() {
                    reset += 1;
                }
            }
        }
        reset
    }

    /// Capture every slave, block and populated address
    pub fn snapshot(&self) -> StoreSnapshot {
        let slaves: Vec<(SlaveId, Arc<SlaveDevice>)> = self
            .slaves
            .read()
            .iter()
            .map(|(&id, slave)| (id, Arc::clone(slave)))
            .collect();

        StoreSnapshot {
            slaves: slaves
                .into_iter()
                .map(|(slave_id, slave)| {
                    let mut blocks: Vec<(BlockKind, SharedBlock)> = slave
                        .blocks
                        .read()
                        .iter()
                        .map(|(&kind, block)| (kind, Arc::clone(block)))
                        .collect();
                    blocks.sort_by_key(|(kind, _)| *kind);
                    SlaveSnapshot {
                        slave_id,
                        blocks: blocks
                            .into_iter()
                            .map(|(_, block)| {
                                let block = block.lock();
                                BlockSnapshot {
                                    kind: block.kind(),
                                    start: block.start(),
                                    size: block.size(),
                                    values: block.entries(),
                                }
                            })
                            .collect(),
                    }
                })
                .collect(),
        }
    }

    /// Replay a snapshot: slaves, then their blocks, then values in order
    ///
    /// The first failure aborts with `Restore`; whatever was applied before
    /// it stays in place.
    pub fn restore(&self, snapshot: &StoreSnapshot) -> ModbusResult<()> {
        let restore_err = |err: ModbusError| ModbusError::restore(err.to_string());
        for slave in &snapshot.slaves {
            self.add_slave(slave.slave_id).map_err(restore_err)?;
            for block in &slave.blocks {
                self.add_block(slave.slave_id, block.kind, block.start, block.size)
                    .map_err(restore_err)?;
                for &(address, value) in &block.values {
                    self.set_value(slave.slave_id, block.kind, address, value)
                        .map_err(restore_err)?;
                }
            }
        }
        Ok(())
    }

    /// Get store statistics
    pub fn get_stats(&self) -> RegisterStoreStats {
        let snapshot = self.snapshot();
        RegisterStoreStats {
            slaves_count: snapshot.slaves.len(),
            blocks_count: snapshot.slaves.iter().map(|s| s.blocks.len()).sum(),
            tracked_addresses: snapshot
                .slaves
                .iter()
                .flat_map(|s| s.blocks.iter())
                .map(|b| b.values.len())
                .sum(),
        }
    }
}

impl Default for RegisterStore {
    fn default() -> Self {
        Self::new()
    }
}
