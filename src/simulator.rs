//! # Simulator
//!
//! [`Simulator`] ties the pieces together the way an operator drives them:
//! one address space per transport, a simulation scheduler for each, a
//! reconciliation job over both, and the server settings used to build
//! engines.
//!
//! ```rust,no_run
//! use modbus_simu::{BlockKind, Simulator, SimulatorConfig};
//!
//! # async fn run() -> modbus_simu::ModbusResult<()> {
//! let simulator = Simulator::new(SimulatorConfig::default()).await?;
//! simulator.add_slaves(1, 2)?;
//! simulator.add_entries(1, BlockKind::HoldingRegister, 10, 0)?;
//! simulator.start_server().await?;
//! simulator.start_stop_simulation(true).await;
//! # Ok(())
//! # }
//! ```

use log::{info, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::address_space::AddressSpace;
use crate::config::{BlockConfig, SimulatorConfig};
use crate::engine::{
    create_engine, EngineKind, ProtocolEngine, SerialSettings, TcpSettings, TransportConfig,
    TransportKind,
};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{
    validate_slave_id, BlockKind, ModbusAddress, ModbusValue, SlaveId, MAX_SLAVE_ID,
};
use crate::reconcile::ReconciliationJob;
use crate::register_store::ValueChange;
use crate::simulation::{SimulationScheduler, ValueGroup};

/// Server description used to build engines
#[derive(Debug, Clone)]
struct ServerSettings {
    active: TransportKind,
    tcp: TcpSettings,
    serial: SerialSettings,
    /// Transports whose engine must be rebuilt on the next start
    tcp_dirty: bool,
    rtu_dirty: bool,
}

impl ServerSettings {
    fn mark_dirty(&mut self, kind: TransportKind) {
        match kind {
            TransportKind::Tcp => self.tcp_dirty = true,
            TransportKind::Rtu => self.rtu_dirty = true,
        }
    }

    fn take_dirty(&mut self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Tcp => std::mem::take(&mut self.tcp_dirty),
            TransportKind::Rtu => std::mem::take(&mut self.rtu_dirty),
        }
    }

    fn transport_config(&self, kind: TransportKind) -> TransportConfig {
        match kind {
            TransportKind::Tcp => TransportConfig::Tcp(self.tcp.clone()),
            TransportKind::Rtu => TransportConfig::Rtu(self.serial.clone()),
        }
    }
}

/// Slave simulator over a TCP and an RTU address space
pub struct Simulator {
    engine_kind: EngineKind,
    block: BlockConfig,
    settings: Mutex<ServerSettings>,
    tcp: Arc<AddressSpace>,
    rtu: Arc<AddressSpace>,
    tcp_simulation: SimulationScheduler,
    rtu_simulation: SimulationScheduler,
    reconciliation: ReconciliationJob,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Simulator {
    /// Build a stopped simulator with no slaves
    pub async fn new(config: SimulatorConfig) -> ModbusResult<Self> {
        config.validate()?;

        let tcp = Arc::new(AddressSpace::new(TransportKind::Tcp));
        let rtu = Arc::new(AddressSpace::new(TransportKind::Rtu));
        let simulator = Self {
            engine_kind: config.engine,
            block: config.block.clone(),
            settings: Mutex::new(ServerSettings {
                active: config.transport,
                tcp: config.tcp.clone(),
                serial: config.serial.clone(),
                tcp_dirty: false,
                rtu_dirty: false,
            }),
            tcp_simulation: SimulationScheduler::new(Arc::clone(&tcp)),
            rtu_simulation: SimulationScheduler::new(Arc::clone(&rtu)),
            reconciliation: ReconciliationJob::new(
                vec![Arc::clone(&tcp), Arc::clone(&rtu)],
                config.sync.interval(),
            ),
            tcp,
            rtu,
            lifecycle: tokio::sync::Mutex::new(()),
        };

        let sim = &config.simulation;
        for scheduler in [&simulator.tcp_simulation, &simulator.rtu_simulation] {
            scheduler.set_interval(sim.interval()).await?;
            scheduler
                .change_range(ValueGroup::Bits, Some(sim.bin_min), Some(sim.bin_max))
                .await?;
            scheduler
                .change_range(ValueGroup::Registers, Some(sim.reg_min), Some(sim.reg_max))
                .await?;
        }

        info!(
            "Simulator ready ({} engine, {} transport)",
            simulator.engine_kind,
            simulator.active_transport()
        );
        Ok(simulator)
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine_kind
    }

    pub fn active_transport(&self) -> TransportKind {
        self.settings.lock().active
    }

    pub fn space(&self, kind: TransportKind) -> &Arc<AddressSpace> {
        match kind {
            TransportKind::Tcp => &self.tcp,
            TransportKind::Rtu => &self.rtu,
        }
    }

    pub fn active_space(&self) -> &Arc<AddressSpace> {
        self.space(self.active_transport())
    }

    pub fn scheduler(&self, kind: TransportKind) -> &SimulationScheduler {
        match kind {
            TransportKind::Tcp => &self.tcp_simulation,
            TransportKind::Rtu => &self.rtu_simulation,
        }
    }

    fn active_scheduler(&self) -> &SimulationScheduler {
        self.scheduler(self.active_transport())
    }

    pub fn reconciliation(&self) -> &ReconciliationJob {
        &self.reconciliation
    }

    /// Switch the active transport; only while the server is stopped
    pub fn select_transport(&self, kind: TransportKind) -> ModbusResult<()> {
        if self.is_server_running() {
            return Err(ModbusError::protocol(
                "Stop the server before switching transport",
            ));
        }
        let mut settings = self.settings.lock();
        if settings.active != kind {
            info!("Active transport: {}", kind);
            settings.active = kind;
        }
        Ok(())
    }

    /// Port of the active transport: TCP port number or serial device
    pub fn port(&self) -> String {
        let settings = self.settings.lock();
        match settings.active {
            TransportKind::Tcp => settings.tcp.port.to_string(),
            TransportKind::Rtu => settings.serial.port.clone(),
        }
    }

    /// Set the port of the active transport
    pub fn set_port(&self, port: &str) -> ModbusResult<()> {
        let mut settings = self.settings.lock();
        match settings.active {
            TransportKind::Tcp => {
                settings.tcp.port = port.trim().parse().map_err(|_| {
                    ModbusError::invalid_data(format!("Invalid TCP port: {}", port))
                })?;
            }
            TransportKind::Rtu => {
                if port.is_empty() {
                    return Err(ModbusError::invalid_data("Serial port must not be empty"));
                }
                settings.serial.port = port.to_string();
            }
        }
        let active = settings.active;
        settings.mark_dirty(active);
        Ok(())
    }

    pub fn set_tcp_ip(&self, ip: &str) -> ModbusResult<()> {
        let mut settings = self.settings.lock();
        let tcp = TcpSettings {
            ip: ip.to_string(),
            ..settings.tcp.clone()
        };
        tcp.validate()?;
        settings.tcp = tcp;
        settings.mark_dirty(TransportKind::Tcp);
        Ok(())
    }

    pub fn set_serial_settings(&self, serial: SerialSettings) -> ModbusResult<()> {
        serial.validate()?;
        let mut settings = self.settings.lock();
        settings.serial = serial;
        settings.mark_dirty(TransportKind::Rtu);
        Ok(())
    }

    pub fn transport_config(&self, kind: TransportKind) -> TransportConfig {
        self.settings.lock().transport_config(kind)
    }

    pub fn is_server_running(&self) -> bool {
        self.active_space().running_engine().is_some()
    }

    /// Bound address of the running TCP engine
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active_space()
            .running_engine()
            .and_then(|engine| engine.local_addr())
    }

    /// Start serving the active address space
    ///
    /// The engine is rebuilt when none exists yet or its settings changed.
    /// A failure leaves the server stopped.
    pub async fn start_server(&self) -> ModbusResult<()> {
        let _guard = self.lifecycle.lock().await;
        let kind = self.active_transport();
        let space = self.space(kind);

        let (dirty, transport) = {
            let mut settings = self.settings.lock();
            (settings.take_dirty(kind), settings.transport_config(kind))
        };

        let engine = match space.engine() {
            Some(engine) if engine.is_running() && !dirty => return Ok(()),
            Some(engine) if !dirty => engine,
            current => {
                if let Some(old) = current {
                    old.stop().await?;
                }
                let engine: Arc<dyn ProtocolEngine> = Arc::from(create_engine(
                    self.engine_kind,
                    transport,
                    Arc::clone(space.live()),
                ));
                space.replace_engine(Some(Arc::clone(&engine)));
                engine
            }
        };

        if let Err(e) = engine.start().await {
            warn!("Server start failed: {}", e);
            // Settings are retried on the next start
            self.settings.lock().mark_dirty(kind);
            return Err(e);
        }
        self.reconciliation.start().await;
        info!("Server started on {}", engine.transport().describe());
        Ok(())
    }

    /// Stop simulation and the active server
    pub async fn stop_server(&self) -> ModbusResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.active_scheduler().start_stop(false).await;
        if let Some(engine) = self.active_space().engine() {
            engine.stop().await?;
            info!("Server stopped");
        }
        Ok(())
    }

    /// Create `count` consecutive slaves from `start`, each with all four blocks
    pub fn add_slaves(&self, start: u32, count: u32) -> ModbusResult<Vec<SlaveId>> {
        let first = validate_slave_id(start)?;
        if count == 0 {
            return Err(ModbusError::invalid_address(start, "slave count must be positive"));
        }
        let last = start.saturating_add(count - 1);
        if last > MAX_SLAVE_ID as u32 {
            return Err(ModbusError::invalid_address(
                last,
                format!("beyond supported modbus slave device address ({})", MAX_SLAVE_ID),
            ));
        }

        let space = self.active_space();
        let ids: Vec<SlaveId> = (first..=last as SlaveId).collect();
        if let Some(&existing) = ids.iter().find(|&&id| space.shadow().contains_slave(id)) {
            return Err(ModbusError::duplicate_slave(existing));
        }

        for &slave_id in &ids {
            space.add_slave(slave_id)?;
            for kind in BlockKind::ALL {
                space.add_block(slave_id, kind, self.block.start, self.block.size)?;
            }
        }
        info!("Added slaves {}-{} on {}", first, last, space.transport());
        Ok(ids)
    }

    pub fn remove_slave(&self, slave_id: SlaveId) -> ModbusResult<()> {
        self.active_space().remove_slave(slave_id)?;
        info!("Removed slave {}", slave_id);
        Ok(())
    }

    /// Slaves of the active address space
    pub fn slaves(&self) -> Vec<SlaveId> {
        self.active_space().shadow().slave_ids()
    }

    /// Track the next `count` offsets of a block with `value`
    ///
    /// Entries append after the highest tracked offset. Fails with
    /// `OutOfRange`, adding nothing, when they would not fit.
    pub fn add_entries(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        count: u16,
        value: ModbusValue,
    ) -> ModbusResult<Vec<ModbusAddress>> {
        self.append_values(slave_id, kind, &vec![value; count as usize])
    }

    /// Track one new offset per value, in order, after the highest tracked one
    pub fn append_values(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        values: &[ModbusValue],
    ) -> ModbusResult<Vec<ModbusAddress>> {
        let space = self.active_space();
        let (_, size) = space.shadow().block_layout(slave_id, kind)?;
        let next = space
            .shadow()
            .offsets(slave_id, kind)?
            .into_iter()
            .max()
            .map_or(0u32, |max| max as u32 + 1);

        let end = next + values.len() as u32;
        if end > size as u32 {
            return Err(ModbusError::out_of_range(kind, end - 1, size));
        }

        let mut offsets = Vec::with_capacity(values.len());
        for (offset, &value) in (next..end).zip(values) {
            let offset = offset as ModbusAddress;
            space.set_value(slave_id, kind, offset, value)?;
            offsets.push(offset);
        }
        Ok(offsets)
    }

    pub fn remove_entries(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        offsets: &[ModbusAddress],
    ) -> ModbusResult<usize> {
        self.active_space().remove_entries(slave_id, kind, offsets)
    }

    pub fn set_value(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        offset: ModbusAddress,
        value: ModbusValue,
    ) -> ModbusResult<()> {
        self.active_space().set_value(slave_id, kind, offset, value)
    }

    pub fn get_value(
        &self,
        slave_id: SlaveId,
        kind: BlockKind,
        offset: ModbusAddress,
    ) -> ModbusResult<ModbusValue> {
        self.active_space().get_value(slave_id, kind, offset)
    }

    pub fn is_simulating(&self) -> bool {
        self.active_scheduler().is_running()
    }

    pub async fn start_stop_simulation(&self, running: bool) {
        self.active_scheduler().start_stop(running).await;
    }

    /// Change the simulation interval of both address spaces
    pub async fn change_simulation_settings(&self, interval: Duration) -> ModbusResult<()> {
        self.tcp_simulation.set_interval(interval).await?;
        self.rtu_simulation.set_interval(interval).await
    }

    pub async fn change_range(
        &self,
        group: ValueGroup,
        minval: Option<ModbusValue>,
        maxval: Option<ModbusValue>,
    ) -> ModbusResult<()> {
        self.tcp_simulation.change_range(group, minval, maxval).await?;
        self.rtu_simulation.change_range(group, minval, maxval).await
    }

    /// Zero tracked values of the active space; refused while simulating
    pub async fn reset_simulation(&self) -> ModbusResult<usize> {
        self.active_scheduler().reset().await
    }

    /// Value changes of the active shadow store
    pub fn subscribe(&self) -> broadcast::Receiver<ValueChange> {
        self.active_space().shadow().subscribe()
    }

    /// Stop everything this simulator started
    pub async fn shutdown(&self) -> ModbusResult<()> {
        self.tcp_simulation.start_stop(false).await;
        self.rtu_simulation.start_stop(false).await;
        self.reconciliation.stop().await;

        let _guard = self.lifecycle.lock().await;
        for space in [&self.tcp, &self.rtu] {
            if let Some(engine) = space.replace_engine(None) {
                engine.stop().await?;
            }
        }
        info!("Simulator shut down");
        Ok(())
    }
}
