/// Value simulation
///
/// One [`SimulationTask`] per block kind periodically overwrites every
/// tracked address of its kind, across all slaves of an address space, with
/// a uniform random value in `[minval, maxval]`. The four tasks are driven
/// together by a [`SimulationScheduler`].
///
/// A tick copies its parameters once before writing, so every value of a
/// tick comes from one range and `reinit` applies from the next tick.

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::address_space::AddressSpace;
use crate::error::{ModbusError, ModbusResult};
use crate::periodic::PeriodicTask;
use crate::protocol::{BlockKind, ModbusValue};

/// Default simulation interval
pub const DEFAULT_SIMULATION_INTERVAL: Duration = Duration::from_secs(1);

/// Parameters of one simulation task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationParams {
    pub minval: ModbusValue,
    pub maxval: ModbusValue,
    pub interval: Duration,
}

impl SimulationParams {
    /// Full value range of the kind, one second interval
    pub fn default_for(kind: BlockKind) -> Self {
        Self {
            minval: 0,
            maxval: kind.max_value(),
            interval: DEFAULT_SIMULATION_INTERVAL,
        }
    }
}

/// Which tasks a range change applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueGroup {
    /// Coils and discrete inputs
    Bits,
    /// Holding and input registers
    Registers,
}

impl ValueGroup {
    pub fn contains(self, kind: BlockKind) -> bool {
        match self {
            ValueGroup::Bits => kind.is_bit(),
            ValueGroup::Registers => !kind.is_bit(),
        }
    }
}

/// Periodic random writer for one block kind
pub struct SimulationTask {
    kind: BlockKind,
    space: Arc<AddressSpace>,
    params: Arc<Mutex<SimulationParams>>,
    runner: tokio::sync::Mutex<Option<PeriodicTask>>,
    running: AtomicBool,
}

impl SimulationTask {
    pub fn new(kind: BlockKind, space: Arc<AddressSpace>) -> Self {
        Self {
            kind,
            space,
            params: Arc::new(Mutex::new(SimulationParams::default_for(kind))),
            runner: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn params(&self) -> SimulationParams {
        *self.params.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one tick now, returning how many addresses were written
    pub fn run_once(&self) -> usize {
        tick(self.kind, &self.space, &self.params)
    }

    fn spawn(&self, interval: Duration) -> PeriodicTask {
        let kind = self.kind;
        let space = Arc::clone(&self.space);
        let params = Arc::clone(&self.params);
        PeriodicTask::spawn(
            format!("simulation-{}-{}", space.transport(), kind),
            interval,
            move || {
                tick(kind, &space, &params);
            },
        )
    }

    /// Start or stop the loop; a no-op when already in the requested state
    pub async fn start_stop(&self, running: bool) {
        let mut runner = self.runner.lock().await;
        match (running, runner.take()) {
            (true, None) => {
                let interval = self.params.lock().interval;
                *runner = Some(self.spawn(interval));
                self.running.store(true, Ordering::SeqCst);
                debug!("{} simulation started ({:?})", self.kind, interval);
            }
            (false, Some(task)) => {
                task.stop().await;
                self.running.store(false, Ordering::SeqCst);
                debug!("{} simulation stopped", self.kind);
            }
            (_, current) => *runner = current,
        }
    }

    /// Update the provided parameters
    ///
    /// Fails with `InvalidData` when the result would have `minval > maxval`,
    /// a bound above what the kind can hold, or a zero interval. A new
    /// interval restarts a running loop.
    pub async fn reinit(
        &self,
        minval: Option<ModbusValue>,
        maxval: Option<ModbusValue>,
        interval: Option<Duration>,
    ) -> ModbusResult<()> {
        let interval_changed = {
            let mut params = self.params.lock();
            let next = SimulationParams {
                minval: minval.unwrap_or(params.minval),
                maxval: maxval.unwrap_or(params.maxval),
                interval: interval.unwrap_or(params.interval),
            };

            if next.minval > next.maxval {
                return Err(ModbusError::invalid_data(format!(
                    "{} simulation minval {} is greater than maxval {}",
                    self.kind, next.minval, next.maxval
                )));
            }
            if next.maxval > self.kind.max_value() {
                return Err(ModbusError::invalid_data(format!(
                    "{} simulation maxval {} exceeds {}",
                    self.kind,
                    next.maxval,
                    self.kind.max_value()
                )));
            }
            if next.interval.is_zero() {
                return Err(ModbusError::invalid_data("Simulation interval must be positive"));
            }

            let changed = next.interval != params.interval;
            *params = next;
            changed
        };

        if interval_changed {
            let mut runner = self.runner.lock().await;
            if let Some(task) = runner.take() {
                task.stop().await;
                let interval = self.params.lock().interval;
                *runner = Some(self.spawn(interval));
            }
        }
        Ok(())
    }

    /// Zero every tracked address of the kind; refused while running
    pub async fn reset(&self) -> ModbusResult<usize> {
        let runner = self.runner.lock().await;
        if runner.is_some() {
            return Err(ModbusError::protocol(format!(
                "Cannot reset {} values while simulation is running",
                self.kind
            )));
        }

        let mut reset = 0;
        for (slave_id, offsets) in self.space.tracked(self.kind) {
            for offset in offsets {
                match self.space.set_value(slave_id, self.kind, offset, 0) {
                    Ok(()) => reset += 1,
                    Err(e) => debug!(
                        "Skipping reset of slave {} {} {}: {}",
                        slave_id, self.kind, offset, e
                    ),
                }
            }
        }
        Ok(reset)
    }
}

fn tick(kind: BlockKind, space: &AddressSpace, params: &Mutex<SimulationParams>) -> usize {
    let params = *params.lock();
    let mut rng = rand::thread_rng();
    let mut written = 0;

    for (slave_id, offsets) in space.tracked(kind) {
        for offset in offsets {
            let value = rng.gen_range(params.minval..=params.maxval);
            match space.set_value(slave_id, kind, offset, value) {
                Ok(()) => written += 1,
                Err(e) => warn!(
                    "Simulation skipped slave {} {} address {}: {}",
                    slave_id, kind, offset, e
                ),
            }
        }
    }
    written
}

/// The four simulation tasks of one address space
pub struct SimulationScheduler {
    tasks: Vec<SimulationTask>,
}

impl SimulationScheduler {
    pub fn new(space: Arc<AddressSpace>) -> Self {
        Self {
            tasks: BlockKind::ALL
                .iter()
                .map(|&kind| SimulationTask::new(kind, Arc::clone(&space)))
                .collect(),
        }
    }

    pub fn task(&self, kind: BlockKind) -> &SimulationTask {
        // Built from BlockKind::ALL, so every kind is present
        &self.tasks[BlockKind::ALL.iter().position(|&k| k == kind).unwrap_or(0)]
    }

    pub fn tasks(&self) -> &[SimulationTask] {
        &self.tasks
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(SimulationTask::is_running)
    }

    pub async fn start_stop(&self, running: bool) {
        for task in &self.tasks {
            task.start_stop(running).await;
        }
        info!("Simulation {}", if running { "started" } else { "stopped" });
    }

    /// Apply a new interval to every task
    pub async fn set_interval(&self, interval: Duration) -> ModbusResult<()> {
        for task in &self.tasks {
            task.reinit(None, None, Some(interval)).await?;
        }
        Ok(())
    }

    /// Change the value range of a group of tasks
    pub async fn change_range(
        &self,
        group: ValueGroup,
        minval: Option<ModbusValue>,
        maxval: Option<ModbusValue>,
    ) -> ModbusResult<()> {
        for task in self.tasks.iter().filter(|task| group.contains(task.kind())) {
            task.reinit(minval, maxval, None).await?;
        }
        Ok(())
    }

    /// Zero every tracked address; refused while running
    pub async fn reset(&self) -> ModbusResult<usize> {
        if self.is_running() {
            return Err(ModbusError::protocol("Cannot reset values while simulation is running"));
        }
        let mut reset = 0;
        for task in &self.tasks {
            reset += task.reset().await?;
        }
        Ok(reset)
    }

    /// Run one tick of every task now
    pub fn run_once(&self) -> usize {
        self.tasks.iter().map(SimulationTask::run_once).sum()
    }
}
