/// Reconciliation of client writes
///
/// Real Modbus clients write into the live store behind the simulator's
/// back. The [`ReconciliationJob`] periodically reads every tracked address
/// through the running engine and folds differing values into the shadow
/// store, which emits the usual value-change notifications.
///
/// External values are taken as-is, even outside the simulation range; the
/// next simulation tick overwrites them.

use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::address_space::AddressSpace;
use crate::periodic::PeriodicTask;
use crate::protocol::BlockKind;

/// Default reconciliation interval
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Fold live values of one address space into its shadow
///
/// Returns the number of addresses updated. Does nothing unless an engine
/// is present and running.
pub fn reconcile(space: &AddressSpace) -> usize {
    let Some(engine) = space.running_engine() else {
        return 0;
    };

    let mut updated = 0;
    for kind in BlockKind::ALL {
        for (slave_id, offsets) in space.tracked(kind) {
            for offset in offsets {
                let synced = space.shadow().sync_value(slave_id, kind, offset, || {
                    let values = engine.get_values(slave_id, kind, offset, 1)?;
                    Ok(values.first().copied().unwrap_or_default())
                });
                match synced {
                    Ok(Some(value)) => {
                        debug!(
                            "External write on slave {} {} address {}: {}",
                            slave_id, kind, offset, value
                        );
                        updated += 1;
                    }
                    Ok(None) => {}
                    Err(e) => debug!(
                        "Reconciliation skipped slave {} {} address {}: {}",
                        slave_id, kind, offset, e
                    ),
                }
            }
        }
    }
    updated
}

/// Periodic reconciliation over a set of address spaces
pub struct ReconciliationJob {
    spaces: Vec<Arc<AddressSpace>>,
    interval: Duration,
    runner: tokio::sync::Mutex<Option<PeriodicTask>>,
    running: AtomicBool,
}

impl ReconciliationJob {
    pub fn new(spaces: Vec<Arc<AddressSpace>>, interval: Duration) -> Self {
        Self {
            spaces,
            interval,
            runner: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one reconciliation pass now
    pub fn run_once(&self) -> usize {
        self.spaces.iter().map(|space| reconcile(space)).sum()
    }

    /// Start the periodic job; a no-op when already running
    pub async fn start(&self) {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return;
        }
        let spaces = self.spaces.clone();
        *runner = Some(PeriodicTask::spawn("reconciliation", self.interval, move || {
            for space in &spaces {
                reconcile(space);
            }
        }));
        self.running.store(true, Ordering::SeqCst);
        info!("Reconciliation job started ({:?})", self.interval);
    }

    /// Stop the job and wait for an in-flight pass
    pub async fn stop(&self) {
        let mut runner = self.runner.lock().await;
        if let Some(task) = runner.take() {
            task.stop().await;
            self.running.store(false, Ordering::SeqCst);
            info!("Reconciliation job stopped");
        }
    }
}
