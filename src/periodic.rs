/// Periodic background tasks
///
/// A [`PeriodicTask`] runs a closure on a fixed interval in its own tokio
/// task. A deadline missed because the previous tick ran long is skipped
/// rather than queued, and at most one tick is ever in flight. Stopping
/// waits for the in-flight tick, so no tick runs after `stop` returns.

use log::{debug, error};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::utils::OperationTimer;

/// Handle to a running periodic task
pub struct PeriodicTask {
    name: String,
    period: Duration,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period`; the first tick fires one period from now
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let period = period.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!("Periodic task '{}' started ({:?})", task_name, period);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {}
                }

                let timer = OperationTimer::start(&task_name);
                tick();
                timer.stop();
            }

            debug!("Periodic task '{}' stopped", task_name);
        });

        Self {
            name,
            period,
            shutdown_tx,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Signal the task and wait for it to finish
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            error!("Periodic task '{}' failed: {}", self.name, e);
        }
    }
}
