//! # State file
//!
//! The simulator can persist its active address space as JSON and rebuild
//! it on the next run:
//!
//! ```json
//! {
//!   "active_server": "tcp",
//!   "port": "5440",
//!   "slaves_list": [1, 2, 3],
//!   "slaves_memory": [[1, "HoldingRegister", [10, 20, 30]]]
//! }
//! ```
//!
//! Memory entries are replayed with append semantics, so value `i` of an
//! entry lands at offset `i` of a fresh block.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::StateConfig;
use crate::engine::TransportKind;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{BlockKind, ModbusValue, SlaveId};
use crate::simulator::Simulator;

const REQUIRED_KEYS: [&str; 4] = ["active_server", "port", "slaves_list", "slaves_memory"];

/// Saved simulation state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationState {
    pub active_server: TransportKind,
    /// TCP port number or serial device
    pub port: String,
    pub slaves_list: Vec<SlaveId>,
    pub slaves_memory: Vec<(SlaveId, BlockKind, Vec<ModbusValue>)>,
}

impl SimulationState {
    /// Capture the active address space of a simulator
    pub fn capture(simulator: &Simulator) -> Self {
        let space = simulator.active_space();
        let slaves_list = space.shadow().slave_ids();

        let mut slaves_memory = Vec::new();
        for &slave_id in &slaves_list {
            for kind in BlockKind::ALL {
                let Ok(entries) = space.shadow().entries(slave_id, kind) else {
                    continue;
                };
                if !entries.is_empty() {
                    let values = entries.into_iter().map(|(_, value)| value).collect();
                    slaves_memory.push((slave_id, kind, values));
                }
            }
        }

        Self {
            active_server: space.transport(),
            port: simulator.port(),
            slaves_list,
            slaves_memory,
        }
    }

    pub fn from_json(content: &str) -> ModbusResult<Self> {
        let value: serde_json::Value =
            serde_json::from_str(content).map_err(|e| ModbusError::restore(e.to_string()))?;

        let object = value
            .as_object()
            .ok_or_else(|| ModbusError::restore("State is not a JSON object"))?;
        if let Some(key) = REQUIRED_KEYS.iter().find(|key| !object.contains_key(**key)) {
            return Err(ModbusError::restore(format!("JSON Key Missing: {}", key)));
        }

        serde_json::from_value(value).map_err(|e| ModbusError::restore(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::restore(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> ModbusResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Rebuild this state on a stopped simulator
    ///
    /// Slaves are added in consecutive runs. Work applied before a failure
    /// is kept.
    pub fn apply(&self, simulator: &Simulator) -> ModbusResult<()> {
        if self.slaves_list.is_empty() {
            return Ok(());
        }

        simulator
            .select_transport(self.active_server)
            .and_then(|_| simulator.set_port(&self.port))
            .map_err(|e| ModbusError::restore(e.to_string()))?;

        for (start, count) in slave_runs(&self.slaves_list) {
            simulator
                .add_slaves(start as u32, count)
                .map_err(|e| ModbusError::restore(e.to_string()))?;
        }

        for (slave_id, kind, values) in &self.slaves_memory {
            simulator
                .append_values(*slave_id, *kind, values)
                .map_err(|e| {
                    ModbusError::restore(format!("slave {} {}: {}", slave_id, kind, e))
                })?;
        }

        info!(
            "Restored {} slaves on {} port {}",
            self.slaves_list.len(),
            self.active_server,
            self.port
        );
        Ok(())
    }
}

/// Split a slave list into `(first, count)` runs of consecutive ids
fn slave_runs(slaves: &[SlaveId]) -> Vec<(SlaveId, u32)> {
    let mut runs: Vec<(SlaveId, u32)> = Vec::new();
    for &slave_id in slaves {
        match runs.last_mut() {
            Some((first, count)) if *first as u32 + *count == slave_id as u32 => *count += 1,
            _ => runs.push((slave_id, 1)),
        }
    }
    runs
}

impl Simulator {
    /// Write the active address space to a state file
    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> ModbusResult<()> {
        SimulationState::capture(self).save(path)
    }

    /// Load and apply a state file
    pub fn load_state<P: AsRef<Path>>(&self, path: P) -> ModbusResult<()> {
        SimulationState::load(path)?.apply(self)
    }

    /// Restore the configured state file, if enabled and present
    ///
    /// Returns whether a state was applied. Failures are logged and the
    /// simulator keeps whatever was restored before them.
    pub fn restore_saved_state(&self, config: &StateConfig) -> bool {
        if !config.load_state || !config.file.is_file() {
            return false;
        }
        match self.load_state(&config.file) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;

    async fn simulator() -> Simulator {
        let mut config = SimulatorConfig::default();
        config.logging.enabled = false;
        Simulator::new(config).await.unwrap()
    }

    #[test]
    fn test_slave_runs() {
        assert_eq!(slave_runs(&[1, 2, 3, 7, 8, 10]), vec![(1, 3), (7, 2), (10, 1)]);
        assert_eq!(slave_runs(&[5]), vec![(5, 1)]);
        assert!(slave_runs(&[]).is_empty());
    }

    #[test]
    fn test_missing_key_and_malformed_json() {
        let partial = r#"{"active_server": "tcp", "port": "5440", "slaves_list": []}"#;
        let err = SimulationState::from_json(partial).unwrap_err();
        assert!(matches!(err, ModbusError::Restore { .. }));
        assert!(err.to_string().contains("JSON Key Missing: slaves_memory"));

        assert!(matches!(
            SimulationState::from_json("{not json"),
            Err(ModbusError::Restore { .. })
        ));
        assert!(matches!(
            SimulationState::from_json("[1, 2]"),
            Err(ModbusError::Restore { .. })
        ));
    }

    #[test]
    fn test_legacy_block_names() {
        let state = SimulationState::from_json(
            r#"{"active_server": "rtu", "port": "/dev/ttyUSB0", "slaves_list": [1],
                "slaves_memory": [[1, "Fun_Code03", [4, 5]]]}"#,
        )
        .unwrap();
        assert_eq!(state.active_server, TransportKind::Rtu);
        assert_eq!(state.slaves_memory, vec![(1, BlockKind::InputRegister, vec![4, 5])]);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slaves.json");

        let source = simulator().await;
        source.add_slaves(1, 3).unwrap();
        source.add_slaves(7, 1).unwrap();
        source.add_entries(1, BlockKind::HoldingRegister, 3, 0).unwrap();
        source.set_value(1, BlockKind::HoldingRegister, 1, 20).unwrap();
        source.add_entries(7, BlockKind::Coil, 2, 1).unwrap();
        source.save_state(&path).unwrap();

        let saved = SimulationState::load(&path).unwrap();
        assert_eq!(saved.slaves_list, vec![1, 2, 3, 7]);
        assert_eq!(saved.port, "5440");

        let target = simulator().await;
        target.load_state(&path).unwrap();
        assert_eq!(target.slaves(), vec![1, 2, 3, 7]);
        assert_eq!(
            target.active_space().live().read_range(1, BlockKind::HoldingRegister, 0, 3).unwrap(),
            vec![0, 20, 0]
        );
        assert_eq!(target.get_value(7, BlockKind::Coil, 1).unwrap(), 1);
        assert_eq!(SimulationState::capture(&target), saved);
    }

    #[tokio::test]
    async fn test_partial_restore_keeps_applied_work() {
        let state = SimulationState {
            active_server: TransportKind::Tcp,
            port: "5020".to_string(),
            slaves_list: vec![1],
            slaves_memory: vec![
                (1, BlockKind::Coil, vec![1, 0]),
                (2, BlockKind::Coil, vec![1]),
            ],
        };
        let target = simulator().await;
        assert!(matches!(state.apply(&target), Err(ModbusError::Restore { .. })));
        assert_eq!(target.port(), "5020");
        assert_eq!(target.get_value(1, BlockKind::Coil, 0).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restore_saved_state_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let target = simulator().await;
        let config = StateConfig {
            load_state: true,
            file: dir.path().join("missing.json"),
        };
        assert!(!target.restore_saved_state(&config));

        std::fs::write(&config.file, "{}").unwrap();
        assert!(!target.restore_saved_state(&config));

        std::fs::write(
            &config.file,
            r#"{"active_server": "tcp", "port": "5440", "slaves_list": [4], "slaves_memory": []}"#,
        )
        .unwrap();
        assert!(!target.restore_saved_state(&StateConfig {
            load_state: false,
            ..config.clone()
        }));
        assert!(target.restore_saved_state(&config));
        assert_eq!(target.slaves(), vec![4]);
    }
}
