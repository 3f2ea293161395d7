/// Utility helpers: packet formatting, timing and test logging

use log::debug;
use std::time::{Duration, Instant};

/// Timer for measuring how long a named operation took
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop the timer and log the duration at debug level
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!(
            "{} completed in {}",
            self.operation_name,
            format::format_duration(duration)
        );
        duration
    }
}

/// Formatting and display utilities
pub mod format {
    use std::time::Duration;

    /// Format bytes as space separated upper-case hex
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| hex::encode_upper([*b]))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}

/// Log a raw frame with its direction (`recv`/`send`) at debug level
pub fn log_packet(protocol: &str, direction: &str, peer: &str, data: &[u8]) {
    debug!(
        "[MODBUS-{}] {} {} {}",
        protocol,
        direction,
        peer,
        format::bytes_to_hex(data)
    );
}

/// Logging utilities
pub mod logging {
    /// Initialize a debug logger for tests; repeated calls are harmless
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}
