//! # Logging setup
//!
//! The crate logs through the `log` facade. [`init_logging`] installs a
//! logger built from [`LoggingConfig`]: an `env_logger` console sink and an
//! optional append-only file sink, each with its own level.

use chrono::Local;
use env_logger::{Target, WriteStyle};
use log::{LevelFilter, Log, Metadata, Record};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::error::{ModbusError, ModbusResult};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Level names accepted in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    #[serde(alias = "ERROR")]
    Critical,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Critical => LevelFilter::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Master switch; nothing is installed when false
    pub enabled: bool,
    pub console: bool,
    pub console_level: LogLevel,
    pub file: bool,
    pub file_level: LogLevel,
    pub file_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            console: true,
            console_level: LogLevel::Debug,
            file: false,
            file_level: LogLevel::Debug,
            file_path: PathBuf::from("modbus.log"),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> ModbusResult<()> {
        if self.file && self.file_path.as_os_str().is_empty() {
            return Err(ModbusError::configuration(
                "File logging enabled without a file path",
            ));
        }
        Ok(())
    }

    /// Most verbose level any enabled sink wants
    pub fn max_level(&self) -> LevelFilter {
        if !self.enabled {
            return LevelFilter::Off;
        }
        let console = if self.console {
            self.console_level.to_level_filter()
        } else {
            LevelFilter::Off
        };
        let file = if self.file {
            self.file_level.to_level_filter()
        } else {
            LevelFilter::Off
        };
        console.max(file)
    }
}

/// Logger writing each record to the console and file sinks
///
/// Both sinks are `env_logger` loggers with their own level filter; the
/// file sink pipes into the log file opened in append mode.
pub struct TeeLogger {
    console: Option<env_logger::Logger>,
    file: Option<env_logger::Logger>,
}

impl TeeLogger {
    pub fn new(config: &LoggingConfig) -> ModbusResult<Self> {
        config.validate()?;

        let console = (config.enabled && config.console).then(|| {
            env_logger::Builder::new()
                .filter_level(config.console_level.to_level_filter())
                .format(|buf, record| {
                    writeln!(
                        buf,
                        "{} - {} - {}",
                        Local::now().format(TIMESTAMP_FORMAT),
                        record.level(),
                        record.args()
                    )
                })
                .build()
        });

        let file = if config.enabled && config.file {
            let handle = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.file_path)
                .map_err(|e| {
                    ModbusError::configuration(format!(
                        "Cannot open log file {}: {}",
                        config.file_path.display(),
                        e
                    ))
                })?;
            let logger = env_logger::Builder::new()
                .filter_level(config.file_level.to_level_filter())
                .write_style(WriteStyle::Never)
                .target(Target::Pipe(Box::new(handle)))
                .format(|buf, record| {
                    writeln!(
                        buf,
                        "{} - {} - {} - {}",
                        Local::now().format(TIMESTAMP_FORMAT),
                        record.target(),
                        record.level(),
                        record.args()
                    )
                })
                .build();
            Some(logger)
        } else {
            None
        };

        Ok(Self { console, file })
    }

    fn sinks(&self) -> impl Iterator<Item = &env_logger::Logger> {
        self.console.iter().chain(self.file.iter())
    }
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sinks().any(|sink| sink.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        for sink in self.sinks() {
            if sink.matches(record) {
                sink.log(record);
            }
        }
    }

    fn flush(&self) {
        for sink in self.sinks() {
            sink.flush();
        }
    }
}

/// Install the global logger
///
/// Fails if a logger is already installed.
pub fn init_logging(config: &LoggingConfig) -> ModbusResult<()> {
    if !config.enabled {
        log::set_max_level(LevelFilter::Off);
        return Ok(());
    }
    let logger = TeeLogger::new(config)?;
    log::set_boxed_logger(Box::new(logger))
        .map_err(|_| ModbusError::configuration("A logger is already installed"))?;
    log::set_max_level(config.max_level());
    Ok(())
}
