/// Serial line settings for the RTU transport

use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilder, SerialStream, StopBits};

use crate::error::{ModbusError, ModbusResult};

/// Serial port parameters
///
/// Timeouts are in seconds. `dsrdtr` is accepted for compatibility with
/// saved settings but no backend can honour it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baudrate: u32,
    /// Data bits, 5-8
    pub bytesize: u8,
    /// `N`, `E` or `O`
    pub parity: String,
    /// 1 or 2
    pub stopbits: f32,
    pub xonxoff: bool,
    pub rtscts: bool,
    pub dsrdtr: bool,
    pub timeout: f64,
    pub writetimeout: f64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyp0".to_string(),
            baudrate: 9600,
            bytesize: 8,
            parity: "N".to_string(),
            stopbits: 1.0,
            xonxoff: false,
            rtscts: false,
            dsrdtr: false,
            timeout: 2.0,
            writetimeout: 2.0,
        }
    }
}

impl SerialSettings {
    /// Check every field without touching the device
    pub fn validate(&self) -> ModbusResult<()> {
        if self.port.is_empty() {
            return Err(ModbusError::configuration("Serial port name is empty"));
        }
        if self.baudrate == 0 {
            return Err(ModbusError::configuration("Baud rate must be positive"));
        }
        self.data_bits()?;
        self.parity()?;
        self.stop_bits()?;
        self.flow_control()?;
        let valid_timeout = |secs: f64| secs.is_finite() && secs > 0.0;
        if !valid_timeout(self.timeout) || !valid_timeout(self.writetimeout) {
            return Err(ModbusError::configuration(
                "Serial timeouts must be positive and finite",
            ));
        }
        Ok(())
    }

    pub fn data_bits(&self) -> ModbusResult<DataBits> {
        match self.bytesize {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(ModbusError::configuration(format!(
                "Unsupported byte size {}, expected 5-8",
                other
            ))),
        }
    }

    pub fn parity(&self) -> ModbusResult<Parity> {
        match self.parity.to_ascii_uppercase().as_str() {
            "N" => Ok(Parity::None),
            "E" => Ok(Parity::Even),
            "O" => Ok(Parity::Odd),
            other => Err(ModbusError::configuration(format!(
                "Unsupported parity '{}', expected N, E or O",
                other
            ))),
        }
    }

    pub fn stop_bits(&self) -> ModbusResult<StopBits> {
        if self.stopbits == 1.0 {
            Ok(StopBits::One)
        } else if self.stopbits == 2.0 {
            Ok(StopBits::Two)
        } else {
            Err(ModbusError::configuration(format!(
                "Unsupported stop bits {}, expected 1 or 2",
                self.stopbits
            )))
        }
    }

    pub fn flow_control(&self) -> ModbusResult<FlowControl> {
        match (self.xonxoff, self.rtscts) {
            (true, true) => Err(ModbusError::configuration(
                "xonxoff and rtscts flow control are mutually exclusive",
            )),
            (true, false) => Ok(FlowControl::Software),
            (false, true) => Ok(FlowControl::Hardware),
            (false, false) => Ok(FlowControl::None),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.0))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.writetimeout.max(0.0))
    }

    /// Silent interval that terminates an RTU frame (3.5 character times)
    pub fn frame_gap(&self) -> Duration {
        let char_time_us = 11_000_000 / self.baudrate.max(1) as u64;
        Duration::from_micros(char_time_us * 35 / 10)
    }

    /// Port builder carrying every setting
    pub fn builder(&self) -> ModbusResult<SerialPortBuilder> {
        self.validate()?;
        if self.dsrdtr {
            warn!("DSR/DTR flow control is not supported, ignoring it on {}", self.port);
        }
        Ok(tokio_serial::new(&self.port, self.baudrate)
            .data_bits(self.data_bits()?)
            .parity(self.parity()?)
            .stop_bits(self.stop_bits()?)
            .flow_control(self.flow_control()?)
            .timeout(self.read_timeout()))
    }

    /// Open the device; must run inside a tokio runtime
    pub fn open(&self) -> ModbusResult<SerialStream> {
        let builder = self.builder()?;
        SerialStream::open(&builder).map_err(|e| ModbusError::serial(&self.port, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SerialSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.data_bits().unwrap(), DataBits::Eight);
        assert_eq!(settings.parity().unwrap(), Parity::None);
        assert_eq!(settings.stop_bits().unwrap(), StopBits::One);
        assert_eq!(settings.flow_control().unwrap(), FlowControl::None);
        assert_eq!(settings.write_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_rejected_settings() {
        let with = |f: fn(&mut SerialSettings)| {
            let mut settings = SerialSettings::default();
            f(&mut settings);
            settings.validate()
        };

        assert!(with(|s| s.bytesize = 9).is_err());
        assert!(with(|s| s.bytesize = 4).is_err());
        assert!(with(|s| s.parity = "M".into()).is_err());
        assert!(with(|s| s.parity = "S".into()).is_err());
        assert!(with(|s| s.stopbits = 1.5).is_err());
        assert!(with(|s| {
            s.xonxoff = true;
            s.rtscts = true;
        })
        .is_err());
        assert!(with(|s| s.writetimeout = 0.0).is_err());
        assert!(with(|s| s.timeout = f64::INFINITY).is_err());
        assert!(with(|s| s.writetimeout = f64::NAN).is_err());

        assert!(with(|s| s.parity = "e".into()).is_ok());
        assert!(with(|s| s.stopbits = 2.0).is_ok());
        assert!(with(|s| s.dsrdtr = true).is_ok());
    }

    #[test]
    fn test_flow_control_mapping() {
        let mut settings = SerialSettings::default();
        settings.xonxoff = true;
        assert_eq!(settings.flow_control().unwrap(), FlowControl::Software);
        settings.xonxoff = false;
        settings.rtscts = true;
        assert_eq!(settings.flow_control().unwrap(), FlowControl::Hardware);
    }

    #[test]
    fn test_frame_gap() {
        let settings = SerialSettings {
            baudrate: 9600,
            ..Default::default()
        };
        // 11 bits per character at 9600 baud, 3.5 characters
        assert_eq!(settings.frame_gap(), Duration::from_micros(1145 * 35 / 10));
    }

    #[test]
    fn test_open_missing_device() {
        let settings = SerialSettings {
            port: "/dev/modbus_simu_missing".to_string(),
            ..Default::default()
        };
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(async { settings.open() });
        assert!(matches!(result, Err(ModbusError::Serial { .. })));
    }
}
