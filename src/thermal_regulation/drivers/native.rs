// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Native Linux drivers
//!
//! - [`OneWireSensorBus`] reads DS18B20 sensors through the kernel `w1`
//!   sysfs interface (`/sys/bus/w1/devices/<id>/w1_slave`). Each cycle starts
//!   with one bulk conversion on every bus master (`therm_bulk_read`), so the
//!   reads that follow return without converting again.
//! - [`SysfsGpioDriver`] drives relays through `/sys/class/gpio`, bit-banging
//!   the shift register data, clock and latch lines.

use async_trait::async_trait;
use log::debug;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ShiftRegisterConfig;
use crate::thermal_regulation::error::{RelayError, SensorError};
use crate::thermal_regulation::{RelayDriver, TemperatureSensorBus};

/// Poll period while a bulk conversion is running
const CONVERSION_POLL: Duration = Duration::from_millis(10);

/// One-wire temperature sensors, one per tank
pub struct OneWireSensorBus {
    directory: PathBuf,
    sensor_ids: Vec<Option<String>>,
}

impl OneWireSensorBus {
    pub fn new<P: AsRef<Path>>(directory: P, sensor_ids: Vec<Option<String>>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            sensor_ids,
        }
    }

    /// `therm_bulk_read` files of the bus masters supporting bulk conversion
    async fn bulk_read_files(&self) -> Result<Vec<PathBuf>, SensorError> {
        let bus_error = |e: std::io::Error| {
            SensorError::Bus(format!("{}: {}", self.directory.display(), e))
        };
        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(bus_error)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(bus_error)? {
            if !entry.file_name().to_string_lossy().starts_with("w1_bus_master") {
                continue;
            }
            let file = entry.path().join("therm_bulk_read");
            if tokio::fs::try_exists(&file).await.unwrap_or(false) {
                files.push(file);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Parse the content of a `w1_slave` file:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_w1_slave(content: &str, tank: usize) -> Result<f64, SensorError> {
    let mut lines = content.lines();
    let status = lines.next().ok_or_else(|| SensorError::Malformed {
        tank,
        reason: "empty device file".to_string(),
    })?;
    if !status.trim_end().ends_with("YES") {
        return Err(SensorError::CrcMismatch { tank });
    }

    let data = lines.next().unwrap_or_default();
    let (_, raw) = data.rsplit_once("t=").ok_or_else(|| SensorError::Malformed {
        tank,
        reason: "missing t= field".to_string(),
    })?;
    let millis: i64 = raw.trim().parse().map_err(|_| SensorError::Malformed {
        tank,
        reason: format!("invalid temperature '{}'", raw.trim()),
    })?;
    Ok(millis as f64 / 1000.0)
}

#[async_trait]
impl TemperatureSensorBus for OneWireSensorBus {
    /// Write `trigger` to every bus master, then wait until none reports a
    /// conversion in progress (`-1`). Without bulk support, each read
    /// converts on its own.
    async fn start_conversion(&mut self) -> Result<(), SensorError> {
        let files = self.bulk_read_files().await?;
        for file in &files {
            tokio::fs::write(file, "trigger")
                .await
                .map_err(|e| SensorError::Bus(format!("{}: {}", file.display(), e)))?;
        }
        for file in &files {
            loop {
                let state = tokio::fs::read_to_string(file)
                    .await
                    .map_err(|e| SensorError::Bus(format!("{}: {}", file.display(), e)))?;
                if state.trim() != "-1" {
                    break;
                }
                tokio::time::sleep(CONVERSION_POLL).await;
            }
        }
        debug!("Bulk conversion done on {} bus masters", files.len());
        Ok(())
    }

    async fn read_tank(&mut self, tank: usize) -> Result<f64, SensorError> {
        let id = self
            .sensor_ids
            .get(tank)
            .cloned()
            .flatten()
            .ok_or(SensorError::NotConfigured { tank: tank + 1 })?;
        let path = self.directory.join(id).join("w1_slave");
        let content =
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| SensorError::Unavailable {
                    tank: tank + 1,
                    reason: format!("{}: {}", path.display(), e),
                })?;
        parse_w1_slave(&content, tank + 1)
    }
}

/// Relays on Linux sysfs GPIO
pub struct SysfsGpioDriver {
    directory: PathBuf,
    shift_register: Option<ShiftRegisterConfig>,
    configured: HashSet<u8>,
}

impl SysfsGpioDriver {
    pub fn new<P: AsRef<Path>>(directory: P, shift_register: Option<ShiftRegisterConfig>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            shift_register,
            configured: HashSet::new(),
        }
    }

    fn io_error(target: String, err: std::io::Error) -> RelayError {
        RelayError::Io {
            target,
            reason: err.to_string(),
        }
    }

    /// Export the pin if needed and set it as an output
    async fn configure(&mut self, pin: u8) -> Result<(), RelayError> {
        if self.configured.contains(&pin) {
            return Ok(());
        }
        let pin_dir = self.directory.join(format!("gpio{}", pin));
        if !pin_dir.exists() {
            debug!("Exporting GPIO {}", pin);
            tokio::fs::write(self.directory.join("export"), pin.to_string())
                .await
                .map_err(|e| Self::io_error(format!("gpio export {}", pin), e))?;
        }
        tokio::fs::write(pin_dir.join("direction"), "out")
            .await
            .map_err(|e| Self::io_error(format!("gpio{} direction", pin), e))?;
        self.configured.insert(pin);
        Ok(())
    }

    async fn set_level(&mut self, pin: u8, level: bool) -> Result<(), RelayError> {
        self.configure(pin).await?;
        let value = if level { "1" } else { "0" };
        tokio::fs::write(
            self.directory.join(format!("gpio{}", pin)).join("value"),
            value,
        )
        .await
        .map_err(|e| Self::io_error(format!("gpio{} value", pin), e))
    }
}

#[async_trait]
impl RelayDriver for SysfsGpioDriver {
    async fn write_pin(&mut self, pin: u8, level: bool) -> Result<(), RelayError> {
        self.set_level(pin, level).await
    }

    async fn shift_out(&mut self, image: u32, width: u8) -> Result<(), RelayError> {
        let register = self
            .shift_register
            .clone()
            .ok_or(RelayError::NoShiftRegister)?;

        self.set_level(register.latch_pin, false).await?;
        for bit in (0..width.min(32)).rev() {
            self.set_level(register.data_pin, image & (1u32 << bit) != 0)
                .await?;
            self.set_level(register.clock_pin, true).await?;
            self.set_level(register.clock_pin, false).await?;
        }
        self.set_level(register.latch_pin, true).await?;
        self.set_level(register.latch_pin, false).await
    }
}
