// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Multi-tank thermal regulation
//!
//! This module provides the control core of the thermal stress controller:
//! - Ramp plans and the scheduler turning time into per-tank targets
//! - One PID controller per tank driving binary heater/chiller relays
//! - Relay output mapping for direct pins and shift register chains
//! - The append-only telemetry log
//! - The control loop applying all of the above at a fixed cadence
//! - Hardware abstraction for sensors and relays (native and mock drivers)

pub mod clock;
pub mod controller;
pub mod daemon;
pub mod drivers;
pub mod error;
pub mod ramp;
pub mod relays;
pub mod shared_state;
pub mod telemetry;

use anyhow::Result;
use log::info;

use crate::config::{Config, RelayDriverType, SensorDriverType};
use error::{RelayError, SensorError};
use relays::OutputMap;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use controller::{ActuationDecision, ActuatorState, ThermalController};
pub use daemon::{
    load_plan, AdminCommand, AdminError, AdminReply, Authorization, ControlLoop,
    ControlLoopHandle, ControlSupervisor, LoopExit,
};
pub use ramp::{RampPlan, RampScheduler};
pub use relays::RelayOutputMap;
pub use shared_state::{create_shared_controller_state, SharedControllerState};
pub use telemetry::{SharedTelemetryLog, TelemetryLog};

/// Source of per-tank temperatures
#[async_trait::async_trait]
pub trait TemperatureSensorBus: Send + Sync {
    /// Start a temperature conversion on every sensor at once, and wait for
    /// it to finish. Buses converting on each read have nothing to do.
    async fn start_conversion(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    /// Raw temperature of `tank` (zero based) in °C
    async fn read_tank(&mut self, tank: usize) -> Result<f64, SensorError>;
}

/// Physical relay outputs
#[async_trait::async_trait]
pub trait RelayDriver: Send + Sync {
    /// Drive a GPIO pin to `level`
    async fn write_pin(&mut self, pin: u8, level: bool) -> Result<(), RelayError>;

    /// Shift `width` bits of `image` out, most significant first, then latch
    async fn shift_out(&mut self, image: u32, width: u8) -> Result<(), RelayError>;
}

/// Sensor and relay drivers owned by the control loop
pub struct Hardware {
    pub sensors: Box<dyn TemperatureSensorBus>,
    pub relays: Box<dyn RelayDriver>,
}

/// Create the drivers selected in the configuration.
///
/// When either side uses the mock driver, the returned [`drivers::mock::MockHardware`]
/// gives access to the simulated plant shared by the mock sensors and relays.
pub fn create_hardware(
    config: &Config,
    map: &OutputMap,
) -> Result<(Hardware, Option<drivers::mock::MockHardware>)> {
    let uses_mock = config.sensors.driver == SensorDriverType::Mock
        || config.relays.driver == RelayDriverType::Mock;
    let mock = uses_mock.then(|| {
        drivers::mock::MockHardware::new(config.tank_count(), &config.simulation, map.clone())
    });

    let sensors: Box<dyn TemperatureSensorBus> = match (&config.sensors.driver, &mock) {
        (SensorDriverType::Mock, Some(mock)) => Box::new(mock.sensor_bus()),
        _ => Box::new(drivers::native::OneWireSensorBus::new(
            &config.sensors.w1_directory,
            config.tanks.iter().map(|t| t.sensor_id.clone()).collect(),
        )),
    };

    let relays = create_relay_driver(config, mock.as_ref());

    info!(
        "Hardware created: sensors={:?}, relays={:?}, board={:?}",
        config.sensors.driver, config.relays.driver, config.relays.board
    );

    Ok((Hardware { sensors, relays }, mock))
}

/// Relay driver selected in the configuration. Also used on its own to switch
/// the outputs off when the control loop is gone.
pub fn create_relay_driver(
    config: &Config,
    mock: Option<&drivers::mock::MockHardware>,
) -> Box<dyn RelayDriver> {
    match (&config.relays.driver, mock) {
        (RelayDriverType::Mock, Some(mock)) => Box::new(mock.relay_driver()),
        _ => Box::new(drivers::native::SysfsGpioDriver::new(
            &config.relays.gpio_directory,
            config.relays.shift_register.clone(),
        )),
    }
}
