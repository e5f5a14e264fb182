// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration for the thermal regulation core
//!
//! This module provides the configuration structures for the control loop
//! cadence, the tanks, the per-tank PID controllers, ramp plan validation
//! limits, the temperature sensor bus and the simulated plant used by the
//! mock drivers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum number of tanks a single controller drives
pub const MAX_TANKS: usize = 8;

/// Control loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Human-readable controller name, reported in status
    #[serde(default = "default_controller_name")]
    pub name: String,

    /// Duration of one sense-decide-actuate-log cycle in milliseconds
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,

    /// Timeout for the bulk temperature conversion started at the beginning
    /// of each cycle, in milliseconds. A 12 bit DS18B20 conversion takes 750 ms.
    #[serde(default = "default_conversion_timeout_ms")]
    pub conversion_timeout_ms: u64,

    /// Timeout for a single tank sensor read in milliseconds, once the
    /// conversion is done
    #[serde(default = "default_sensor_timeout_ms")]
    pub sensor_timeout_ms: u64,

    /// Timeout for telemetry storage operations (append, roll) in milliseconds
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,

    /// When true, ramp time stops advancing while the controller is paused.
    /// When false, the ramp keeps following the wall clock during a pause.
    #[serde(default = "default_true")]
    pub pause_freezes_ramp: bool,
}

impl ControllerConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_millis(self.conversion_timeout_ms)
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor_timeout_ms)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }
}

/// Individual tank configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TankConfig {
    /// Human-readable tank name
    pub name: String,

    /// Correction added to the raw sensor reading before control, in °C.
    /// A sensor that reads 0.3 °C low needs an offset of 0.3.
    #[serde(default)]
    pub calibration_offset: f64,

    /// Sensor identifier on the sensor bus (one-wire device id for the
    /// `one_wire` driver, ignored by the mock driver)
    #[serde(default)]
    pub sensor_id: Option<String>,
}

/// PID controller parameters shared by every tank
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidParameters {
    /// Proportional gain
    pub kp: f64,

    /// Integral gain
    pub ki: f64,

    /// Derivative gain
    pub kd: f64,

    /// Bound of the integral accumulator (anti-windup), in °C·s
    #[serde(default = "default_integral_max")]
    pub integral_max: f64,

    /// Output magnitude above which an actuator is engaged
    #[serde(default = "default_heater_threshold")]
    pub heater_threshold: f64,

    /// Width of the release band below the engagement threshold
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f64,

    /// The chiller only engages once the tank is this many °C above target.
    /// Chillers lag more than heaters; set to 0.0 for moving cold water.
    #[serde(default = "default_chiller_offset")]
    pub chiller_offset: f64,

    /// Minimum time an actuator stays in its state before switching, in seconds
    #[serde(default = "default_min_on_seconds")]
    pub min_on_seconds: f64,
}

/// Ramp plan storage and validation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Path of the ramp plan text file
    #[serde(default = "default_plan_file")]
    pub plan_file: String,

    /// Lowest plausible target temperature in °C
    #[serde(default = "default_min_temperature")]
    pub min_temperature: f64,

    /// Highest plausible target temperature in °C
    #[serde(default = "default_max_temperature")]
    pub max_temperature: f64,

    /// Maximum number of points accepted in a plan
    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

/// Temperature sensor bus type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorDriverType {
    /// Simulated tanks
    Mock,
    /// Linux one-wire sysfs (DS18B20 family)
    OneWire,
}

/// Temperature sensor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Sensor bus driver
    #[serde(default = "default_sensor_driver")]
    pub driver: SensorDriverType,

    /// Directory holding the one-wire devices
    #[serde(default = "default_w1_directory")]
    pub w1_directory: String,

    /// Readings below this value are rejected as sensor faults
    #[serde(default = "default_min_valid_reading")]
    pub min_valid_reading: f64,

    /// Readings above this value are rejected as sensor faults
    #[serde(default = "default_max_valid_reading")]
    pub max_valid_reading: f64,
}

/// Simulated plant parameters for the mock drivers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Ambient (room) temperature in °C, also the initial tank temperature
    #[serde(default = "default_ambient")]
    pub ambient_temperature: f64,

    /// Heating rate of an engaged heater in °C per minute
    #[serde(default = "default_heater_rate")]
    pub heater_rate_c_per_min: f64,

    /// Cooling rate of an engaged chiller in °C per minute
    #[serde(default = "default_chiller_rate")]
    pub chiller_rate_c_per_min: f64,

    /// Newton cooling time constant towards ambient in minutes
    #[serde(default = "default_time_constant")]
    pub ambient_time_constant_min: f64,

    /// Standard deviation-like amplitude of the reading noise in °C
    #[serde(default = "default_noise")]
    pub noise_c: f64,

    /// Simulated seconds per wall-clock second
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
}

fn default_controller_name() -> String {
    "Thermal stress controller".to_string()
}
fn default_cycle_interval_ms() -> u64 {
    1000
}
fn default_conversion_timeout_ms() -> u64 {
    800
}
fn default_sensor_timeout_ms() -> u64 {
    150
}
fn default_storage_timeout_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_integral_max() -> f64 {
    50.0
}
fn default_heater_threshold() -> f64 {
    100.0
}
fn default_hysteresis() -> f64 {
    50.0
}
fn default_chiller_offset() -> f64 {
    0.20
}
fn default_min_on_seconds() -> f64 {
    5.0
}
fn default_plan_file() -> String {
    "ramp_plan.txt".to_string()
}
fn default_min_temperature() -> f64 {
    5.0
}
fn default_max_temperature() -> f64 {
    50.0
}
fn default_max_points() -> usize {
    20
}
fn default_sensor_driver() -> SensorDriverType {
    SensorDriverType::Mock
}
fn default_w1_directory() -> String {
    "/sys/bus/w1/devices".to_string()
}
fn default_min_valid_reading() -> f64 {
    -5.0
}
fn default_max_valid_reading() -> f64 {
    60.0
}
fn default_ambient() -> f64 {
    25.0
}
fn default_heater_rate() -> f64 {
    0.5
}
fn default_chiller_rate() -> f64 {
    0.4
}
fn default_time_constant() -> f64 {
    90.0
}
fn default_noise() -> f64 {
    0.02
}
fn default_time_scale() -> f64 {
    1.0
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: default_controller_name(),
            cycle_interval_ms: default_cycle_interval_ms(),
            conversion_timeout_ms: default_conversion_timeout_ms(),
            sensor_timeout_ms: default_sensor_timeout_ms(),
            storage_timeout_ms: default_storage_timeout_ms(),
            pause_freezes_ramp: default_true(),
        }
    }
}

impl Default for PidParameters {
    fn default() -> Self {
        // Field-tuned values; chillers lag, so control is kept mostly proportional.
        Self {
            kp: 2000.0,
            ki: 10.0,
            kd: 1000.0,
            integral_max: default_integral_max(),
            heater_threshold: default_heater_threshold(),
            hysteresis: default_hysteresis(),
            chiller_offset: default_chiller_offset(),
            min_on_seconds: default_min_on_seconds(),
        }
    }
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            plan_file: default_plan_file(),
            min_temperature: default_min_temperature(),
            max_temperature: default_max_temperature(),
            max_points: default_max_points(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            driver: default_sensor_driver(),
            w1_directory: default_w1_directory(),
            min_valid_reading: default_min_valid_reading(),
            max_valid_reading: default_max_valid_reading(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ambient_temperature: default_ambient(),
            heater_rate_c_per_min: default_heater_rate(),
            chiller_rate_c_per_min: default_chiller_rate(),
            ambient_time_constant_min: default_time_constant(),
            noise_c: default_noise(),
            time_scale: default_time_scale(),
        }
    }
}

/// Default tank list: four tanks, no calibration offsets
pub fn default_tanks() -> Vec<TankConfig> {
    (1..=4)
        .map(|i| TankConfig {
            name: format!("Tank {}", i),
            calibration_offset: 0.0,
            sensor_id: None,
        })
        .collect()
}
