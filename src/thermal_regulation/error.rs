// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::time::Duration;
use thiserror::Error;

use super::ramp::RampPlanError;
use super::relays::OutputMapError;
use super::telemetry::StorageError;

/// Tank-scoped sensor failures. Never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("tank {tank}: sensor read timed out after {timeout:?}")]
    Timeout { tank: usize, timeout: Duration },

    #[error("tank {tank}: reading {value} °C is outside the plausible range")]
    OutOfRange { tank: usize, value: f64 },

    #[error("tank {tank}: sensor CRC check failed")]
    CrcMismatch { tank: usize },

    #[error("tank {tank}: malformed sensor data: {reason}")]
    Malformed { tank: usize, reason: String },

    #[error("tank {tank}: no sensor configured")]
    NotConfigured { tank: usize },

    #[error("tank {tank}: sensor unavailable: {reason}")]
    Unavailable { tank: usize, reason: String },

    /// Failure of the bus as a whole, such as a bulk conversion request
    #[error("sensor bus: {0}")]
    Bus(String),
}

impl SensorError {
    /// Tank the error belongs to, `None` for bus-wide errors
    pub fn tank(&self) -> Option<usize> {
        match self {
            SensorError::Timeout { tank, .. }
            | SensorError::OutOfRange { tank, .. }
            | SensorError::CrcMismatch { tank }
            | SensorError::Malformed { tank, .. }
            | SensorError::NotConfigured { tank }
            | SensorError::Unavailable { tank, .. } => Some(*tank),
            SensorError::Bus(_) => None,
        }
    }
}

/// Relay output failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    #[error("failed to drive {target}: {reason}")]
    Io { target: String, reason: String },

    #[error("tank {tank}: heater and chiller cannot both be on")]
    ConflictingOutputs { tank: usize },

    #[error("tank {tank} has no relay outputs")]
    UnknownTank { tank: usize },

    #[error("light {light} is not configured")]
    UnknownLight { light: usize },

    #[error("no shift register is configured")]
    NoShiftRegister,
}

/// Umbrella error of the control loop
///
/// Only `Actuator` is fatal; the other variants are collected per cycle and
/// published through the status channel.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("actuator failure: {0}")]
    Actuator(#[from] RelayError),
}

impl ControlError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControlError::Actuator(_))
    }
}

impl From<RampPlanError> for ControlError {
    fn from(err: RampPlanError) -> Self {
        ControlError::Config(err.to_string())
    }
}

impl From<OutputMapError> for ControlError {
    fn from(err: OutputMapError) -> Self {
        ControlError::Config(err.to_string())
    }
}
