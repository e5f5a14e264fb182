// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Per-tank PID control with binary heater/chiller actuation
//!
//! Each tank has its own [`ThermalController`]. The PID output is signed:
//! positive asks for heat, negative for cold. Relays are binary, so the
//! output magnitude is compared with an engagement threshold and a release
//! band (hysteresis), and a relay that has been switched on stays on for a
//! minimum time. The chiller additionally waits until the tank is a fixed
//! offset above target, since chillers respond more slowly than heaters.

use serde::{Deserialize, Serialize};

use crate::config::PidParameters;

/// Actuator engaged for a tank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorState {
    Heating,
    Chilling,
    Idle,
}

/// PID controller components for analysis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidComponents {
    /// Proportional term value
    pub proportional: f64,
    /// Integral term value
    pub integral: f64,
    /// Derivative term value
    pub derivative: f64,
    /// Error value (target - calibrated reading)
    pub error: f64,
}

/// Outcome of one controller step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuationDecision {
    pub heater_on: bool,
    pub chiller_on: bool,
    /// Raw PID output
    pub output: f64,
    pub components: PidComponents,
}

/// Mutable control state of one tank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankState {
    /// Zero based tank index
    pub id: usize,
    pub last_target: Option<f64>,
    /// Last calibrated reading
    pub last_actual: Option<f64>,
    /// Integral accumulator, °C·s
    pub integral: f64,
    pub last_error: Option<f64>,
    pub last_output: f64,
    pub actuator: ActuatorState,
    /// Seconds spent in the current actuator state
    pub held_for: f64,
}

impl TankState {
    fn new(id: usize) -> Self {
        Self {
            id,
            last_target: None,
            last_actual: None,
            integral: 0.0,
            last_error: None,
            last_output: 0.0,
            actuator: ActuatorState::Idle,
            held_for: 0.0,
        }
    }
}

/// PID controller of one tank
#[derive(Debug, Clone)]
pub struct ThermalController {
    params: PidParameters,
    calibration_offset: f64,
    state: TankState,
}

impl ThermalController {
    pub fn new(id: usize, params: PidParameters, calibration_offset: f64) -> Self {
        Self {
            params,
            calibration_offset,
            state: TankState::new(id),
        }
    }

    pub fn state(&self) -> &TankState {
        &self.state
    }

    /// Compute the relay decision for one cycle.
    ///
    /// `measured` is the raw sensor reading, `dt` the time since the previous
    /// step in seconds. A non-positive `dt` skips integration and the
    /// derivative term.
    pub fn step(&mut self, target: f64, measured: f64, dt: f64) -> ActuationDecision {
        let p = &self.params;
        let actual = measured + self.calibration_offset;
        let error = target - actual;

        if dt > 0.0 {
            self.state.integral =
                (self.state.integral + error * dt).clamp(-p.integral_max, p.integral_max);
        }
        let derivative = match self.state.last_error {
            Some(previous) if dt > 0.0 => (error - previous) / dt,
            _ => 0.0,
        };

        let components = PidComponents {
            proportional: p.kp * error,
            integral: p.ki * self.state.integral,
            derivative: p.kd * derivative,
            error,
        };
        let output = components.proportional + components.integral + components.derivative;

        let wanted = self.select_actuator(output, error);
        let held = self.state.held_for + dt.max(0.0);
        let locked = self.state.actuator != ActuatorState::Idle && held < p.min_on_seconds;
        let next = if wanted != self.state.actuator && locked {
            self.state.actuator
        } else {
            wanted
        };

        if next == self.state.actuator {
            self.state.held_for = held;
        } else {
            self.state.actuator = next;
            self.state.held_for = 0.0;
        }

        self.state.last_target = Some(target);
        self.state.last_actual = Some(actual);
        self.state.last_error = Some(error);
        self.state.last_output = output;

        ActuationDecision {
            heater_on: next == ActuatorState::Heating,
            chiller_on: next == ActuatorState::Chilling,
            output,
            components,
        }
    }

    fn select_actuator(&self, output: f64, error: f64) -> ActuatorState {
        let p = &self.params;
        let engage = p.heater_threshold;
        let release = p.heater_threshold - p.hysteresis;
        let chill_allowed = error < -p.chiller_offset;

        match self.state.actuator {
            ActuatorState::Heating if output > release => ActuatorState::Heating,
            ActuatorState::Chilling if output < -release => ActuatorState::Chilling,
            _ if output > engage => ActuatorState::Heating,
            _ if output < -engage && chill_allowed => ActuatorState::Chilling,
            _ => ActuatorState::Idle,
        }
    }

    /// Turn both relays off for this cycle after a missing reading.
    ///
    /// The integral is kept; the previous error is forgotten so the next
    /// valid reading does not produce a derivative kick.
    pub fn force_idle(&mut self) {
        self.state.actuator = ActuatorState::Idle;
        self.state.held_for = 0.0;
        self.state.last_actual = None;
        self.state.last_error = None;
        self.state.last_output = 0.0;
    }

    /// Restart from a clean state
    pub fn reset(&mut self) {
        self.state = TankState::new(self.state.id);
    }
}
