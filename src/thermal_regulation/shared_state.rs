// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Shared status of the control loop
//!
//! The control loop is the only writer; the web server and the daemon
//! heartbeat read it. Per-cycle errors end up here instead of being
//! propagated out of the cycle.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::controller::{ActuatorState, PidComponents};
use super::ramp::RampPlan;

/// Most recent per-cycle errors kept in the status
pub const MAX_RECENT_ERRORS: usize = 32;

/// Lifecycle state of the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Init,
    Running,
    Paused,
    ShuttingDown,
    /// Halted after a fatal actuator error; only a reboot resumes control
    Faulted,
}

/// Per-tank status published after each cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankStatus {
    pub name: String,
    pub target: Option<f64>,
    /// Calibrated reading, `None` when the sensor failed this cycle
    pub actual: Option<f64>,
    pub actuator: ActuatorState,
    pub heater_on: bool,
    pub chiller_on: bool,
    pub output: f64,
    pub components: Option<PidComponents>,
    pub fault: Option<String>,
}

/// Summary of the plan in force
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampSummary {
    pub start: NaiveDateTime,
    pub points: usize,
    pub duration_seconds: i64,
    /// Ramp time elapsed, excluding frozen pauses
    pub elapsed_seconds: i64,
}

/// Controller status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub name: String,
    pub state: LoopState,
    pub clock: Option<NaiveDateTime>,
    pub cycle_count: u64,
    pub tanks: Vec<TankStatus>,
    pub sensor_failures: u64,
    pub storage_failures: u64,
    pub relay_image: u32,
    /// `None` when no light relays are configured
    #[serde(default)]
    pub lights_on: Option<bool>,
    pub ramp: Option<RampSummary>,
    /// Plan in force, served separately from the status
    #[serde(skip)]
    pub plan: Option<Arc<RampPlan>>,
    pub recent_errors: Vec<String>,
    pub last_fault: Option<String>,
    pub reboots: u64,
}

impl ControllerStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: LoopState::Init,
            clock: None,
            cycle_count: 0,
            tanks: Vec::new(),
            sensor_failures: 0,
            storage_failures: 0,
            relay_image: 0,
            lights_on: None,
            ramp: None,
            plan: None,
            recent_errors: Vec::new(),
            last_fault: None,
            reboots: 0,
        }
    }

    /// Record a non-fatal error, keeping only the most recent ones
    pub fn push_error(&mut self, message: String) {
        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.remove(0);
        }
        self.recent_errors.push(message);
    }
}

/// Type alias for shared controller status
pub type SharedControllerState = Arc<RwLock<ControllerStatus>>;

/// Create a new shared controller status
pub fn create_shared_controller_state(name: &str) -> SharedControllerState {
    Arc::new(RwLock::new(ControllerStatus::new(name)))
}
