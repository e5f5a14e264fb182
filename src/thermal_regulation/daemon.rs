// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Control loop and supervisor
//!
//! [`ControlLoop`] runs sense, decide, actuate and log at a fixed cadence.
//! Administrative requests arrive on an mpsc channel and are applied between
//! cycles: a cycle always runs to completion before a request is looked at.
//! [`ControlSupervisor`] owns the hardware across reboots and keeps the
//! controller halted after a fatal actuator error until a reboot is requested.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};

use crate::config::Config;
use crate::thermal_regulation::clock::SharedClock;
use crate::thermal_regulation::controller::ThermalController;
use crate::thermal_regulation::error::{ControlError, RelayError, SensorError};
use crate::thermal_regulation::ramp::{
    anchored_text, persisted_anchor, RampLimits, RampPlan, RampPlanError, RampPlanRequest,
    RampPlanView, RampScheduler,
};
use crate::thermal_regulation::relays::{switch_all_off, OutputMap, RelayOutputMap, TankOutputState};
use crate::thermal_regulation::shared_state::{
    ControllerStatus, LoopState, RampSummary, SharedControllerState, TankStatus,
};
use crate::thermal_regulation::telemetry::{SharedTelemetryLog, StorageError};
use crate::thermal_regulation::Hardware;

/// Pending administrative requests accepted before senders wait
pub const ADMIN_QUEUE_CAPACITY: usize = 16;

/// Administrative operations
#[derive(Debug, Clone)]
pub enum AdminCommand {
    /// Replace the ramp plan with rows submitted as JSON
    ReplacePlan(RampPlanRequest),
    /// Replace the ramp plan with its text form
    ReplacePlanText(String),
    /// Go back to the built-in default plan
    ResetPlan,
    /// Archive the telemetry log and start a new one
    RollLog,
    Pause,
    Resume,
    /// Set the controller clock
    SyncClock(NaiveDateTime),
    /// Switch every output off and restart the control loop
    Reboot,
    /// Switch every output off and stop
    Shutdown,
}

impl AdminCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::ReplacePlan(_) | AdminCommand::ReplacePlanText(_) => "replace-plan",
            AdminCommand::ResetPlan => "reset-plan",
            AdminCommand::RollLog => "roll-log",
            AdminCommand::Pause => "pause",
            AdminCommand::Resume => "resume",
            AdminCommand::SyncClock(_) => "sync-clock",
            AdminCommand::Reboot => "reboot",
            AdminCommand::Shutdown => "shutdown",
        }
    }
}

/// Authorization decision made by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Granted,
    Denied,
}

/// Successful outcome of an administrative request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdminReply {
    Done,
    PlanReplaced { plan: RampPlanView },
    LogRolled { archive: String },
    ClockSynced { clock: NaiveDateTime },
}

/// Rejection of an administrative request. Prior state is always retained.
#[derive(Error, Debug)]
pub enum AdminError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid ramp plan: {0}")]
    InvalidPlan(#[from] RampPlanError),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("controller halted: {0}")]
    Halted(String),

    #[error("controller unavailable")]
    Unavailable,
}

impl From<StorageError> for AdminError {
    fn from(err: StorageError) -> Self {
        AdminError::Storage(err.to_string())
    }
}

pub type AdminResult = Result<AdminReply, AdminError>;

/// Request sent to the control loop
#[derive(Debug)]
pub struct AdminRequest {
    pub command: AdminCommand,
    pub authorization: Authorization,
    pub respond_to: oneshot::Sender<AdminResult>,
}

/// Sending side of the administrative channel
#[derive(Debug, Clone)]
pub struct ControlLoopHandle {
    sender: mpsc::Sender<AdminRequest>,
}

impl ControlLoopHandle {
    /// Create a handle and the receiver the control loop listens on
    pub fn channel() -> (Self, mpsc::Receiver<AdminRequest>) {
        let (sender, receiver) = mpsc::channel(ADMIN_QUEUE_CAPACITY);
        (Self { sender }, receiver)
    }

    /// Queue a request and wait until the control loop has applied it
    pub async fn submit(&self, command: AdminCommand, authorization: Authorization) -> AdminResult {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(AdminRequest {
                command,
                authorization,
                respond_to,
            })
            .await
            .map_err(|_| AdminError::Unavailable)?;
        response.await.unwrap_or(Err(AdminError::Unavailable))
    }
}

/// Why [`ControlLoop::run`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Reboot,
    Shutdown,
    Fault(String),
}

/// Everything observed during one cycle
#[derive(Debug)]
pub struct CycleReport {
    pub clock: NaiveDateTime,
    pub targets: Vec<f64>,
    /// Calibrated readings, `None` for tanks whose sensor failed
    pub actual: Vec<Option<f64>>,
    pub outputs: Vec<TankOutputState>,
    /// Non-fatal errors of the cycle
    pub errors: Vec<ControlError>,
}

/// Ramp time bookkeeping across pauses
#[derive(Debug, Clone)]
struct RampClock {
    freeze_on_pause: bool,
    frozen: ChronoDuration,
    paused_at: Option<NaiveDateTime>,
}

impl RampClock {
    fn new(freeze_on_pause: bool) -> Self {
        Self {
            freeze_on_pause,
            frozen: ChronoDuration::zero(),
            paused_at: None,
        }
    }

    /// Wall-clock time with frozen pauses removed
    fn ramp_time(&self, now: NaiveDateTime) -> NaiveDateTime {
        let mut time = now - self.frozen;
        if let (true, Some(paused_at)) = (self.freeze_on_pause, self.paused_at) {
            time -= (now - paused_at).max(ChronoDuration::zero());
        }
        time
    }

    fn pause(&mut self, now: NaiveDateTime) {
        self.paused_at.get_or_insert(now);
    }

    fn resume(&mut self, now: NaiveDateTime) {
        if let Some(paused_at) = self.paused_at.take() {
            if self.freeze_on_pause {
                self.frozen += (now - paused_at).max(ChronoDuration::zero());
            }
        }
    }

    /// A new plan starts with no frozen time
    fn restart(&mut self, now: NaiveDateTime) {
        self.frozen = ChronoDuration::zero();
        if self.paused_at.is_some() {
            self.paused_at = Some(now);
        }
    }

    /// Follow a clock correction so it does not count as paused time
    fn shift(&mut self, by: ChronoDuration) {
        if let Some(paused_at) = self.paused_at.as_mut() {
            *paused_at += by;
        }
    }
}

/// Load the most recent valid plan.
///
/// A saved plan keeps the date it was anchored to, so a restart does not move
/// its start. A file without an anchor is anchored to `today` and the date is
/// recorded in it. A missing or invalid file falls back to the default plan;
/// an error means not even the default plan fits `limits`.
pub async fn load_plan(
    path: &str,
    today: NaiveDate,
    limits: &RampLimits,
) -> Result<RampPlan, ControlError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let anchor = persisted_anchor(&text);
            match RampPlan::parse(&text, anchor.unwrap_or(today), limits) {
                Ok(plan) => {
                    info!(
                        "Loaded ramp plan {} ({} points, start {})",
                        path,
                        plan.points().len(),
                        plan.start()
                    );
                    if anchor.is_none() {
                        let anchored = anchored_text(&text, today);
                        if let Err(e) = write_plan_file(Path::new(path), &anchored).await {
                            warn!("Could not record the anchor date in {}: {}", path, e);
                        }
                    }
                    return Ok(plan);
                }
                Err(e) => warn!("Ramp plan {} rejected: {}; using the default plan", path, e),
            }
        }
        Err(e) => warn!(
            "Ramp plan {} unavailable ({}); using the default plan",
            path, e
        ),
    }

    RampPlan::default_plan(today, limits).map_err(|e| {
        ControlError::Config(format!(
            "no usable ramp plan, the default plan does not fit the limits: {}",
            e
        ))
    })
}

/// Replace the plan file through a temporary file and a rename
async fn write_plan_file(path: &Path, text: &str) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }
    tokio::fs::write(&tmp, text)
        .await
        .map_err(|e| StorageError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StorageError::io(path, e))
}

/// Orchestrator of one controller: scheduler, tank controllers, relays and
/// telemetry, with the state machine `Init -> Running <-> Paused -> ShuttingDown`
pub struct ControlLoop {
    config: Arc<Config>,
    clock: SharedClock,
    limits: RampLimits,
    scheduler: RampScheduler,
    ramp_clock: RampClock,
    controllers: Vec<ThermalController>,
    outputs: RelayOutputMap,
    hardware: Hardware,
    telemetry: SharedTelemetryLog,
    status: SharedControllerState,
    state: LoopState,
    last_cycle: Option<NaiveDateTime>,
    cycle_count: u64,
    sensor_failures: u64,
    storage_failures: u64,
}

impl ControlLoop {
    /// Build the loop in the `Init` state, following `plan`
    pub fn new(
        config: Arc<Config>,
        map: OutputMap,
        clock: SharedClock,
        hardware: Hardware,
        telemetry: SharedTelemetryLog,
        status: SharedControllerState,
        plan: RampPlan,
    ) -> Self {
        let limits = RampLimits::from_config(&config.ramp, config.tank_count());
        let controllers = config
            .tanks
            .iter()
            .enumerate()
            .map(|(id, tank)| ThermalController::new(id, config.pid.clone(), tank.calibration_offset))
            .collect();

        Self {
            ramp_clock: RampClock::new(config.controller.pause_freezes_ramp),
            config,
            clock,
            limits,
            scheduler: RampScheduler::new(plan),
            controllers,
            outputs: RelayOutputMap::new(map),
            hardware,
            telemetry,
            status,
            state: LoopState::Init,
            last_cycle: None,
            cycle_count: 0,
            sensor_failures: 0,
            storage_failures: 0,
        }
    }

    /// Switch every output off, run the relay self-test when enabled, and
    /// enter `Running`
    pub async fn initialize(&mut self) -> Result<(), ControlError> {
        self.outputs.all_off();
        if let Err(e) = self.outputs.commit(self.hardware.relays.as_mut()).await {
            return Err(self.enter_fault(e).await);
        }
        if self.config.relays.self_test {
            if let Err(e) = self.relay_self_test().await {
                return Err(self.enter_fault(e).await);
            }
        }
        self.state = LoopState::Running;
        info!(
            "Control loop running: {} tanks, cycle {} ms",
            self.controllers.len(),
            self.config.controller.cycle_interval_ms
        );
        self.publish(|_| {}).await;
        Ok(())
    }

    /// Switch each output on alone for one step, tanks first, then lights.
    /// Leaves every output off.
    async fn relay_self_test(&mut self) -> Result<(), RelayError> {
        let step = self.config.relays.self_test_step();
        let lights = self.outputs.lights().len();
        info!(
            "Relay self-test: {} tanks, {} lights, {:?} per output",
            self.controllers.len(),
            lights,
            step
        );

        for tank in 0..self.controllers.len() {
            for (heater, chiller) in [(true, false), (false, true)] {
                self.outputs.all_off();
                self.outputs.set_state(tank, heater, chiller)?;
                self.outputs.commit(self.hardware.relays.as_mut()).await?;
                time::sleep(step).await;
            }
        }
        for light in 0..lights {
            self.outputs.all_off();
            self.outputs.set_light(light, true)?;
            self.outputs.commit(self.hardware.relays.as_mut()).await?;
            time::sleep(step).await;
        }

        self.outputs.all_off();
        self.outputs.commit(self.hardware.relays.as_mut()).await
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn plan(&self) -> Arc<RampPlan> {
        self.scheduler.plan()
    }

    pub fn controllers(&self) -> &[ThermalController] {
        &self.controllers
    }

    pub fn outputs(&self) -> &RelayOutputMap {
        &self.outputs
    }

    /// Give the drivers back, for a reboot
    pub fn into_hardware(self) -> Hardware {
        self.hardware
    }

    /// Time since the plan start on the ramp clock
    pub fn ramp_elapsed(&self, now: NaiveDateTime) -> ChronoDuration {
        (self.ramp_clock.ramp_time(now) - self.scheduler.plan().start()).max(ChronoDuration::zero())
    }

    fn reading_plausible(&self, value: f64) -> bool {
        value.is_finite()
            && value >= self.config.sensors.min_valid_reading
            && value <= self.config.sensors.max_valid_reading
    }

    async fn read_sensor(&mut self, tank: usize) -> Result<f64, SensorError> {
        let timeout = self.config.controller.sensor_timeout();
        match time::timeout(timeout, self.hardware.sensors.read_tank(tank)).await {
            Ok(Ok(value)) if self.reading_plausible(value) => Ok(value),
            Ok(Ok(value)) => Err(SensorError::OutOfRange {
                tank: tank + 1,
                value,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SensorError::Timeout {
                tank: tank + 1,
                timeout,
            }),
        }
    }

    /// Run one sense-decide-actuate-log cycle.
    ///
    /// Sensor and storage failures are collected in the report. Only an
    /// actuator failure is returned as an error; the loop is then `Faulted`.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, ControlError> {
        let now = self.clock.now();
        let nominal = self.config.controller.cycle_interval().as_secs_f64();
        let dt = match self.last_cycle {
            Some(previous) => {
                let seconds = (now - previous).num_milliseconds() as f64 / 1000.0;
                if seconds > 0.0 {
                    seconds
                } else {
                    nominal
                }
            }
            None => nominal,
        };
        self.last_cycle = Some(now);
        self.cycle_count += 1;

        // One bulk conversion for every sensor, then one read per tank
        let conversion = self.config.controller.conversion_timeout();
        match time::timeout(conversion, self.hardware.sensors.start_conversion()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Temperature conversion failed: {}", e),
            Err(_) => warn!("Temperature conversion not done within {:?}", conversion),
        }

        let targets = self.scheduler.plan().targets_at(self.ramp_elapsed(now));
        let mut errors = Vec::new();
        let mut actual = Vec::with_capacity(self.controllers.len());
        let mut tanks = Vec::with_capacity(self.controllers.len());

        for tank in 0..self.controllers.len() {
            let target = targets[tank];
            let name = self.config.tanks[tank].name.clone();
            match self.read_sensor(tank).await {
                Ok(raw) => {
                    let decision = self.controllers[tank].step(target, raw, dt);
                    self.outputs
                        .set_state(tank, decision.heater_on, decision.chiller_on)?;
                    let state = self.controllers[tank].state();
                    actual.push(state.last_actual);
                    tanks.push(TankStatus {
                        name,
                        target: Some(target),
                        actual: state.last_actual,
                        actuator: state.actuator,
                        heater_on: decision.heater_on,
                        chiller_on: decision.chiller_on,
                        output: decision.output,
                        components: Some(decision.components),
                        fault: None,
                    });
                }
                Err(e) => {
                    warn!("{}; outputs off for this cycle", e);
                    self.sensor_failures += 1;
                    self.controllers[tank].force_idle();
                    self.outputs.set_state(tank, false, false)?;
                    actual.push(None);
                    tanks.push(TankStatus {
                        name,
                        target: Some(target),
                        actual: None,
                        actuator: self.controllers[tank].state().actuator,
                        heater_on: false,
                        chiller_on: false,
                        output: 0.0,
                        components: None,
                        fault: Some(e.to_string()),
                    });
                    errors.push(ControlError::Sensor(e));
                }
            }
        }

        if let Some(schedule) = self.outputs.map().light_schedule().copied() {
            let on = schedule.is_on(now.time());
            self.outputs.set_lights(on);
        }

        if let Err(e) = self.outputs.commit(self.hardware.relays.as_mut()).await {
            return Err(self.enter_fault(e).await);
        }

        let timeout = self.config.controller.storage_timeout();
        let telemetry = Arc::clone(&self.telemetry);
        let append = async {
            let mut log = telemetry.lock().await;
            log.append(now, targets.clone(), actual.clone()).await
        };
        let stored = match time::timeout(timeout, append).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(timeout)),
        };
        if let Err(e) = stored {
            warn!("Telemetry sample dropped: {}", e);
            self.storage_failures += 1;
            errors.push(ControlError::Storage(e));
        }

        debug!(
            "Cycle {}: targets {:?}, actual {:?}, image {:#x}",
            self.cycle_count,
            targets,
            actual,
            self.outputs.image()
        );

        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        self.publish(move |status| {
            status.tanks = tanks;
            for message in messages {
                status.push_error(message);
            }
        })
        .await;

        Ok(CycleReport {
            clock: now,
            targets,
            actual,
            outputs: self.outputs.snapshot().to_vec(),
            errors,
        })
    }

    /// Switch everything off after an actuator failure and halt
    async fn enter_fault(&mut self, cause: RelayError) -> ControlError {
        error!("Actuator failure, halting control: {}", cause);
        self.state = LoopState::Faulted;
        self.safe_off().await;
        let message = cause.to_string();
        self.publish(move |status| status.last_fault = Some(message))
            .await;
        ControlError::Actuator(cause)
    }

    /// Best-effort all-off
    async fn safe_off(&mut self) {
        self.outputs.all_off();
        for controller in &mut self.controllers {
            controller.force_idle();
        }
        if let Err(e) = self.outputs.commit(self.hardware.relays.as_mut()).await {
            error!("Failed to switch outputs off: {}", e);
        }
    }

    async fn publish<F: FnOnce(&mut ControllerStatus)>(&self, update: F) {
        let now = self.clock.now();
        let plan = self.scheduler.plan();
        let mut status = self.status.write().await;
        status.state = self.state;
        status.clock = Some(now);
        status.cycle_count = self.cycle_count;
        status.sensor_failures = self.sensor_failures;
        status.storage_failures = self.storage_failures;
        status.relay_image = self.outputs.image();
        status.lights_on = self
            .outputs
            .map()
            .light_schedule()
            .map(|_| self.outputs.lights().iter().any(|&on| on));
        status.ramp = Some(RampSummary {
            start: plan.start(),
            points: plan.points().len(),
            duration_seconds: plan.duration().num_seconds(),
            elapsed_seconds: self.ramp_elapsed(now).num_seconds(),
        });
        status.plan = Some(plan);
        update(&mut *status);
    }

    async fn persist_plan(&self, plan: &RampPlan) -> Result<(), StorageError> {
        let path = Path::new(&self.config.ramp.plan_file);
        let text = plan.to_persisted_text();
        let timeout = self.config.controller.storage_timeout();
        time::timeout(timeout, write_plan_file(path, &text))
            .await
            .map_err(|_| StorageError::Timeout(timeout))?
    }

    async fn install_plan(&mut self, plan: RampPlan) -> AdminResult {
        self.persist_plan(&plan).await?;
        let now = self.clock.now();
        info!(
            "Ramp plan replaced: {} points starting {}",
            plan.points().len(),
            plan.start()
        );
        self.scheduler.replace(plan);
        self.ramp_clock.restart(now);
        self.publish(|_| {}).await;
        Ok(AdminReply::PlanReplaced {
            plan: RampPlanView::from(self.scheduler.plan().as_ref()),
        })
    }

    async fn roll_log(&mut self) -> AdminResult {
        let timeout = self.config.controller.storage_timeout();
        let now = self.clock.now();
        // Only waiting for the log is bounded; a started roll runs to completion
        let mut log = time::timeout(timeout, self.telemetry.lock())
            .await
            .map_err(|_| StorageError::Timeout(timeout))?;
        let archive = log.roll(now).await?;
        Ok(AdminReply::LogRolled {
            archive: archive
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        })
    }

    /// Apply one administrative request. Returns the reply and, for reboot
    /// and shutdown, the reason the loop must exit.
    pub async fn handle_admin(
        &mut self,
        command: AdminCommand,
        authorization: Authorization,
    ) -> (AdminResult, Option<LoopExit>) {
        if authorization == Authorization::Denied {
            warn!("Rejected unauthorized {} request", command.name());
            return (Err(AdminError::Unauthorized), None);
        }

        if self.state == LoopState::Faulted
            && !matches!(command, AdminCommand::Reboot | AdminCommand::Shutdown)
        {
            let fault = self.status.read().await.last_fault.clone().unwrap_or_default();
            return (Err(AdminError::Halted(fault)), None);
        }

        info!("Applying {} request", command.name());
        let date = self.clock.now().date();
        let result = match command {
            AdminCommand::ReplacePlan(request) => match request.into_plan(date, &self.limits) {
                Ok(plan) => self.install_plan(plan).await,
                Err(e) => Err(e.into()),
            },
            AdminCommand::ReplacePlanText(text) => match RampPlan::parse(&text, date, &self.limits) {
                Ok(plan) => self.install_plan(plan).await,
                Err(e) => Err(e.into()),
            },
            AdminCommand::ResetPlan => match RampPlan::default_plan(date, &self.limits) {
                Ok(plan) => self.install_plan(plan).await,
                Err(e) => Err(e.into()),
            },
            AdminCommand::RollLog => self.roll_log().await,
            AdminCommand::Pause => {
                if self.state == LoopState::Running {
                    self.state = LoopState::Paused;
                    self.ramp_clock.pause(self.clock.now());
                    self.publish(|_| {}).await;
                }
                Ok(AdminReply::Done)
            }
            AdminCommand::Resume => {
                if self.state == LoopState::Paused {
                    self.state = LoopState::Running;
                    self.ramp_clock.resume(self.clock.now());
                    self.last_cycle = None;
                    self.publish(|_| {}).await;
                }
                Ok(AdminReply::Done)
            }
            AdminCommand::SyncClock(time) => {
                let before = self.clock.now();
                self.clock.set(time);
                self.ramp_clock.shift(time - before);
                self.last_cycle = None;
                self.publish(|_| {}).await;
                Ok(AdminReply::ClockSynced {
                    clock: self.clock.now(),
                })
            }
            AdminCommand::Reboot => {
                return (Ok(AdminReply::Done), Some(self.stop(LoopExit::Reboot).await))
            }
            AdminCommand::Shutdown => {
                return (Ok(AdminReply::Done), Some(self.stop(LoopExit::Shutdown).await))
            }
        };

        if let Err(e) = &result {
            warn!("Administrative request rejected: {}", e);
        }
        (result, None)
    }

    /// Leave the loop with every output off
    async fn stop(&mut self, exit: LoopExit) -> LoopExit {
        self.state = LoopState::ShuttingDown;
        self.safe_off().await;
        self.publish(|_| {}).await;
        exit
    }

    /// Run cycles at the configured cadence until reboot, shutdown or a
    /// fatal error. Outputs are off whenever this returns.
    pub async fn run(&mut self, admin: &mut mpsc::Receiver<AdminRequest>) -> LoopExit {
        let mut interval = time::interval(self.config.controller.cycle_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.state == LoopState::Running {
                        if let Err(e) = self.run_cycle().await {
                            return LoopExit::Fault(e.to_string());
                        }
                    }
                }
                request = admin.recv() => {
                    let Some(request) = request else {
                        info!("Administrative channel closed, stopping control loop");
                        return self.stop(LoopExit::Shutdown).await;
                    };
                    let (result, exit) = self
                        .handle_admin(request.command, request.authorization)
                        .await;
                    request.respond_to.send(result).ok();
                    if let Some(exit) = exit {
                        return exit;
                    }
                }
            }
        }
    }
}

/// Runs the control loop, re-initializing it after a reboot request.
///
/// The plan in force is carried across reboots with its absolute start.
pub struct ControlSupervisor {
    config: Arc<Config>,
    map: OutputMap,
    clock: SharedClock,
    telemetry: SharedTelemetryLog,
    status: SharedControllerState,
    hardware: Option<Hardware>,
    plan: Option<RampPlan>,
}

impl ControlSupervisor {
    pub fn new(
        config: Arc<Config>,
        map: OutputMap,
        clock: SharedClock,
        hardware: Hardware,
        telemetry: SharedTelemetryLog,
        status: SharedControllerState,
    ) -> Self {
        Self {
            config,
            map,
            clock,
            telemetry,
            status,
            hardware: Some(hardware),
            plan: None,
        }
    }

    /// Supervise until shutdown.
    ///
    /// Fails when no plan can be loaded at startup; every output is switched
    /// off first.
    pub async fn run(mut self, mut admin: mpsc::Receiver<AdminRequest>) -> Result<()> {
        while let Some(mut hardware) = self.hardware.take() {
            let plan = match self.plan.take() {
                Some(plan) => plan,
                None => {
                    let limits =
                        RampLimits::from_config(&self.config.ramp, self.config.tank_count());
                    match load_plan(&self.config.ramp.plan_file, self.clock.now().date(), &limits)
                        .await
                    {
                        Ok(plan) => plan,
                        Err(e) => {
                            error!("Control cannot start: {}", e);
                            let off = switch_all_off(&self.map, hardware.relays.as_mut()).await;
                            if let Err(off) = off {
                                error!("Failed to switch outputs off: {}", off);
                            }
                            self.status.write().await.last_fault = Some(e.to_string());
                            return Err(e.into());
                        }
                    }
                }
            };

            let mut control = ControlLoop::new(
                Arc::clone(&self.config),
                self.map.clone(),
                Arc::clone(&self.clock),
                hardware,
                Arc::clone(&self.telemetry),
                Arc::clone(&self.status),
                plan,
            );

            let exit = match control.initialize().await {
                Ok(()) => control.run(&mut admin).await,
                Err(e) => LoopExit::Fault(e.to_string()),
            };

            let reboot = match exit {
                LoopExit::Shutdown => false,
                LoopExit::Reboot => true,
                LoopExit::Fault(message) => {
                    error!("Control halted until reboot: {}", message);
                    Self::wait_for_reboot(&mut admin, &message).await
                }
            };

            if !reboot {
                info!("Control supervisor stopped");
                return Ok(());
            }

            info!("Rebooting control loop");
            self.status.write().await.reboots += 1;
            self.plan = Some(control.plan().as_ref().clone());
            self.hardware = Some(control.into_hardware());
        }
        Ok(())
    }

    /// While halted, reject everything but reboot and shutdown
    async fn wait_for_reboot(admin: &mut mpsc::Receiver<AdminRequest>, fault: &str) -> bool {
        while let Some(request) = admin.recv().await {
            let (result, reboot) = match (request.authorization, &request.command) {
                (Authorization::Denied, _) => (Err(AdminError::Unauthorized), None),
                (_, AdminCommand::Reboot) => (Ok(AdminReply::Done), Some(true)),
                (_, AdminCommand::Shutdown) => (Ok(AdminReply::Done), Some(false)),
                _ => (Err(AdminError::Halted(fault.to_string())), None),
            };
            request.respond_to.send(result).ok();
            if let Some(reboot) = reboot {
                return reboot;
            }
        }
        false
    }
}
