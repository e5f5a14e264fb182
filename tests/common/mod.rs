// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Shared fixture: a four-tank controller on simulated hardware, with a
//! manual clock and files in a temporary directory

#![allow(dead_code)]

use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use rust_thermal_stress::config::Config;
use rust_thermal_stress::thermal_regulation::drivers::mock::MockHardware;
use rust_thermal_stress::thermal_regulation::ramp::RampLimits;
use rust_thermal_stress::thermal_regulation::relays::OutputMap;
use rust_thermal_stress::thermal_regulation::{
    create_shared_controller_state, load_plan, Clock, ControlLoop, Hardware, ManualClock,
    RampPlan, SharedClock, SharedControllerState, SharedTelemetryLog, TelemetryLog,
};
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tokio::sync::Mutex;

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

pub const PLAN_1300: &str = "// two point ramp\n\
START 13:00\n\
INTERP LINEAR\n\
0:00\t30\t30\t30\t30\n\
3:00\t30\t30\t33\t33\n";

pub fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 7, 1)
        .and_then(|d| d.and_hms_opt(h, m, 0))
        .expect("valid test time")
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub clock: Arc<ManualClock>,
    pub mock: MockHardware,
    pub map: OutputMap,
    pub telemetry: SharedTelemetryLog,
    pub status: SharedControllerState,
}

impl Fixture {
    /// Build a fixture at `now`, with `plan` written to the plan file
    pub async fn new(now: NaiveDateTime, plan: Option<&str>) -> Result<Self> {
        Self::with_config(now, plan, |_| {}).await
    }

    pub async fn with_config<F: FnOnce(&mut Config)>(
        now: NaiveDateTime,
        plan: Option<&str>,
        adjust: F,
    ) -> Result<Self> {
        setup();
        let dir = tempfile::tempdir()?;
        let mut config = Config::default();
        config.ramp.plan_file = dir.path().join("ramp_plan.txt").to_string_lossy().to_string();
        config.telemetry.directory = dir.path().join("telemetry").to_string_lossy().to_string();
        config.simulation.noise_c = 0.0;
        adjust(&mut config);

        if let Some(plan) = plan {
            std::fs::write(&config.ramp.plan_file, plan)?;
        }

        let map = OutputMap::from_config(&config.relays, config.tank_count())?;
        let mock = MockHardware::new(config.tank_count(), &config.simulation, map.clone());
        mock.set_frozen(true);
        for tank in 0..config.tank_count() {
            mock.set_temperature(tank, 29.0);
        }

        let telemetry = Arc::new(Mutex::new(
            TelemetryLog::open(config.telemetry.log_path()).await?,
        ));
        let status = create_shared_controller_state("test bench");

        Ok(Self {
            dir,
            config: Arc::new(config),
            clock: Arc::new(ManualClock::new(now)),
            mock,
            map,
            telemetry,
            status,
        })
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    pub fn hardware(&self) -> Hardware {
        Hardware {
            sensors: Box::new(self.mock.sensor_bus()),
            relays: Box::new(self.mock.relay_driver()),
        }
    }

    pub fn limits(&self) -> RampLimits {
        RampLimits::from_config(&self.config.ramp, self.config.tank_count())
    }

    /// Plan a controller starting now would follow
    pub async fn load_plan(&self) -> Result<RampPlan> {
        Ok(load_plan(&self.config.ramp.plan_file, self.clock.now().date(), &self.limits()).await?)
    }

    /// Control loop in the `Running` state
    pub async fn control(&self) -> Result<ControlLoop> {
        let mut control = ControlLoop::new(
            Arc::clone(&self.config),
            self.map.clone(),
            self.clock(),
            self.hardware(),
            Arc::clone(&self.telemetry),
            Arc::clone(&self.status),
            self.load_plan().await?,
        );
        control.initialize().await?;
        Ok(control)
    }
}
