// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::Config;
use crate::thermal_regulation::daemon::{AdminCommand, ControlSupervisor};
use crate::thermal_regulation::drivers::mock::MockHardware;
use crate::thermal_regulation::relays::{switch_all_off, OutputMap};
use crate::thermal_regulation::{
    create_hardware, create_relay_driver, create_shared_controller_state, Authorization,
    ControlLoopHandle, SharedClock, SharedControllerState, SharedTelemetryLog, SystemClock,
    TelemetryLog,
};
use crate::visualization::server::{build_rocket, figment, ApiState};

/// Interval of the heartbeat log line
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Represents a daemon task that can be started and managed
pub struct Daemon {
    tasks: Vec<JoinHandle<Result<()>>>,
    running: Arc<AtomicBool>,
    stopped: Arc<Notify>,
    handle: Option<ControlLoopHandle>,
    status: Option<SharedControllerState>,
    telemetry: Option<SharedTelemetryLog>,
    mock: Option<MockHardware>,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new() -> Self {
        Daemon {
            tasks: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(Notify::new()),
            handle: None,
            status: None,
            telemetry: None,
            mock: None,
        }
    }

    /// Launch the controller with the host clock
    pub async fn launch(&mut self, config: &Config) -> Result<()> {
        self.launch_with_clock(config, Arc::new(SystemClock::new()))
            .await
    }

    /// Launch all configured tasks based on configuration
    pub async fn launch_with_clock(&mut self, config: &Config, clock: SharedClock) -> Result<()> {
        let config = Arc::new(config.clone());
        let map = OutputMap::from_config(&config.relays, config.tank_count())
            .context("Invalid relay output map")?;

        let log_path = config.telemetry.log_path();
        let telemetry: SharedTelemetryLog = Arc::new(tokio::sync::Mutex::new(
            TelemetryLog::open(&log_path)
                .await
                .with_context(|| format!("Failed to open telemetry log {}", log_path.display()))?,
        ));
        let status = create_shared_controller_state(&config.controller.name);

        let (hardware, mock) = create_hardware(&config, &map)?;

        let (handle, receiver) = ControlLoopHandle::channel();
        let supervisor = ControlSupervisor::new(
            Arc::clone(&config),
            map.clone(),
            clock,
            hardware,
            Arc::clone(&telemetry),
            Arc::clone(&status),
        );
        let running = self.running.clone();
        let stopped = Arc::clone(&self.stopped);
        let fallback_config = Arc::clone(&config);
        let fallback_mock = mock.clone();
        self.tasks.push(tokio::spawn(async move {
            // Run apart so that a panic still reaches the all-off below
            let result = match tokio::spawn(supervisor.run(receiver)).await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("control supervisor panicked: {}", e)),
            };
            if let Err(e) = &result {
                error!("Control supervisor failed: {:#}", e);
                let mut relays = create_relay_driver(&fallback_config, fallback_mock.as_ref());
                match switch_all_off(&map, relays.as_mut()).await {
                    Ok(()) => warn!("Every output switched off after the control failure"),
                    Err(off) => error!("Failed to switch outputs off: {}", off),
                }
            }
            running.store(false, Ordering::SeqCst);
            stopped.notify_one();
            result
        }));

        if config.visualization.enabled {
            self.start_web_server(&config, &telemetry, &status, &handle)?;
        }

        self.start_heartbeat(Arc::clone(&status))?;

        self.handle = Some(handle);
        self.status = Some(status);
        self.telemetry = Some(telemetry);
        self.mock = mock;
        Ok(())
    }

    /// Start the Rocket web server
    fn start_web_server(
        &mut self,
        config: &Arc<Config>,
        telemetry: &SharedTelemetryLog,
        status: &SharedControllerState,
        handle: &ControlLoopHandle,
    ) -> Result<()> {
        info!(
            "Starting web server on {}:{}",
            config.visualization.address, config.visualization.port
        );

        let rocket = build_rocket(
            figment(&config.visualization),
            ApiState {
                config: Arc::clone(config),
                telemetry: Arc::clone(telemetry),
                status: Arc::clone(status),
                handle: handle.clone(),
            },
        );

        let task = tokio::spawn(async move {
            let ignited = rocket.ignite().await?;
            ignited.launch().await?;
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// Start a heartbeat task that logs controller status periodically
    fn start_heartbeat(&mut self, status: SharedControllerState) -> Result<()> {
        debug!("Starting heartbeat monitor");

        let running = self.running.clone();
        let task = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                {
                    let status = status.read().await;
                    info!(
                        "Heartbeat: {:?}, {} cycles, {} sensor failures, {} storage failures",
                        status.state,
                        status.cycle_count,
                        status.sensor_failures,
                        status.storage_failures
                    );
                }
                time::sleep(HEARTBEAT_INTERVAL).await;
            }
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    pub fn handle(&self) -> Option<&ControlLoopHandle> {
        self.handle.as_ref()
    }

    pub fn status(&self) -> Option<&SharedControllerState> {
        self.status.as_ref()
    }

    pub fn telemetry(&self) -> Option<&SharedTelemetryLog> {
        self.telemetry.as_ref()
    }

    /// Simulated plant, when a mock driver is configured
    pub fn mock_hardware(&self) -> Option<&MockHardware> {
        self.mock.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves once the control supervisor has stopped, outputs off
    pub async fn stopped(&self) {
        if self.is_running() {
            self.stopped.notified().await;
        }
    }

    /// Switch every output off and stop all running tasks
    pub async fn shutdown(&self) {
        info!("Shutting down daemon tasks");
        if let Some(handle) = &self.handle {
            if let Err(e) = handle
                .submit(AdminCommand::Shutdown, Authorization::Granted)
                .await
            {
                warn!("Control loop did not acknowledge shutdown: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for all tasks to complete
    ///
    /// Tasks still pending once the running flag is cleared, such as the
    /// web server, are aborted.
    pub async fn join(self) -> Result<()> {
        for task in self.tasks {
            if !task.is_finished() && !self.running.load(Ordering::SeqCst) {
                task.abort();
            }
            match task.await {
                Ok(Err(e)) => error!("Task failed: {}", e),
                Err(e) if e.is_panic() => error!("Task panicked: {}", e),
                _ => {}
            }
        }
        Ok(())
    }
}
