// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration management for the thermal stress controller
//!
//! This module provides functionality for loading, validating, and applying
//! configuration settings. The configuration is backed by a YAML file and
//! validated against a JSON schema, then against cross-field rules.
//!
//! ## Configuration Structure
//!
//! - `controller`: control loop cadence, timeouts and pause semantics
//! - `tanks`: one entry per tank; the list length is the tank count
//! - `pid`: controller gains, thresholds and anti-windup bound
//! - `ramp`: plan file location and plan validation limits
//! - `sensors`: temperature sensor bus
//! - `relays`: relay driver and board output table
//! - `telemetry`: telemetry log location and batch size
//! - `visualization`: HTTP API server
//! - `access`: administrative passphrase
//! - `simulation`: simulated plant used by the mock drivers
//!
//! ## Usage
//!
//! ```no_run
//! use rust_thermal_stress::config::Config;
//!
//! // Load config from file, creates a default if not found
//! let mut config = Config::from_file("config.yaml").unwrap();
//! config.apply_args(Some(8081), Some("0.0.0.0".to_string()), None);
//! println!("Controlling {} tanks", config.tank_count());
//! ```

pub mod access;
pub mod relays;
pub mod telemetry;
pub mod thermal_regulation;
pub mod utils;
pub mod visualization;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};

pub use access::AccessConfig;
pub use relays::{
    LightsConfig, OutputAddress, RelayBoard, RelayDriverType, RelaysConfig,
    ShiftRegisterConfig, TankOutputsConfig,
};
pub use telemetry::TelemetryConfig;
pub use thermal_regulation::{
    ControllerConfig, PidParameters, RampConfig, SensorConfig, SensorDriverType,
    SimulationConfig, TankConfig, MAX_TANKS,
};
pub use utils::{is_valid_ip_address, output_config_schema};
pub use visualization::VisualizationConfig;

/// Root configuration structure.
///
/// Every section falls back to its defaults when absent from the file, so a
/// minimal configuration only lists what differs from the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control loop settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Tanks, in relay/sensor order
    #[serde(default = "thermal_regulation::default_tanks")]
    pub tanks: Vec<TankConfig>,

    /// PID parameters shared by every tank
    #[serde(default)]
    pub pid: PidParameters,

    /// Ramp plan settings
    #[serde(default)]
    pub ramp: RampConfig,

    /// Temperature sensors
    #[serde(default)]
    pub sensors: SensorConfig,

    /// Relay outputs
    #[serde(default)]
    pub relays: RelaysConfig,

    /// Telemetry log
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// HTTP API server
    #[serde(default)]
    pub visualization: VisualizationConfig,

    /// Administrative access
    #[serde(default)]
    pub access: AccessConfig,

    /// Simulated plant (mock drivers only)
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            tanks: thermal_regulation::default_tanks(),
            pid: PidParameters::default(),
            ramp: RampConfig::default(),
            sensors: SensorConfig::default(),
            relays: RelaysConfig::default(),
            telemetry: TelemetryConfig::default(),
            visualization: VisualizationConfig::default(),
            access: AccessConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Config {
    /// Number of controlled tanks
    pub fn tank_count(&self) -> usize {
        self.tanks.len()
    }

    /// Helper method to create a sample config file when validation fails
    fn create_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let sample_path = path.with_extension("sample.yaml");
        debug!("Original path: {:?}, Sample path: {:?}", path, sample_path);

        if let Some(parent) = sample_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating parent directory: {:?}", parent);
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "Failed to create parent directory for sample config at {:?}",
                        parent
                    )
                })?;
            }
        }

        Self::default()
            .save_to_file(&sample_path)
            .with_context(|| format!("Failed to save sample config to {:?}", sample_path))?;

        error!(
            "Sample configuration file created at {:?}\nPlease edit and rename it",
            sample_path
        );
        Ok(())
    }

    /// Load configuration from a file
    ///
    /// A missing file is created with the default configuration. Any schema,
    /// deserialization or cross-field failure leaves a `.sample.yaml` next to
    /// the file and returns the error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(
                "Configuration file not found at {:?}, creating default",
                path
            );
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;

        let yaml_value: serde_yml::Value = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML configuration from {:?}", path))?;

        let json_value = serde_json::to_value(&yaml_value).with_context(|| {
            format!("Failed to convert YAML to JSON for validation: {:?}", path)
        })?;

        let schema_str = include_str!("../../resources/config.schema.json");
        let schema: serde_json::Value =
            serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;

        let validator = jsonschema::draft202012::options()
            .should_validate_formats(true)
            .build(&schema)?;

        debug!("Validating {} configuration against schema", path.display());
        if let Err(error) = validator.validate(&json_value) {
            error!("Configuration validation error before deserialization");
            Self::create_sample_config(path)?;
            anyhow::bail!("Configuration validation failed: {}", error);
        }

        debug!("Schema validation passed, deserializing into Config structure");
        let config: Config = match serde_yml::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                error!("Configuration deserialization error: {}", err);
                if let Err(e) = Self::create_sample_config(path) {
                    error!("Failed to create sample config: {}", e);
                }
                return Err(anyhow::anyhow!(
                    "Failed to deserialize configuration from {}: {}",
                    path.display(),
                    err
                ));
            }
        };

        if let Err(err) = utils::validate_specific_rules(&config) {
            error!("Configuration specific validation error: {}", err);
            Self::create_sample_config(path)?;
            return Err(err);
        }

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;

        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create config file at {:?}", path.as_ref()))?;

        file.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Apply command line arguments to override configuration values.
    ///
    /// Only explicitly provided values override the loaded configuration.
    ///
    /// # Parameters
    ///
    /// * `web_port` - TCP port for the API server
    /// * `web_address` - Network address for the API server to bind to
    /// * `plan_file` - Ramp plan file path
    pub fn apply_args(
        &mut self,
        web_port: Option<u16>,
        web_address: Option<String>,
        plan_file: Option<PathBuf>,
    ) {
        if let Some(web_port) = web_port {
            debug!("Overriding port from command line: {}", web_port);
            self.visualization.port = web_port;
        }

        if let Some(web_address) = web_address {
            debug!("Overriding address from command line: {}", web_address);
            self.visualization.address = web_address;
        }

        if let Some(plan_file) = plan_file {
            debug!("Overriding ramp plan file from command line: {:?}", plan_file);
            self.ramp.plan_file = plan_file.to_string_lossy().to_string();
        }
    }
}
