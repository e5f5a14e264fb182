// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration utilities
//!
//! This module provides utility functions for working with configuration
//! settings, including validation and schema management.

use anyhow::{Context, Result};
use log::debug;

use super::{Config, MAX_TANKS};
use crate::thermal_regulation::ramp::{RampLimits, RampPlan};
use crate::thermal_regulation::relays::OutputMap;

/// Output the embedded JSON schema to the console.
///
/// Called when the `--show-config-schema` flag is provided on the command line.
///
/// # Example
///
/// ```bash
/// ./rust_thermal_stress --show-config-schema > config_schema.json
/// ```
pub fn output_config_schema() -> Result<()> {
    let schema_str = include_str!("../../resources/config.schema.json");

    let schema: serde_json::Value =
        serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;

    let formatted_schema =
        serde_json::to_string_pretty(&schema).context("Failed to format JSON schema")?;

    println!("{}", formatted_schema);

    Ok(())
}

/// Check if a string is a valid IP address
///
/// Validates that a string represents a valid IPv4 or IPv6 address,
/// or is one of the special values like "localhost" or "0.0.0.0".
pub fn is_valid_ip_address(addr: &str) -> bool {
    if addr.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }

    matches!(addr, "localhost" | "::" | "::0" | "0.0.0.0")
}

/// Validates the configuration against rules the JSON schema cannot express.
///
/// # Validation Rules
///
/// - **Tank count**: between 1 and [`MAX_TANKS`]
/// - **Ranges**: ramp temperature limits and sensor plausibility limits are ordered
/// - **Default plan**: the built-in fallback plan fits the ramp limits
/// - **Cadence**: the cycle interval is non-zero and longer than a bulk
///   conversion followed by a sensor read
/// - **PID**: the hysteresis band does not exceed the engagement threshold
/// - **Output map**: the board table has one entry per tank, no duplicated or
///   overlapping outputs, and every shift bit fits in the register
/// - **Port Range**: the API port is within 1-65534
/// - **IP Address Format**: only logged when questionable
pub fn validate_specific_rules(config: &Config) -> Result<()> {
    debug!("Performing additional validation checks");

    let tanks = config.tank_count();
    if tanks == 0 || tanks > MAX_TANKS {
        anyhow::bail!(
            "Invalid tank count {}: between 1 and {} tanks are supported",
            tanks,
            MAX_TANKS
        );
    }

    if config.ramp.min_temperature >= config.ramp.max_temperature {
        anyhow::bail!(
            "Ramp temperature range is empty: min {} >= max {}",
            config.ramp.min_temperature,
            config.ramp.max_temperature
        );
    }

    if config.ramp.max_points < 2 {
        anyhow::bail!(
            "Ramp plans need at least 2 points, max_points is {}",
            config.ramp.max_points
        );
    }

    let limits = RampLimits::from_config(&config.ramp, tanks);
    RampPlan::default_plan(chrono::NaiveDate::MIN, &limits)
        .context("The built-in default ramp plan does not fit the ramp limits")?;

    if config.sensors.min_valid_reading >= config.sensors.max_valid_reading {
        anyhow::bail!(
            "Sensor reading range is empty: min {} >= max {}",
            config.sensors.min_valid_reading,
            config.sensors.max_valid_reading
        );
    }

    if config.controller.cycle_interval_ms == 0 {
        anyhow::bail!("Cycle interval must be greater than zero");
    }

    let acquisition =
        config.controller.conversion_timeout_ms + config.controller.sensor_timeout_ms;
    if acquisition >= config.controller.cycle_interval_ms {
        anyhow::bail!(
            "Conversion timeout ({} ms) plus sensor timeout ({} ms) must be shorter than the cycle interval ({} ms)",
            config.controller.conversion_timeout_ms,
            config.controller.sensor_timeout_ms,
            config.controller.cycle_interval_ms
        );
    }

    if config.pid.hysteresis > config.pid.heater_threshold {
        anyhow::bail!(
            "PID hysteresis ({}) exceeds the engagement threshold ({})",
            config.pid.hysteresis,
            config.pid.heater_threshold
        );
    }

    OutputMap::from_config(&config.relays, tanks).context("Invalid relay output map")?;

    if config.visualization.port < 1 || config.visualization.port > 65534 {
        anyhow::bail!("Invalid port number: {}", config.visualization.port);
    }

    if !is_valid_ip_address(&config.visualization.address) {
        debug!(
            "Potentially invalid address format: {}",
            config.visualization.address
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutputAddress, RelayBoard, TankConfig, TankOutputsConfig};

    #[test]
    fn test_default_config_passes() {
        assert!(validate_specific_rules(&Config::default()).is_ok());
    }

    #[test]
    fn test_tank_count_limits() {
        let mut config = Config::default();
        config.tanks.clear();
        assert!(validate_specific_rules(&config).is_err());

        config.tanks = (0..9)
            .map(|i| TankConfig {
                name: format!("T{}", i),
                calibration_offset: 0.0,
                sensor_id: None,
            })
            .collect();
        assert!(validate_specific_rules(&config).is_err());
    }

    #[test]
    fn test_board_capacity_is_checked() {
        let mut config = Config::default();
        config.relays.board = RelayBoard::Cbass32V1;
        config.tanks.push(TankConfig {
            name: "Tank 5".to_string(),
            calibration_offset: 0.0,
            sensor_id: None,
        });
        let err = validate_specific_rules(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("output map"));
    }

    #[test]
    fn test_overlapping_custom_table_is_rejected() {
        let mut config = Config::default();
        config.relays.board = RelayBoard::Custom;
        config.relays.outputs = (0..4)
            .map(|i| TankOutputsConfig {
                heater: OutputAddress::Pin(20 + i),
                chiller: OutputAddress::Pin(24 + i),
            })
            .collect();
        config.relays.outputs[3].chiller = OutputAddress::Pin(20);
        assert!(validate_specific_rules(&config).is_err());
    }

    #[test]
    fn test_default_plan_must_fit_limits() {
        let mut config = Config::default();
        config.ramp.max_temperature = 31.0;
        let err = validate_specific_rules(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("default ramp plan"));

        let mut config = Config::default();
        config.ramp.max_points = 3;
        assert!(validate_specific_rules(&config).is_err());
    }

    #[test]
    fn test_acquisition_must_fit_the_cycle() {
        let mut config = Config::default();
        config.controller.conversion_timeout_ms = 900;
        let err = validate_specific_rules(&config).unwrap_err();
        assert!(err.to_string().contains("Conversion timeout"));

        config.controller.conversion_timeout_ms = 0;
        config.controller.sensor_timeout_ms = 999;
        assert!(validate_specific_rules(&config).is_ok());
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_ip_address("127.0.0.1"));
        assert!(is_valid_ip_address("::1"));
        assert!(is_valid_ip_address("localhost"));
        assert!(!is_valid_ip_address("not an address"));
    }
}
