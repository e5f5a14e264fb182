// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Relay output configuration
//!
//! Board revisions differ only in which physical output drives which relay.
//! Each revision is expressed as a value of the same [`TankOutputsConfig`]
//! table, selected with [`RelayBoard`], rather than as separate code paths.
//! A `custom` board takes its table from the configuration file.

use serde::{Deserialize, Serialize};

/// A single physical relay output
///
/// Written as `{ type: pin, index: 17 }` or `{ type: shift_bit, index: 3 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "index", rename_all = "snake_case")]
pub enum OutputAddress {
    /// GPIO pin driven directly
    Pin(u8),
    /// Bit index in the shift-register image
    ShiftBit(u8),
}

impl std::fmt::Display for OutputAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputAddress::Pin(pin) => write!(f, "pin {}", pin),
            OutputAddress::ShiftBit(bit) => write!(f, "shift bit {}", bit),
        }
    }
}

/// Heater and chiller outputs of one tank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TankOutputsConfig {
    pub heater: OutputAddress,
    pub chiller: OutputAddress,
}

/// Known board revisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayBoard {
    /// First revision: four tanks on the second (shift register) connector
    Cbass32V1,
    /// Second revision: up to eight tanks on a 16 bit shift register
    Cbass32V2,
    /// Table taken from `relays.outputs`
    Custom,
}

/// Relay driver type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayDriverType {
    /// In-memory relays feeding the simulated plant
    Mock,
    /// Linux sysfs GPIO (`/sys/class/gpio`)
    SysfsGpio,
}

/// GPIO lines driving the shift register chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftRegisterConfig {
    /// Number of bits in the chain (8 per 74HC595)
    #[serde(default = "default_shift_width")]
    pub width: u8,

    /// Serial data pin (SER)
    pub data_pin: u8,

    /// Shift clock pin (SRCLK)
    pub clock_pin: u8,

    /// Storage register clock pin (RCLK)
    pub latch_pin: u8,
}

/// Light relays switched on a daily schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Light outputs for the `custom` board. Preset boards use their own.
    #[serde(default)]
    pub outputs: Vec<OutputAddress>,

    /// Time of day the lights switch on, `hh:mm`
    #[serde(default = "default_lights_on")]
    pub on_at: String,

    /// Time of day the lights switch off, `hh:mm`. May be earlier than
    /// `on_at` for a period spanning midnight.
    #[serde(default = "default_lights_off")]
    pub off_at: String,
}

/// Relay outputs configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaysConfig {
    /// Relay driver
    #[serde(default = "default_relay_driver")]
    pub driver: RelayDriverType,

    /// Board revision selecting the output table
    #[serde(default = "default_board")]
    pub board: RelayBoard,

    /// Output table for the `custom` board, one entry per tank
    #[serde(default)]
    pub outputs: Vec<TankOutputsConfig>,

    /// Relays close on a high level. Set to false for normally-on relays.
    #[serde(default = "default_true")]
    pub active_high: bool,

    /// Shift register wiring; `None` when no shift register is fitted
    #[serde(default = "default_shift_register")]
    pub shift_register: Option<ShiftRegisterConfig>,

    /// Root of the sysfs GPIO tree
    #[serde(default = "default_gpio_directory")]
    pub gpio_directory: String,

    #[serde(default)]
    pub lights: LightsConfig,

    /// Switch every output on alone, one after the other, during startup
    #[serde(default)]
    pub self_test: bool,

    /// Time each output stays on during the self-test, in milliseconds
    #[serde(default = "default_self_test_step_ms")]
    pub self_test_step_ms: u64,
}

impl RelaysConfig {
    /// Output table for the selected board
    pub fn output_table(&self) -> Vec<TankOutputsConfig> {
        match self.board {
            RelayBoard::Cbass32V1 => cbass32_v1_outputs(),
            RelayBoard::Cbass32V2 => cbass32_v2_outputs(),
            RelayBoard::Custom => self.outputs.clone(),
        }
    }

    /// Light outputs for the selected board, empty when lights are disabled
    pub fn light_outputs(&self) -> Vec<OutputAddress> {
        if !self.lights.enabled {
            return Vec::new();
        }
        match self.board {
            RelayBoard::Cbass32V1 => cbass32_v1_lights(),
            RelayBoard::Cbass32V2 => cbass32_v2_lights(),
            RelayBoard::Custom => self.lights.outputs.clone(),
        }
    }

    pub fn self_test_step(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.self_test_step_ms)
    }

    /// Width of the shift register chain, 0 when absent
    pub fn shift_width(&self) -> u8 {
        self.shift_register.as_ref().map(|s| s.width).unwrap_or(0)
    }

    /// Pins reserved for the shift register control lines
    pub fn reserved_pins(&self) -> Vec<u8> {
        self.shift_register
            .as_ref()
            .map(|s| vec![s.data_pin, s.clock_pin, s.latch_pin])
            .unwrap_or_default()
    }
}

fn shift_pairs(heaters: &[u8], chillers: &[u8]) -> Vec<TankOutputsConfig> {
    heaters
        .iter()
        .zip(chillers)
        .map(|(&h, &c)| TankOutputsConfig {
            heater: OutputAddress::ShiftBit(h),
            chiller: OutputAddress::ShiftBit(c),
        })
        .collect()
}

/// First board revision. The DB9 pins are 1-4 for heaters and 6-9 for chillers.
pub fn cbass32_v1_outputs() -> Vec<TankOutputsConfig> {
    shift_pairs(&[1, 2, 3, 4], &[5, 6, 7, 8])
}

/// Second board revision. The lowest bits drive the first DB9 (tanks 1-4);
/// the order follows the connector wiring.
pub fn cbass32_v2_outputs() -> Vec<TankOutputsConfig> {
    shift_pairs(&[3, 4, 6, 7, 10, 12, 14, 8], &[5, 1, 2, 0, 15, 13, 11, 9])
}

/// Cold-water variant of the first revision: lights on direct pins
pub fn cbass32_v1_lights() -> Vec<OutputAddress> {
    [22, 23, 24, 25].into_iter().map(OutputAddress::Pin).collect()
}

/// Second revision: lights use the bits left over beyond tank 5, so a board
/// with lights drives at most five tanks
pub fn cbass32_v2_lights() -> Vec<OutputAddress> {
    [12, 14, 8, 13, 11, 9]
        .into_iter()
        .map(OutputAddress::ShiftBit)
        .collect()
}

fn default_relay_driver() -> RelayDriverType {
    RelayDriverType::Mock
}
fn default_board() -> RelayBoard {
    RelayBoard::Cbass32V2
}
fn default_true() -> bool {
    true
}
fn default_shift_width() -> u8 {
    16
}
fn default_shift_register() -> Option<ShiftRegisterConfig> {
    Some(ShiftRegisterConfig::default())
}
fn default_gpio_directory() -> String {
    "/sys/class/gpio".to_string()
}
fn default_lights_on() -> String {
    "07:00".to_string()
}
fn default_lights_off() -> String {
    "19:00".to_string()
}
fn default_self_test_step_ms() -> u64 {
    500
}

impl Default for LightsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            outputs: Vec::new(),
            on_at: default_lights_on(),
            off_at: default_lights_off(),
        }
    }
}

impl Default for ShiftRegisterConfig {
    fn default() -> Self {
        Self {
            width: default_shift_width(),
            data_pin: 7,
            clock_pin: 9,
            latch_pin: 8,
        }
    }
}

impl Default for RelaysConfig {
    fn default() -> Self {
        Self {
            driver: default_relay_driver(),
            board: default_board(),
            outputs: Vec::new(),
            active_high: default_true(),
            shift_register: default_shift_register(),
            gpio_directory: default_gpio_directory(),
            lights: LightsConfig::default(),
            self_test: false,
            self_test_step_ms: default_self_test_step_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_tables_cover_their_tanks() {
        assert_eq!(cbass32_v1_outputs().len(), 4);
        assert_eq!(cbass32_v2_outputs().len(), 8);
        assert_eq!(
            cbass32_v2_outputs()[0],
            TankOutputsConfig {
                heater: OutputAddress::ShiftBit(3),
                chiller: OutputAddress::ShiftBit(5),
            }
        );
    }

    #[test]
    fn test_custom_board_uses_configured_table() {
        let config = RelaysConfig {
            board: RelayBoard::Custom,
            outputs: vec![TankOutputsConfig {
                heater: OutputAddress::Pin(17),
                chiller: OutputAddress::Pin(22),
            }],
            shift_register: None,
            ..RelaysConfig::default()
        };
        assert_eq!(config.output_table().len(), 1);
        assert_eq!(config.shift_width(), 0);
        assert!(config.reserved_pins().is_empty());
    }

    #[test]
    fn test_lights_follow_the_board() {
        let mut config = RelaysConfig::default();
        assert!(config.light_outputs().is_empty());

        config.lights.enabled = true;
        assert_eq!(config.light_outputs().len(), 6);
        assert_eq!(config.light_outputs()[0], OutputAddress::ShiftBit(12));

        config.board = RelayBoard::Cbass32V1;
        assert_eq!(config.light_outputs()[3], OutputAddress::Pin(25));

        config.board = RelayBoard::Custom;
        config.lights.outputs = vec![OutputAddress::Pin(5)];
        assert_eq!(config.light_outputs(), vec![OutputAddress::Pin(5)]);
    }

    #[test]
    fn test_output_address_yaml_form() {
        let yaml = "heater:\n  type: pin\n  index: 17\nchiller:\n  type: shift_bit\n  index: 3\n";
        let outputs: TankOutputsConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(outputs.heater, OutputAddress::Pin(17));
        assert_eq!(outputs.chiller, OutputAddress::ShiftBit(3));

        let json = serde_json::to_value(OutputAddress::ShiftBit(3)).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "shift_bit", "index": 3 }));
    }
}
