// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Relay output mapping
//!
//! Tanks are switched through heterogeneous outputs: GPIO pins driven
//! directly, or bits of a shift register chain that is shifted out and
//! latched as a whole. [`OutputMap`] is the validated address table and
//! [`RelayOutputMap`] keeps the in-memory output image, committing it once
//! per cycle. Light relays share the same outputs and follow a
//! [`LightSchedule`].

use chrono::NaiveTime;
use std::collections::HashMap;
use thiserror::Error;

use super::error::RelayError;
use super::RelayDriver;
use crate::config::{OutputAddress, RelaysConfig, TankOutputsConfig};

/// Longest supported shift register chain
pub const MAX_SHIFT_WIDTH: u8 = 32;

/// Address table defects, detected once at startup
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OutputMapError {
    #[error("{tanks} tanks configured but the board only provides outputs for {available}")]
    InsufficientCapacity { tanks: usize, available: usize },

    #[error("{address} is used by tank {first} and tank {second}")]
    DuplicateOutput {
        address: OutputAddress,
        first: usize,
        second: usize,
    },

    #[error("tank {tank}: heater and chiller share {address}")]
    SharedOutput { tank: usize, address: OutputAddress },

    #[error("tank {tank}: shift bit {bit} does not fit a {width} bit register")]
    ShiftBitOutOfRange { tank: usize, bit: u8, width: u8 },

    #[error("tank {tank}: {address} needs a shift register but none is configured")]
    NoShiftRegister { tank: usize, address: OutputAddress },

    #[error("tank {tank}: pin {pin} is reserved for the shift register")]
    ReservedPin { tank: usize, pin: u8 },

    #[error("shift register width {0} is not supported")]
    InvalidWidth(u8),

    #[error("light {light}: {address} {reason}")]
    UnusableLightOutput {
        light: usize,
        address: OutputAddress,
        reason: String,
    },

    #[error("invalid light time '{0}', expected hh:mm")]
    InvalidLightTime(String),

    #[error("lights switch on and off at the same time ({0})")]
    EmptyLightPeriod(String),
}

/// Daily on/off times of the light relays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightSchedule {
    on_at: NaiveTime,
    off_at: NaiveTime,
}

impl LightSchedule {
    pub fn parse(on_at: &str, off_at: &str) -> Result<Self, OutputMapError> {
        let time = |value: &str| {
            NaiveTime::parse_from_str(value.trim(), "%H:%M")
                .map_err(|_| OutputMapError::InvalidLightTime(value.to_string()))
        };
        let schedule = Self {
            on_at: time(on_at)?,
            off_at: time(off_at)?,
        };
        if schedule.on_at == schedule.off_at {
            return Err(OutputMapError::EmptyLightPeriod(on_at.to_string()));
        }
        Ok(schedule)
    }

    /// Lights are on from `on_at` included to `off_at` excluded, across
    /// midnight when `off_at` comes first
    pub fn is_on(&self, time: NaiveTime) -> bool {
        if self.on_at < self.off_at {
            time >= self.on_at && time < self.off_at
        } else {
            time >= self.on_at || time < self.off_at
        }
    }
}

/// Validated tank to output table
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMap {
    tanks: Vec<TankOutputsConfig>,
    lights: Vec<OutputAddress>,
    light_schedule: Option<LightSchedule>,
    shift_width: u8,
    active_high: bool,
    reserved_pins: Vec<u8>,
}

impl OutputMap {
    /// Validate `table` for `tank_count` tanks. Extra table entries beyond the
    /// tank count are ignored.
    pub fn new(
        table: &[TankOutputsConfig],
        tank_count: usize,
        shift_width: u8,
        reserved_pins: &[u8],
        active_high: bool,
    ) -> Result<Self, OutputMapError> {
        if shift_width > MAX_SHIFT_WIDTH {
            return Err(OutputMapError::InvalidWidth(shift_width));
        }
        if table.len() < tank_count {
            return Err(OutputMapError::InsufficientCapacity {
                tanks: tank_count,
                available: table.len(),
            });
        }

        let tanks = table[..tank_count].to_vec();
        let mut owners: HashMap<OutputAddress, usize> = HashMap::new();

        for (index, outputs) in tanks.iter().enumerate() {
            let tank = index + 1;
            if outputs.heater == outputs.chiller {
                return Err(OutputMapError::SharedOutput {
                    tank,
                    address: outputs.heater,
                });
            }
            for address in [outputs.heater, outputs.chiller] {
                match address {
                    OutputAddress::Pin(pin) if reserved_pins.contains(&pin) => {
                        return Err(OutputMapError::ReservedPin { tank, pin });
                    }
                    OutputAddress::ShiftBit(_) if shift_width == 0 => {
                        return Err(OutputMapError::NoShiftRegister { tank, address });
                    }
                    OutputAddress::ShiftBit(bit) if bit >= shift_width => {
                        return Err(OutputMapError::ShiftBitOutOfRange {
                            tank,
                            bit,
                            width: shift_width,
                        });
                    }
                    _ => {}
                }
                if let Some(&first) = owners.get(&address) {
                    return Err(OutputMapError::DuplicateOutput {
                        address,
                        first,
                        second: tank,
                    });
                }
                owners.insert(address, tank);
            }
        }

        Ok(Self {
            tanks,
            lights: Vec::new(),
            light_schedule: None,
            shift_width,
            active_high,
            reserved_pins: reserved_pins.to_vec(),
        })
    }

    /// Add light outputs. Each must be free: not used by a tank or by
    /// another light, not reserved, and within the shift register.
    pub fn with_lights(
        mut self,
        lights: &[OutputAddress],
        schedule: LightSchedule,
    ) -> Result<Self, OutputMapError> {
        let mut owners: HashMap<OutputAddress, String> = HashMap::new();
        for (index, outputs) in self.tanks.iter().enumerate() {
            owners.insert(outputs.heater, format!("tank {}", index + 1));
            owners.insert(outputs.chiller, format!("tank {}", index + 1));
        }

        for (index, &address) in lights.iter().enumerate() {
            let light = index + 1;
            let problem = match address {
                OutputAddress::Pin(pin) if self.reserved_pins.contains(&pin) => {
                    Some("is reserved for the shift register".to_string())
                }
                OutputAddress::ShiftBit(_) if self.shift_width == 0 => {
                    Some("needs a shift register but none is configured".to_string())
                }
                OutputAddress::ShiftBit(bit) if bit >= self.shift_width => {
                    Some(format!("does not fit a {} bit register", self.shift_width))
                }
                _ => owners
                    .get(&address)
                    .map(|owner| format!("is already used by {}", owner)),
            };
            if let Some(reason) = problem {
                return Err(OutputMapError::UnusableLightOutput {
                    light,
                    address,
                    reason,
                });
            }
            owners.insert(address, format!("light {}", light));
        }

        self.lights = lights.to_vec();
        self.light_schedule = Some(schedule);
        Ok(self)
    }

    /// Build from the relay configuration of the selected board
    pub fn from_config(config: &RelaysConfig, tank_count: usize) -> Result<Self, OutputMapError> {
        let map = Self::new(
            &config.output_table(),
            tank_count,
            config.shift_width(),
            &config.reserved_pins(),
            config.active_high,
        )?;
        if !config.lights.enabled {
            return Ok(map);
        }
        let schedule = LightSchedule::parse(&config.lights.on_at, &config.lights.off_at)?;
        map.with_lights(&config.light_outputs(), schedule)
    }

    pub fn tank_count(&self) -> usize {
        self.tanks.len()
    }

    pub fn outputs(&self, tank: usize) -> Option<&TankOutputsConfig> {
        self.tanks.get(tank)
    }

    pub fn lights(&self) -> &[OutputAddress] {
        &self.lights
    }

    /// `None` when lights are not enabled
    pub fn light_schedule(&self) -> Option<&LightSchedule> {
        self.light_schedule.as_ref()
    }

    pub fn shift_width(&self) -> u8 {
        self.shift_width
    }

    pub fn active_high(&self) -> bool {
        self.active_high
    }

    /// Electrical level that puts a relay in the requested state
    pub fn level(&self, on: bool) -> bool {
        on == self.active_high
    }

    /// Inverse of [`OutputMap::level`]
    pub fn is_on(&self, level: bool) -> bool {
        level == self.active_high
    }
}

/// Commanded state of one tank's relays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TankOutputState {
    pub heater: bool,
    pub chiller: bool,
}

/// In-memory output image with batched commit
#[derive(Debug, Clone)]
pub struct RelayOutputMap {
    map: OutputMap,
    desired: Vec<TankOutputState>,
    lights: Vec<bool>,
    committed: Option<Vec<TankOutputState>>,
    image: u32,
}

impl RelayOutputMap {
    pub fn new(map: OutputMap) -> Self {
        let desired = vec![TankOutputState::default(); map.tank_count()];
        let lights = vec![false; map.lights.len()];
        Self {
            map,
            desired,
            lights,
            committed: None,
            image: 0,
        }
    }

    pub fn map(&self) -> &OutputMap {
        &self.map
    }

    /// Stage a tank's relay state for the next commit
    pub fn set_state(&mut self, tank: usize, heater: bool, chiller: bool) -> Result<(), RelayError> {
        if heater && chiller {
            return Err(RelayError::ConflictingOutputs { tank: tank + 1 });
        }
        let slot = self
            .desired
            .get_mut(tank)
            .ok_or(RelayError::UnknownTank { tank: tank + 1 })?;
        *slot = TankOutputState { heater, chiller };
        Ok(())
    }

    /// Stage every light relay on or off
    pub fn set_lights(&mut self, on: bool) {
        self.lights.fill(on);
    }

    pub fn set_light(&mut self, light: usize, on: bool) -> Result<(), RelayError> {
        let slot = self
            .lights
            .get_mut(light)
            .ok_or(RelayError::UnknownLight { light: light + 1 })?;
        *slot = on;
        Ok(())
    }

    /// Staged light states
    pub fn lights(&self) -> &[bool] {
        &self.lights
    }

    /// Stage every relay off, lights included
    pub fn all_off(&mut self) {
        self.desired.fill(TankOutputState::default());
        self.lights.fill(false);
    }

    /// Staged state
    pub fn snapshot(&self) -> &[TankOutputState] {
        &self.desired
    }

    /// Last committed state, `None` before the first commit
    pub fn committed(&self) -> Option<&[TankOutputState]> {
        self.committed.as_deref()
    }

    /// Last latched shift register image
    pub fn image(&self) -> u32 {
        self.image
    }

    /// Write the staged state to the hardware.
    ///
    /// Direct pins switching off are written before pins switching on, so a
    /// heater/chiller swap never has both relays closed. All shift register
    /// outputs change together in a single shift-out-and-latch.
    pub async fn commit(&mut self, driver: &mut dyn RelayDriver) -> Result<(), RelayError> {
        let mut requested = Vec::with_capacity(2 * self.desired.len() + self.lights.len());
        for (index, state) in self.desired.iter().enumerate() {
            let outputs = self
                .map
                .outputs(index)
                .ok_or(RelayError::UnknownTank { tank: index + 1 })?;
            requested.push((outputs.heater, state.heater));
            requested.push((outputs.chiller, state.chiller));
        }
        requested.extend(self.map.lights.iter().copied().zip(self.lights.iter().copied()));

        let mut image = 0u32;
        let mut turning_off = Vec::new();
        let mut turning_on = Vec::new();
        for (address, on) in requested {
            let level = self.map.level(on);
            match address {
                OutputAddress::ShiftBit(bit) => {
                    if level {
                        image |= 1 << bit;
                    }
                }
                OutputAddress::Pin(pin) => {
                    if on {
                        turning_on.push((pin, level));
                    } else {
                        turning_off.push((pin, level));
                    }
                }
            }
        }

        // Idle shift register bits must still read "off" for active-low relays
        if self.map.shift_width > 0 && !self.map.active_high {
            let used: u32 = self
                .map
                .tanks
                .iter()
                .flat_map(|o| [o.heater, o.chiller])
                .chain(self.map.lights.iter().copied())
                .filter_map(|a| match a {
                    OutputAddress::ShiftBit(bit) => Some(1u32 << bit),
                    OutputAddress::Pin(_) => None,
                })
                .fold(0, |acc, bit| acc | bit);
            let width_mask = if self.map.shift_width >= 32 {
                u32::MAX
            } else {
                (1u32 << self.map.shift_width) - 1
            };
            image |= width_mask & !used;
        }

        for (pin, level) in turning_off.into_iter().chain(turning_on) {
            driver.write_pin(pin, level).await?;
        }
        if self.map.shift_width > 0 {
            driver.shift_out(image, self.map.shift_width).await?;
        }

        self.image = image;
        self.committed = Some(self.desired.clone());
        Ok(())
    }
}

/// Latch an all-off image without any control state, for paths that must
/// leave the relays safe when no control loop is running
pub async fn switch_all_off(
    map: &OutputMap,
    driver: &mut dyn RelayDriver,
) -> Result<(), RelayError> {
    RelayOutputMap::new(map.clone()).commit(driver).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::relays::{cbass32_v1_outputs, cbass32_v2_lights, cbass32_v2_outputs};
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingDriver {
        writes: Vec<(u8, bool)>,
        images: Vec<(u32, u8)>,
    }

    #[async_trait]
    impl RelayDriver for RecordingDriver {
        async fn write_pin(&mut self, pin: u8, level: bool) -> Result<(), RelayError> {
            self.writes.push((pin, level));
            Ok(())
        }

        async fn shift_out(&mut self, image: u32, width: u8) -> Result<(), RelayError> {
            self.images.push((image, width));
            Ok(())
        }
    }

    fn pins(pairs: &[(u8, u8)]) -> Vec<TankOutputsConfig> {
        pairs
            .iter()
            .map(|&(h, c)| TankOutputsConfig {
                heater: OutputAddress::Pin(h),
                chiller: OutputAddress::Pin(c),
            })
            .collect()
    }

    #[test]
    fn test_board_presets_validate() {
        assert!(OutputMap::new(&cbass32_v2_outputs(), 8, 16, &[7, 8, 9], true).is_ok());
        assert!(OutputMap::new(&cbass32_v1_outputs(), 4, 16, &[], true).is_ok());
    }

    #[test]
    fn test_capacity_and_overlap_detection() {
        assert_eq!(
            OutputMap::new(&cbass32_v1_outputs(), 5, 16, &[], true).unwrap_err(),
            OutputMapError::InsufficientCapacity {
                tanks: 5,
                available: 4
            }
        );

        let overlapping = pins(&[(17, 18), (18, 22)]);
        assert!(matches!(
            OutputMap::new(&overlapping, 2, 0, &[], true),
            Err(OutputMapError::DuplicateOutput {
                first: 1,
                second: 2,
                ..
            })
        ));

        assert!(matches!(
            OutputMap::new(&cbass32_v2_outputs(), 8, 8, &[], true),
            Err(OutputMapError::ShiftBitOutOfRange { .. })
        ));
        assert!(matches!(
            OutputMap::new(&cbass32_v2_outputs(), 1, 0, &[], true),
            Err(OutputMapError::NoShiftRegister { tank: 1, .. })
        ));
        assert!(matches!(
            OutputMap::new(&pins(&[(7, 22)]), 1, 16, &[7, 8, 9], true),
            Err(OutputMapError::ReservedPin { tank: 1, pin: 7 })
        ));
    }

    #[test]
    fn test_lights_cap_the_v2_board_at_five_tanks() {
        let schedule = LightSchedule::parse("07:00", "19:00").unwrap();
        let five = OutputMap::new(&cbass32_v2_outputs(), 5, 16, &[], true).unwrap();
        assert!(five.with_lights(&cbass32_v2_lights(), schedule).is_ok());

        let six = OutputMap::new(&cbass32_v2_outputs(), 6, 16, &[], true).unwrap();
        let err = six.with_lights(&cbass32_v2_lights(), schedule).unwrap_err();
        assert_eq!(
            err,
            OutputMapError::UnusableLightOutput {
                light: 1,
                address: OutputAddress::ShiftBit(12),
                reason: "is already used by tank 6".to_string(),
            }
        );
    }

    #[test]
    fn test_light_outputs_are_checked() {
        let schedule = LightSchedule::parse("07:00", "19:00").unwrap();
        let map = || OutputMap::new(&pins(&[(17, 22)]), 1, 16, &[7, 8, 9], true).unwrap();

        let twice = [OutputAddress::Pin(23), OutputAddress::Pin(23)];
        assert!(matches!(
            map().with_lights(&twice, schedule),
            Err(OutputMapError::UnusableLightOutput { light: 2, .. })
        ));
        assert!(matches!(
            map().with_lights(&[OutputAddress::Pin(8)], schedule),
            Err(OutputMapError::UnusableLightOutput { light: 1, .. })
        ));
        assert!(matches!(
            map().with_lights(&[OutputAddress::ShiftBit(16)], schedule),
            Err(OutputMapError::UnusableLightOutput { light: 1, .. })
        ));
        assert!(matches!(
            map().with_lights(&[OutputAddress::Pin(22)], schedule),
            Err(OutputMapError::UnusableLightOutput { light: 1, .. })
        ));
    }

    #[test]
    fn test_light_schedule() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        let day = LightSchedule::parse("07:00", "19:30").unwrap();
        assert!(!day.is_on(t(6, 59)));
        assert!(day.is_on(t(7, 0)));
        assert!(day.is_on(t(19, 29)));
        assert!(!day.is_on(t(19, 30)));

        let night = LightSchedule::parse("22:00", "06:00").unwrap();
        assert!(night.is_on(t(23, 0)));
        assert!(night.is_on(t(1, 0)));
        assert!(!night.is_on(t(12, 0)));

        assert_eq!(
            LightSchedule::parse("7h", "19:00").unwrap_err(),
            OutputMapError::InvalidLightTime("7h".to_string())
        );
        assert!(matches!(
            LightSchedule::parse("08:00", "08:00"),
            Err(OutputMapError::EmptyLightPeriod(_))
        ));
    }

    #[tokio::test]
    async fn test_lights_share_the_latched_image() {
        let schedule = LightSchedule::parse("07:00", "19:00").unwrap();
        let map = OutputMap::new(&cbass32_v2_outputs(), 4, 16, &[], true)
            .unwrap()
            .with_lights(&cbass32_v2_lights(), schedule)
            .unwrap();
        let mut relays = RelayOutputMap::new(map.clone());
        let mut driver = RecordingDriver::default();

        relays.set_state(0, true, false).unwrap();
        relays.set_lights(true);
        relays.commit(&mut driver).await.unwrap();
        let lights: u32 = [12, 14, 8, 13, 11, 9].iter().map(|b| 1u32 << b).sum();
        assert_eq!(driver.images, vec![((1 << 3) | lights, 16)]);
        assert_eq!(
            relays.set_light(6, true),
            Err(RelayError::UnknownLight { light: 7 })
        );

        switch_all_off(&map, &mut driver).await.unwrap();
        assert_eq!(driver.images.last(), Some(&(0, 16)));
    }

    #[test]
    fn test_both_on_is_rejected() {
        let map = OutputMap::new(&cbass32_v2_outputs(), 4, 16, &[], true).unwrap();
        let mut relays = RelayOutputMap::new(map);
        assert_eq!(
            relays.set_state(0, true, true),
            Err(RelayError::ConflictingOutputs { tank: 1 })
        );
        assert_eq!(
            relays.set_state(4, true, false),
            Err(RelayError::UnknownTank { tank: 5 })
        );
    }

    #[tokio::test]
    async fn test_commit_latches_one_image() {
        let map = OutputMap::new(&cbass32_v2_outputs(), 4, 16, &[], true).unwrap();
        let mut relays = RelayOutputMap::new(map);
        let mut driver = RecordingDriver::default();

        relays.set_state(0, true, false).unwrap(); // heater bit 3
        relays.set_state(3, false, true).unwrap(); // chiller bit 0
        relays.commit(&mut driver).await.unwrap();

        assert!(driver.writes.is_empty());
        assert_eq!(driver.images, vec![((1 << 3) | (1 << 0), 16)]);
        assert_eq!(relays.image(), 0b1001);
        assert_eq!(
            relays.committed().unwrap()[0],
            TankOutputState {
                heater: true,
                chiller: false
            }
        );
    }

    #[tokio::test]
    async fn test_direct_pins_switch_off_before_on() {
        let map = OutputMap::new(&pins(&[(17, 22), (23, 24)]), 2, 0, &[], true).unwrap();
        let mut relays = RelayOutputMap::new(map);
        let mut driver = RecordingDriver::default();

        relays.set_state(0, false, true).unwrap();
        relays.commit(&mut driver).await.unwrap();
        assert!(driver.images.is_empty());
        let on_pos = driver.writes.iter().position(|&w| w == (22, true)).unwrap();
        assert!(driver.writes[..on_pos].contains(&(17, false)));
    }

    #[tokio::test]
    async fn test_active_low_inverts_levels() {
        let map = OutputMap::new(&cbass32_v1_outputs(), 4, 16, &[], false).unwrap();
        let mut relays = RelayOutputMap::new(map);
        let mut driver = RecordingDriver::default();

        relays.set_state(0, true, false).unwrap(); // heater bit 1 pulled low
        relays.commit(&mut driver).await.unwrap();
        let (image, _) = driver.images[0];
        assert_eq!(image & (1 << 1), 0);
        assert_ne!(image & (1 << 5), 0);
        assert_eq!(image, 0xFFFF & !(1 << 1));
    }
}
