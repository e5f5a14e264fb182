// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Simulated water tanks
//!
//! The mock sensor bus and mock relay driver share one [`MockHardware`]
//! plant: relays switched through the mock driver heat or chill the
//! simulated tanks, and the mock sensors read them back. Each tank follows
//!
//! ```text
//! dT/dt = (ambient - T) / tau + heater_rate * heater_on - chiller_rate * chiller_on
//! ```
//!
//! in °C per minute. The plant also supports failure injection for tests:
//! failing or slow sensors and failing relay writes.

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::{OutputAddress, SimulationConfig};
use crate::thermal_regulation::error::{RelayError, SensorError};
use crate::thermal_regulation::relays::OutputMap;
use crate::thermal_regulation::{RelayDriver, TemperatureSensorBus};

/// Latched images kept for inspection
const MAX_RECORDED_IMAGES: usize = 1024;

/// Integration step of the plant, in simulated seconds
const MAX_STEP_SECONDS: f64 = 1.0;

#[derive(Debug)]
struct MockPlant {
    temperatures: Vec<f64>,
    heaters: Vec<bool>,
    chillers: Vec<bool>,
    simulation: SimulationConfig,
    map: OutputMap,
    frozen: bool,
    last_update: Instant,
    pin_levels: HashMap<u8, bool>,
    latched_image: u32,
    images: VecDeque<u32>,
    failing_reads: Vec<u32>,
    sensor_delays: Vec<Option<Duration>>,
    fail_writes: bool,
    conversions: u64,
    sensor_reads: u64,
    relay_writes: u64,
}

impl MockPlant {
    /// Integrate the tank temperatures up to now
    fn update(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        if !self.frozen {
            self.advance(elapsed * self.simulation.time_scale);
        }
    }

    fn advance(&mut self, mut seconds: f64) {
        let tau = self.simulation.ambient_time_constant_min.max(f64::EPSILON);
        while seconds > 0.0 {
            let step = seconds.min(MAX_STEP_SECONDS);
            let minutes = step / 60.0;
            for tank in 0..self.temperatures.len() {
                let t = self.temperatures[tank];
                let mut rate = (self.simulation.ambient_temperature - t) / tau;
                if self.heaters[tank] {
                    rate += self.simulation.heater_rate_c_per_min;
                }
                if self.chillers[tank] {
                    rate -= self.simulation.chiller_rate_c_per_min;
                }
                self.temperatures[tank] = t + rate * minutes;
            }
            seconds -= step;
        }
    }

    fn output_on(&self, address: OutputAddress) -> bool {
        let level = match address {
            OutputAddress::Pin(pin) => self
                .pin_levels
                .get(&pin)
                .copied()
                .unwrap_or(!self.map.active_high()),
            OutputAddress::ShiftBit(bit) => self.latched_image & (1u32 << bit) != 0,
        };
        self.map.is_on(level)
    }

    /// Derive the tank actuators from the electrical outputs
    fn refresh_actuators(&mut self) {
        for tank in 0..self.temperatures.len() {
            if let Some(outputs) = self.map.outputs(tank).copied() {
                self.heaters[tank] = self.output_on(outputs.heater);
                self.chillers[tank] = self.output_on(outputs.chiller);
            }
        }
    }
}

/// Shared simulated plant
#[derive(Debug, Clone)]
pub struct MockHardware {
    plant: Arc<Mutex<MockPlant>>,
}

impl MockHardware {
    /// Create a plant of `tank_count` tanks at ambient temperature
    pub fn new(tank_count: usize, simulation: &SimulationConfig, map: OutputMap) -> Self {
        let plant = MockPlant {
            temperatures: vec![simulation.ambient_temperature; tank_count],
            heaters: vec![false; tank_count],
            chillers: vec![false; tank_count],
            simulation: simulation.clone(),
            map,
            frozen: false,
            last_update: Instant::now(),
            pin_levels: HashMap::new(),
            latched_image: 0,
            images: VecDeque::new(),
            failing_reads: vec![0; tank_count],
            sensor_delays: vec![None; tank_count],
            fail_writes: false,
            conversions: 0,
            sensor_reads: 0,
            relay_writes: 0,
        };
        Self {
            plant: Arc::new(Mutex::new(plant)),
        }
    }

    fn plant(&self) -> MutexGuard<'_, MockPlant> {
        self.plant.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn sensor_bus(&self) -> MockSensorBus {
        MockSensorBus {
            hardware: self.clone(),
        }
    }

    pub fn relay_driver(&self) -> MockRelayDriver {
        MockRelayDriver {
            hardware: self.clone(),
        }
    }

    /// Stop the physics: temperatures only change through `set_temperature`
    /// and readings carry no noise
    pub fn set_frozen(&self, frozen: bool) {
        let mut plant = self.plant();
        plant.update();
        plant.frozen = frozen;
    }

    /// Run the physics for `seconds` of simulated time
    pub fn advance(&self, seconds: f64) {
        let mut plant = self.plant();
        plant.update();
        plant.advance(seconds);
    }

    pub fn set_temperature(&self, tank: usize, temperature: f64) {
        if let Some(t) = self.plant().temperatures.get_mut(tank) {
            *t = temperature;
        }
    }

    pub fn temperature(&self, tank: usize) -> Option<f64> {
        self.plant().temperatures.get(tank).copied()
    }

    /// Make the next `reads` reads of `tank` fail
    pub fn fail_sensor(&self, tank: usize, reads: u32) {
        if let Some(count) = self.plant().failing_reads.get_mut(tank) {
            *count = reads;
        }
    }

    /// Delay every read of `tank`, or clear the delay
    pub fn delay_sensor(&self, tank: usize, delay: Option<Duration>) {
        if let Some(slot) = self.plant().sensor_delays.get_mut(tank) {
            *slot = delay;
        }
    }

    /// Make relay writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.plant().fail_writes = fail;
    }

    pub fn heater_on(&self, tank: usize) -> bool {
        self.plant().heaters.get(tank).copied().unwrap_or(false)
    }

    pub fn chiller_on(&self, tank: usize) -> bool {
        self.plant().chillers.get(tank).copied().unwrap_or(false)
    }

    /// `(heater, chiller)` of every tank as seen by the plant
    pub fn actuators(&self) -> Vec<(bool, bool)> {
        let plant = self.plant();
        plant
            .heaters
            .iter()
            .zip(&plant.chillers)
            .map(|(&h, &c)| (h, c))
            .collect()
    }

    /// Light relays as seen by the plant
    pub fn lights(&self) -> Vec<bool> {
        let plant = self.plant();
        plant
            .map
            .lights()
            .iter()
            .map(|&address| plant.output_on(address))
            .collect()
    }

    pub fn pin_level(&self, pin: u8) -> Option<bool> {
        self.plant().pin_levels.get(&pin).copied()
    }

    /// Recently latched shift register images, oldest first
    pub fn shift_images(&self) -> Vec<u32> {
        self.plant().images.iter().copied().collect()
    }

    /// Bulk conversions requested so far
    pub fn conversions(&self) -> u64 {
        self.plant().conversions
    }

    pub fn sensor_reads(&self) -> u64 {
        self.plant().sensor_reads
    }

    pub fn relay_writes(&self) -> u64 {
        self.plant().relay_writes
    }
}

/// Temperature sensors of the simulated plant
pub struct MockSensorBus {
    hardware: MockHardware,
}

#[async_trait]
impl TemperatureSensorBus for MockSensorBus {
    async fn start_conversion(&mut self) -> Result<(), SensorError> {
        self.hardware.plant().conversions += 1;
        Ok(())
    }

    async fn read_tank(&mut self, tank: usize) -> Result<f64, SensorError> {
        let delay = {
            let mut plant = self.hardware.plant();
            plant.sensor_reads += 1;
            let pending = plant
                .failing_reads
                .get_mut(tank)
                .ok_or(SensorError::NotConfigured { tank: tank + 1 })?;
            if *pending > 0 {
                *pending -= 1;
                return Err(SensorError::Unavailable {
                    tank: tank + 1,
                    reason: "injected failure".to_string(),
                });
            }
            plant.sensor_delays.get(tank).copied().flatten()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut plant = self.hardware.plant();
        plant.update();
        let temperature = plant.temperatures[tank];
        let noise = plant.simulation.noise_c;
        if plant.frozen || noise <= 0.0 {
            Ok(temperature)
        } else {
            Ok(temperature + rand::rng().random_range(-noise..=noise))
        }
    }
}

/// Relays of the simulated plant
pub struct MockRelayDriver {
    hardware: MockHardware,
}

impl MockRelayDriver {
    fn check_writable(plant: &MockPlant, target: String) -> Result<(), RelayError> {
        if plant.fail_writes {
            return Err(RelayError::Io {
                target,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RelayDriver for MockRelayDriver {
    async fn write_pin(&mut self, pin: u8, level: bool) -> Result<(), RelayError> {
        let mut plant = self.hardware.plant();
        Self::check_writable(&plant, format!("pin {}", pin))?;
        plant.update();
        plant.relay_writes += 1;
        plant.pin_levels.insert(pin, level);
        plant.refresh_actuators();
        Ok(())
    }

    async fn shift_out(&mut self, image: u32, width: u8) -> Result<(), RelayError> {
        let mut plant = self.hardware.plant();
        Self::check_writable(&plant, "shift register".to_string())?;
        plant.update();
        plant.relay_writes += 1;
        let mask = if width >= 32 {
            u32::MAX
        } else {
            (1u32 << width) - 1
        };
        plant.latched_image = image & mask;
        if plant.images.len() == MAX_RECORDED_IMAGES {
            plant.images.pop_front();
        }
        plant.images.push_back(image & mask);
        plant.refresh_actuators();
        debug!("Mock shift register latched {:#06x}", image & mask);
        Ok(())
    }
}
