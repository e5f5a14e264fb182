// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Sensor and relay drivers
//!
//! - `mock`: simulated water tanks for development and tests
//! - `native`: Linux one-wire temperature sensors and sysfs GPIO relays

pub mod mock;
pub mod native;
