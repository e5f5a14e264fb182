// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Rust thermal stress library
//!
//! Multi-tank thermal stress controller: each tank follows a temperature
//! ramp plan through a PID controller driving a heater and a chiller relay,
//! and every control cycle is logged for later download.

pub mod config;
pub mod daemon;
pub mod thermal_regulation;
pub mod visualization;
