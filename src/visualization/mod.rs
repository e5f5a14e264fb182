// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).
//!
//! Visualization module
//!
//! Web server exposing telemetry, controller status and the administrative
//! operations of the control loop.

pub mod api;
pub mod request_guard;
pub mod server;
