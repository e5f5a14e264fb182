// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Daemon Module
//!
//! Runs the controller as a set of background tasks: the control supervisor,
//! the web server and a heartbeat monitor.
//!
//! ## Usage
//!
//! ```no_run
//! use rust_thermal_stress::{config::Config, daemon::launch_daemon::Daemon};
//!
//! async fn run() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml")?;
//!
//!     let mut daemon = Daemon::new();
//!     daemon.launch(&config).await?;
//!
//!     // Wait for Ctrl+C, or for the control supervisor to give up
//!     tokio::select! {
//!         _ = tokio::signal::ctrl_c() => {}
//!         _ = daemon.stopped() => {}
//!     }
//!
//!     // Outputs off, then stop
//!     daemon.shutdown().await;
//!     daemon.join().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod launch_daemon;
