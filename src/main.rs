// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the thermal stress controller
use anyhow::Result;
use clap::Parser;
use log::{error, info};
use rust_thermal_stress::config::{self, Config};
use rust_thermal_stress::daemon::launch_daemon::Daemon;
use std::path::PathBuf;
use tokio::signal;

/// Multi-tank thermal stress controller
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Web server port
    #[arg(short = 'p', long)]
    web_port: Option<u16>,

    /// Web server address
    #[arg(short = 'a', long)]
    web_address: Option<String>,

    /// Ramp plan file
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Path to configuration file (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a configuration to validate and exit
    #[arg(long)]
    validate_config: Option<PathBuf>,

    /// Output the configuration schema as JSON and exit
    #[arg(long)]
    show_config_schema: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[rocket::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if args.show_config_schema {
        return config::output_config_schema();
    }

    if let Some(validate_path) = args.validate_config {
        if !validate_path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file does not exist: {}",
                validate_path.display()
            ));
        }

        let config = Config::from_file(&validate_path)
            .map_err(|err| anyhow::anyhow!("Configuration validation failed: {}", err))?;
        println!(
            "Configuration file is valid: {} ({} tanks)",
            validate_path.display(),
            config.tank_count()
        );
        return Ok(());
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let mut config = Config::from_file(&config_path)?;

    config.apply_args(args.web_port, args.web_address.clone(), args.plan.clone());

    info!(
        "Starting {} with {} tanks",
        config.controller.name,
        config.tank_count()
    );
    let mut daemon = Daemon::new();
    daemon.launch(&config).await?;

    tokio::select! {
        received = shutdown_signal() => match received {
            Ok(name) => info!("Received {}, terminating daemon", name),
            Err(err) => error!("Error waiting for shutdown signal: {}", err),
        },
        _ = daemon.stopped() => error!("Control stopped on its own, terminating daemon"),
    }
    daemon.shutdown().await;
    daemon.join().await?;

    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM from a service manager
#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        received = signal::ctrl_c() => received.map(|_| "Ctrl+C").map_err(Into::into),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str> {
    signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
