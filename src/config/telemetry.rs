// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Telemetry log configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Location and query limits of the telemetry log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Directory holding the live log and its archives
    #[serde(default = "default_directory")]
    pub directory: String,

    /// File name of the live log inside `directory`
    #[serde(default = "default_file_name")]
    pub file_name: String,

    /// Upper bound on samples returned by a single query
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl TelemetryConfig {
    /// Full path of the live log
    pub fn log_path(&self) -> PathBuf {
        PathBuf::from(&self.directory).join(&self.file_name)
    }
}

fn default_directory() -> String {
    "telemetry".to_string()
}

fn default_file_name() -> String {
    "log.jsonl".to_string()
}

fn default_max_batch() -> usize {
    1000
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            file_name: default_file_name(),
            max_batch: default_max_batch(),
        }
    }
}
