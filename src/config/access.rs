// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Access control configuration
//!
//! Administrative commands (plan replacement, log rolling, pause, clock
//! synchronization, reboot) require a shared passphrase, the "magic word".
//! Read-only queries never require it.

use serde::{Deserialize, Serialize};

/// Shared-secret access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Passphrase expected in the `X-Magic-Word` header of administrative
    /// requests. An empty passphrase denies every administrative request.
    #[serde(default = "default_magic_word")]
    pub magic_word: String,
}

impl AccessConfig {
    /// Compare a presented passphrase with the configured one
    pub fn accepts(&self, presented: Option<&str>) -> bool {
        match presented {
            Some(word) => !self.magic_word.is_empty() && word == self.magic_word,
            None => false,
        }
    }
}

fn default_magic_word() -> String {
    "please".to_string()
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            magic_word: default_magic_word(),
        }
    }
}
