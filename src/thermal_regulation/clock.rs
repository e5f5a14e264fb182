// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Controller time source
//!
//! The controller works in local wall-clock time ("START 13:00" means 1 PM on
//! the controller's clock). The clock can be re-synchronized at runtime by an
//! administrative request without touching the host clock.

use chrono::{Duration, Local, NaiveDateTime};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Current absolute time, settable
pub trait Clock: Send + Sync {
    /// Current local time
    fn now(&self) -> NaiveDateTime;

    /// Re-synchronize the clock so that `now()` returns `time` at this instant
    fn set(&self, time: NaiveDateTime);
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// Host clock with a settable offset
#[derive(Debug, Default)]
pub struct SystemClock {
    offset_ms: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset currently applied on top of the host clock
    pub fn offset(&self) -> Duration {
        Duration::milliseconds(self.offset_ms.load(Ordering::Relaxed))
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local() + self.offset()
    }

    fn set(&self, time: NaiveDateTime) {
        let host = Local::now().naive_local();
        let offset = time.signed_duration_since(host).num_milliseconds();
        self.offset_ms.store(offset, Ordering::Relaxed);
    }
}

/// Manually driven clock for simulations and tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, time: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }
}
