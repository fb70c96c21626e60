// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Per-vendor device adapters. Each module implements [`crate::device::DeviceDriver`]
//! for one vendor family, grounded on the corresponding file under
//! `original_source/src/devices/` and, for XREAL, on the packet layout
//! originally documented by thejackimonster's `nrealAirLinuxDriver`.

pub mod rayneo;
pub mod rokid;
pub mod viture;
pub mod xreal;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::device::DisplayMode;

/// Throttles a single log line to once per second, standing in for the
/// original's rate-limited "malformed packet" logging.
pub(crate) struct RateLimitedLog {
    last_logged: Mutex<Option<Instant>>,
}

impl RateLimitedLog {
    pub const fn new() -> Self {
        RateLimitedLog { last_logged: Mutex::new(None) }
    }

    pub fn warn(&self, message: &str) {
        let mut last = self.last_logged.lock().unwrap();
        let now = Instant::now();
        let should_log = match *last {
            Some(prev) => now.duration_since(prev) >= Duration::from_secs(1),
            None => true,
        };
        if should_log {
            *last = Some(now);
            log::warn!("{}", message);
        }
    }
}

/// Rate-limits adapters that sample faster than the delivery target, mirroring
/// `FORCED_CYCLE_TIME_MS` throttling in the XREAL and RayNeo drivers.
pub(crate) struct RateLimiter {
    min_interval_ms: f32,
    last_emit_ms: Option<u32>,
}

impl RateLimiter {
    pub fn new(target_hz: f32) -> Self {
        RateLimiter { min_interval_ms: (1000.0 / target_hz) * 0.95, last_emit_ms: None }
    }

    /// Returns `true` if enough time has passed since the last emitted
    /// sample for `timestamp_ms` to be forwarded downstream.
    pub fn should_emit(&mut self, timestamp_ms: u32) -> bool {
        match self.last_emit_ms {
            None => {
                self.last_emit_ms = Some(timestamp_ms);
                true
            }
            Some(last) => {
                let elapsed = timestamp_ms.wrapping_sub(last) as f32;
                if elapsed >= self.min_interval_ms {
                    self.last_emit_ms = Some(timestamp_ms);
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// A bidirectional single-/side-by-side display mode lookup, keyed by a
/// vendor's own mode byte. Grounded on `sbs_display_modes`/
/// `non_sbs_display_modes` in `original_source/src/devices/xreal.c`; the
/// actual mode-switch command bytes are vendor-proprietary and unimplemented
/// here (see SPEC_FULL.md 1.2).
pub(crate) struct SbsModeTable {
    pairs: &'static [(u8, u8)],
}

impl SbsModeTable {
    pub const fn new(pairs: &'static [(u8, u8)]) -> Self {
        SbsModeTable { pairs }
    }

    pub fn to_sbs(&self, mode_byte: u8) -> Option<u8> {
        self.pairs.iter().find(|(non_sbs, _)| *non_sbs == mode_byte).map(|(_, sbs)| *sbs)
    }

    pub fn to_single(&self, mode_byte: u8) -> Option<u8> {
        self.pairs.iter().find(|(_, sbs)| *sbs == mode_byte).map(|(non_sbs, _)| *non_sbs)
    }

    pub fn display_mode_of(&self, mode_byte: u8) -> DisplayMode {
        if self.pairs.iter().any(|(_, sbs)| *sbs == mode_byte) {
            DisplayMode::SideBySide
        } else {
            DisplayMode::Single
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_admits_first_sample() {
        let mut rl = RateLimiter::new(250.0);
        assert!(rl.should_emit(0));
    }

    #[test]
    fn rate_limiter_throttles_fast_samples() {
        let mut rl = RateLimiter::new(250.0);
        assert!(rl.should_emit(0));
        assert!(!rl.should_emit(1));
        assert!(rl.should_emit(10));
    }

    #[test]
    fn rate_limited_log_suppresses_immediate_repeat() {
        let log = RateLimitedLog::new();
        assert!(log.last_logged.lock().unwrap().is_none());
        log.warn("first");
        assert!(log.last_logged.lock().unwrap().is_some());
        let first = log.last_logged.lock().unwrap().unwrap();
        log.warn("second, too soon");
        assert_eq!(*log.last_logged.lock().unwrap(), Some(first));
    }

    #[test]
    fn sbs_table_round_trips() {
        let table = SbsModeTable::new(&[(1, 3), (5, 9)]);
        assert_eq!(table.to_sbs(1), Some(3));
        assert_eq!(table.to_single(3), Some(1));
        assert_eq!(table.display_mode_of(3), DisplayMode::SideBySide);
        assert_eq!(table.display_mode_of(1), DisplayMode::Single);
    }
}
