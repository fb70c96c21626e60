// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Tunable parameters loaded from an optional TOML blob, standing in for the
//! excluded CLI/file-parsing glue (`original_source/include/config.h`).
//! These are tunables, not contracts: callers may also construct a [`Config`]
//! directly and skip the file entirely.

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Window over which the time-sync engine accumulates angular-motion
    /// samples before attempting an offset computation.
    pub window_duration_s: f32,
    /// Number of timestamps the rate estimator retains.
    pub rate_estimator_window: usize,
    /// Samples required before the rate estimator reports `ready()`.
    pub rate_estimator_ready_threshold: usize,
    /// Extra slack applied when sizing the time-sync ring buffers, as a
    /// fraction of the computed minimum (e.g. `1.2` = 20% headroom).
    pub time_sync_buffer_margin: f32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            window_duration_s: 5.0,
            rate_estimator_window: 200,
            rate_estimator_ready_threshold: crate::rate::READY_THRESHOLD,
            time_sync_buffer_margin: 1.2,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_tunables() {
        let cfg = Config::default();
        assert_eq!(cfg.window_duration_s, 5.0);
        assert_eq!(cfg.rate_estimator_ready_threshold, 100);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = Config::from_toml_str("window_duration_s = 3.0\n").unwrap();
        assert_eq!(cfg.window_duration_s, 3.0);
        assert_eq!(cfg.rate_estimator_window, 200);
    }
}
