// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Per-stream sample-rate estimator, grounded on
//! `original_source/include/imu_time_sync.h`'s `imu_rate_estimator_t`.

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Samples considered before the estimator reports `ready()`.
pub const READY_THRESHOLD: usize = 100;

/// Sliding window of sample timestamps (milliseconds) used to estimate a
/// stream's rate in Hz.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    timestamps: VecDeque<u32>,
    window: usize,
    ready_threshold: usize,
}

impl RateEstimator {
    pub fn new(window: usize) -> Self {
        Self::with_ready_threshold(window, READY_THRESHOLD)
    }

    /// Like [`RateEstimator::new`], but with an explicit readiness threshold
    /// rather than the default [`READY_THRESHOLD`], per
    /// [`crate::config::Config::rate_estimator_ready_threshold`].
    pub fn with_ready_threshold(window: usize, ready_threshold: usize) -> Self {
        RateEstimator { timestamps: VecDeque::with_capacity(window), window, ready_threshold }
    }

    pub fn add(&mut self, timestamp_ms: u32) {
        if self.timestamps.len() == self.window {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(timestamp_ms);
    }

    pub fn ready(&self) -> bool {
        self.timestamps.len() >= self.ready_threshold
    }

    pub fn reset(&mut self) {
        self.timestamps.clear();
    }

    pub fn sample_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Estimated rate in Hz, clamped to a minimum of 0.1 Hz. `NotReady` before
    /// [`READY_THRESHOLD`] samples have accumulated.
    pub fn rate_hz(&self) -> Result<f32> {
        if !self.ready() {
            return Err(Error::NotReady);
        }
        let first = *self.timestamps.front().unwrap();
        let last = *self.timestamps.back().unwrap();
        let span_s = (last - first) as f32 / 1000.0;
        if span_s <= 0.0 {
            return Ok(0.1);
        }
        let rate = (self.timestamps.len() as f32 - 1.0) / span_s;
        Ok(rate.max(0.1))
    }

    /// Span from the oldest to newest timestamp, in seconds.
    pub fn duration_seconds(&self) -> Result<f32> {
        if !self.ready() {
            return Err(Error::NotReady);
        }
        let first = *self.timestamps.front().unwrap();
        let last = *self.timestamps.back().unwrap();
        Ok((last - first) as f32 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn not_ready_below_threshold() {
        let mut re = RateEstimator::new(200);
        for i in 0..50 {
            re.add(i * 10);
        }
        assert!(!re.ready());
        assert!(matches!(re.rate_hz(), Err(Error::NotReady)));
    }

    #[test]
    fn ready_at_threshold_estimates_rate() {
        let mut re = RateEstimator::new(200);
        for i in 0..150u32 {
            re.add(i * 10);
        }
        assert!(re.ready());
        assert_relative_eq!(re.rate_hz().unwrap(), 100.0, epsilon = 0.5);
    }

    #[test]
    fn window_evicts_oldest_samples() {
        let mut re = RateEstimator::new(100);
        for i in 0..500u32 {
            re.add(i * 10);
        }
        assert_eq!(re.sample_count(), 100);
    }

    #[test]
    fn rate_never_below_floor() {
        let mut re = RateEstimator::new(200);
        for _ in 0..150 {
            re.add(0);
        }
        assert_relative_eq!(re.rate_hz().unwrap(), 0.1, epsilon = 1e-6);
    }
}
