// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Cross-stream time-sync engine: estimates the temporal offset between two
//! IMU-derived angular-motion signals via FFT-based cross-correlation.
//!
//! Grounded on `original_source/src/imu_time_sync.c` (`cross_correlate_fft`,
//! `resample_signal`, `normalize_signal`, `parabolic_interpolation`), reusing
//! `rustfft` for the FFT plans in place of the original's FFTW bindings.

use std::sync::Arc;

use rustfft::{num_complex::Complex32, Fft, FftPlanner};

use crate::buffer::RingBuffer;
use crate::error::{Error, Result};
use crate::quaternion::{Euler, Quat};

/// Result of a successful offset computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Offset {
    /// Seconds stream 2 lags stream 1 by (can be negative).
    pub offset_seconds: f32,
    /// Normalized peak correlation height, in `[0, 1]` in the typical case.
    pub confidence: f32,
}

/// Two parallel ring buffers of inter-sample angular motion, one per source,
/// plus the bookkeeping needed to fold either quaternion or Euler samples
/// into the same scalar signal.
pub struct TimeSync {
    buffer1: RingBuffer,
    buffer2: RingBuffer,
    prev_quat: [Option<Quat>; 2],
    prev_euler: [Option<Euler>; 2],
    sampling_rate: [f32; 2],
    window_duration_s: f32,
}

fn window_samples(window_duration_s: f32, rate1: f32, rate2: f32, buffer_margin: f32) -> usize {
    let rate = rate1.max(rate2);
    let computed = (window_duration_s * rate * buffer_margin).ceil() as usize;
    computed.max(8)
}

impl TimeSync {
    /// `buffer_margin` is the headroom multiplier applied over the minimum
    /// buffer size (e.g. `1.2` = 20% extra capacity), per [`crate::config::Config::time_sync_buffer_margin`].
    pub fn new(window_duration_s: f32, rate1: f32, rate2: f32, buffer_margin: f32) -> Self {
        let cap = window_samples(window_duration_s, rate1, rate2, buffer_margin);
        TimeSync {
            buffer1: RingBuffer::new(cap),
            buffer2: RingBuffer::new(cap),
            prev_quat: [None, None],
            prev_euler: [None, None],
            sampling_rate: [rate1, rate2],
            window_duration_s,
        }
    }

    fn buffer_mut(&mut self, source: usize) -> &mut RingBuffer {
        match source {
            0 => &mut self.buffer1,
            _ => &mut self.buffer2,
        }
    }

    /// Feeds a quaternion sample from stream `source` (0 or 1).
    pub fn add_quaternion_sample(&mut self, source: usize, q: Quat) {
        let motion = match self.prev_quat[source] {
            Some(prev) => Quat::angular_distance(&prev, &q),
            None => 0.0,
        };
        self.prev_quat[source] = Some(q);
        self.buffer_mut(source).push(motion);
    }

    /// Feeds an Euler sample from stream `source` (0 or 1), for adapters that
    /// only produce Euler triples (e.g. VITURE).
    pub fn add_euler_sample(&mut self, source: usize, e: Euler) {
        let motion = match self.prev_euler[source] {
            Some(prev) => {
                let dr = crate::quaternion::degree_delta(e.roll, prev.roll);
                let dp = crate::quaternion::degree_delta(e.pitch, prev.pitch);
                let dy = crate::quaternion::degree_delta(e.yaw, prev.yaw);
                (dr * dr + dp * dp + dy * dy).sqrt().to_radians()
            }
            None => 0.0,
        };
        self.prev_euler[source] = Some(e);
        self.buffer_mut(source).push(motion);
    }

    /// Ready once either buffer holds at least `window_duration_s * rate` samples.
    pub fn is_ready(&self) -> bool {
        let need1 = (self.window_duration_s * self.sampling_rate[0]) as usize;
        let need2 = (self.window_duration_s * self.sampling_rate[1]) as usize;
        self.buffer1.len() >= need1.max(1) || self.buffer2.len() >= need2.max(1)
    }

    pub fn reset(&mut self) {
        self.buffer1.reset();
        self.buffer2.reset();
        self.prev_quat = [None, None];
        self.prev_euler = [None, None];
    }

    /// Computes the temporal offset of stream 2 relative to stream 1.
    pub fn compute_offset(&self) -> Result<Offset> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        let sig1 = self.buffer1.to_vec();
        let sig2 = self.buffer2.to_vec();
        let target_len = sig1.len().max(sig2.len());
        if target_len < 2 {
            return Err(Error::NotReady);
        }

        let sig1 = resample_signal(&sig1, target_len);
        let sig2 = resample_signal(&sig2, target_len);
        let sig1 = normalize_signal(&sig1);
        let sig2 = normalize_signal(&sig2);

        let correlation = cross_correlate_fft(&sig1, &sig2)?;
        let (peak_idx, peak_val) = find_max_index(&correlation);
        let delta = parabolic_interpolation(&correlation, peak_idx);

        let zero_lag = (target_len - 1) as f32;
        let lag_samples = (peak_idx as f32 - zero_lag) + delta;
        let avg_rate = (self.sampling_rate[0] + self.sampling_rate[1]) / 2.0;
        if avg_rate <= 0.0 {
            return Err(Error::NotReady);
        }

        Ok(Offset {
            offset_seconds: lag_samples / avg_rate,
            confidence: (peak_val / target_len as f32).clamp(0.0, 1.0),
        })
    }
}

/// Linear-interpolation resample of `signal` to `target_len` samples.
fn resample_signal(signal: &[f32], target_len: usize) -> Vec<f32> {
    if signal.len() == target_len || signal.is_empty() {
        return signal.to_vec();
    }
    if signal.len() == 1 {
        return vec![signal[0]; target_len];
    }
    let src_len = signal.len();
    (0..target_len)
        .map(|i| {
            let pos = i as f32 * (src_len - 1) as f32 / (target_len - 1).max(1) as f32;
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(src_len - 1);
            let frac = pos - lo as f32;
            signal[lo] * (1.0 - frac) + signal[hi] * frac
        })
        .collect()
}

/// Zero-mean, unit-variance normalization. Guards against a near-zero
/// standard deviation (flat signal) by returning an all-zero vector.
fn normalize_signal(signal: &[f32]) -> Vec<f32> {
    let n = signal.len() as f32;
    if n == 0.0 {
        return Vec::new();
    }
    let mean = signal.iter().sum::<f32>() / n;
    let variance = signal.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let std_dev = variance.sqrt();
    if std_dev < 1e-6 {
        return vec![0.0; signal.len()];
    }
    signal.iter().map(|v| (v - mean) / std_dev).collect()
}

fn next_pow2(n: usize) -> usize {
    let mut p = 1;
    while p < n {
        p <<= 1;
    }
    p
}

/// FFT-based "full" cross-correlation of two equal-length signals. The
/// result is arranged so index `len-1` represents zero lag.
fn cross_correlate_fft(sig1: &[f32], sig2: &[f32]) -> Result<Vec<f32>> {
    let len = sig1.len();
    let out_len = 2 * len - 1;
    let fft_size = next_pow2(out_len);

    let mut planner = FftPlanner::<f32>::new();
    let fft: Arc<dyn Fft<f32>> = planner.plan_fft_forward(fft_size);
    let ifft: Arc<dyn Fft<f32>> = planner.plan_fft_inverse(fft_size);

    let mut buf1: Vec<Complex32> = sig1.iter().map(|&v| Complex32::new(v, 0.0)).collect();
    buf1.resize(fft_size, Complex32::new(0.0, 0.0));
    let mut buf2: Vec<Complex32> = sig2.iter().map(|&v| Complex32::new(v, 0.0)).collect();
    buf2.resize(fft_size, Complex32::new(0.0, 0.0));

    fft.process(&mut buf1);
    fft.process(&mut buf2);

    let mut product: Vec<Complex32> =
        buf1.iter().zip(buf2.iter()).map(|(a, b)| a * b.conj()).collect();

    ifft.process(&mut product);

    let scale = 1.0 / fft_size as f32;
    let raw: Vec<f32> = product.iter().map(|c| c.re * scale).collect();

    // `raw` holds the circular correlation: index 0 is zero lag, indices
    // 1..len-1 are positive lags, and the tail wraps around to negative
    // lags. Rearrange into the standard "full" layout where index `len-1`
    // is zero lag and the array reads lag -( len-1) .. (len-1).
    let mut full = vec![0.0f32; out_len];
    for lag in -(len as isize - 1)..=(len as isize - 1) {
        let circ_idx = lag.rem_euclid(fft_size as isize) as usize;
        let full_idx = (lag + len as isize - 1) as usize;
        full[full_idx] = raw[circ_idx];
    }
    Ok(full)
}

fn find_max_index(values: &[f32]) -> (usize, f32) {
    let mut best_idx = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    (best_idx, best_val)
}

/// Sub-sample refinement of a discrete peak via parabolic interpolation.
/// Returns `0.0` if the peak is at an edge or the denominator is near zero.
fn parabolic_interpolation(values: &[f32], peak_idx: usize) -> f32 {
    if peak_idx == 0 || peak_idx + 1 >= values.len() {
        return 0.0;
    }
    let (y_m1, y_0, y_p1) = (values[peak_idx - 1], values[peak_idx], values[peak_idx + 1]);
    let denom = y_m1 - 2.0 * y_0 + y_p1;
    if denom.abs() < 1e-9 {
        return 0.0;
    }
    0.5 * (y_m1 - y_p1) / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn resample_identity_when_same_length() {
        let sig = vec![1.0, 2.0, 3.0];
        assert_eq!(resample_signal(&sig, 3), sig);
    }

    #[test]
    fn resample_upsamples_linearly() {
        let sig = vec![0.0, 10.0];
        let resampled = resample_signal(&sig, 3);
        assert_relative_eq!(resampled[0], 0.0, epsilon = 1e-4);
        assert_relative_eq!(resampled[1], 5.0, epsilon = 1e-4);
        assert_relative_eq!(resampled[2], 10.0, epsilon = 1e-4);
    }

    #[test]
    fn normalize_flat_signal_is_zero() {
        let sig = vec![5.0; 10];
        let normalized = normalize_signal(&sig);
        assert!(normalized.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn normalize_has_zero_mean_unit_variance() {
        let sig = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let normalized = normalize_signal(&sig);
        let mean = normalized.iter().sum::<f32>() / normalized.len() as f32;
        assert_relative_eq!(mean, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn parabolic_interpolation_at_edge_is_zero() {
        let values = vec![1.0, 2.0, 3.0];
        assert_eq!(parabolic_interpolation(&values, 0), 0.0);
        assert_eq!(parabolic_interpolation(&values, 2), 0.0);
    }

    #[test]
    fn cross_correlate_finds_known_shift() {
        // sig2 is sig1 shifted right by 3 samples.
        let base: Vec<f32> =
            (0..64).map(|i| (i as f32 * 0.3).sin()).collect();
        let mut sig1 = base.clone();
        let mut sig2 = vec![0.0; 64];
        for i in 3..64 {
            sig2[i] = base[i - 3];
        }
        sig1 = normalize_signal(&sig1);
        sig2 = normalize_signal(&sig2);
        let corr = cross_correlate_fft(&sig1, &sig2).unwrap();
        let (peak_idx, _) = find_max_index(&corr);
        let zero_lag = 63;
        let lag = peak_idx as isize - zero_lag as isize;
        // sig2 lags sig1, so the correlation peak should sit near +3.
        assert!((lag - 3).abs() <= 1, "expected lag near 3, got {lag}");
    }

    #[test]
    fn not_ready_before_window_filled() {
        let ts = TimeSync::new(5.0, 100.0, 100.0, 1.2);
        assert!(matches!(ts.compute_offset(), Err(Error::NotReady)));
    }
}
