// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! AHRS (Attitude and Heading Reference System) sensor-fusion filter.
//!
//! Used by adapters that surface raw inertial data (currently XREAL) rather
//! than a pre-fused orientation from a vendor SDK. No exact crates.io
//! equivalent covers the acceleration/magnetic-rejection parameters this
//! driver family relies on (the `ahrs` crate implements only a bare
//! Madgwick filter), so this is a direct port of the gain/rejection/timeout
//! model described for XREAL's IMU pipeline, hand-rolled against that
//! description rather than against any single dependency.

use crate::quaternion::Quat;

/// Tunable parameters for [`AhrsFilter`].
#[derive(Debug, Clone, Copy)]
pub struct AhrsConfig {
    /// Proportional gain applied to the accelerometer/magnetometer correction.
    pub gain: f32,
    /// Reject accelerometer corrections when gravity direction error exceeds
    /// this many degrees.
    pub acceleration_rejection_deg: f32,
    /// Reject magnetometer corrections when heading error exceeds this many degrees.
    pub magnetic_rejection_deg: f32,
    /// If a rejection condition persists this long, it is ignored anyway
    /// (prevents permanent drift when the rejection gate never reopens).
    pub rejection_timeout_s: f32,
    /// Sample rate used to integrate gyro readings, in Hz.
    pub sample_rate_hz: f32,
}

impl Default for AhrsConfig {
    fn default() -> Self {
        AhrsConfig {
            gain: 0.5,
            acceleration_rejection_deg: 10.0,
            magnetic_rejection_deg: 20.0,
            rejection_timeout_s: 5.0,
            sample_rate_hz: 1000.0,
        }
    }
}

/// A Mahony-style complementary filter: gyro integration corrected toward
/// the accelerometer's gravity vector and the magnetometer's heading, with
/// each correction source gated out when it disagrees too strongly with the
/// current estimate (rejection), and forcibly re-admitted after a timeout.
pub struct AhrsFilter {
    config: AhrsConfig,
    orientation: Quat,
    accel_rejected_for_s: f32,
    mag_rejected_for_s: f32,
}

impl AhrsFilter {
    pub fn new(config: AhrsConfig) -> Self {
        AhrsFilter {
            config,
            orientation: Quat::IDENTITY,
            accel_rejected_for_s: 0.0,
            mag_rejected_for_s: 0.0,
        }
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    pub fn reset(&mut self) {
        self.orientation = Quat::IDENTITY;
        self.accel_rejected_for_s = 0.0;
        self.mag_rejected_for_s = 0.0;
    }

    /// Integrates one IMU sample. `gyro` is in degrees/sec, `accel` and
    /// `mag` are raw vectors (units do not matter, only direction is used).
    /// `dt_s` is the time since the previous update.
    pub fn update(&mut self, gyro: [f32; 3], accel: [f32; 3], mag: [f32; 3], dt_s: f32) {
        let dt = if dt_s > 0.0 { dt_s } else { 1.0 / self.config.sample_rate_hz };

        let gravity_body = self.estimated_gravity_direction();
        let accel_norm = normalize3(accel);
        let accel_error_deg = angle_between(accel_norm, gravity_body).to_degrees();
        let use_accel = accel_norm != [0.0, 0.0, 0.0]
            && (accel_error_deg <= self.config.acceleration_rejection_deg
                || self.accel_rejected_for_s >= self.config.rejection_timeout_s);
        if use_accel {
            self.accel_rejected_for_s = 0.0;
        } else {
            self.accel_rejected_for_s += dt;
        }

        let heading_body = self.estimated_north_direction();
        let mag_norm = normalize3(mag);
        let mag_error_deg = angle_between(mag_norm, heading_body).to_degrees();
        let use_mag = mag_norm != [0.0, 0.0, 0.0]
            && (mag_error_deg <= self.config.magnetic_rejection_deg
                || self.mag_rejected_for_s >= self.config.rejection_timeout_s);
        if use_mag {
            self.mag_rejected_for_s = 0.0;
        } else {
            self.mag_rejected_for_s += dt;
        }

        let mut correction = [0.0f32; 3];
        if use_accel {
            let e = cross(accel_norm, gravity_body);
            for i in 0..3 {
                correction[i] += e[i];
            }
        }
        if use_mag {
            let e = cross(mag_norm, heading_body);
            for i in 0..3 {
                correction[i] += e[i];
            }
        }

        let gyro_rad = [gyro[0].to_radians(), gyro[1].to_radians(), gyro[2].to_radians()];
        let corrected = [
            gyro_rad[0] + self.config.gain * correction[0],
            gyro_rad[1] + self.config.gain * correction[1],
            gyro_rad[2] + self.config.gain * correction[2],
        ];

        let delta = Quat::new(
            corrected[0] * 0.5 * dt,
            corrected[1] * 0.5 * dt,
            corrected[2] * 0.5 * dt,
            1.0,
        );
        self.orientation = self.orientation.multiply(&delta);
    }

    fn estimated_gravity_direction(&self) -> [f32; 3] {
        let q = self.orientation.conjugate();
        rotate_vector(q, [0.0, 0.0, 1.0])
    }

    fn estimated_north_direction(&self) -> [f32; 3] {
        let q = self.orientation.conjugate();
        rotate_vector(q, [1.0, 0.0, 0.0])
    }
}

fn normalize3(v: [f32; 3]) -> [f32; 3] {
    let mag = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if mag < 1e-9 {
        return [0.0, 0.0, 0.0];
    }
    [v[0] / mag, v[1] / mag, v[2] / mag]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn angle_between(a: [f32; 3], b: [f32; 3]) -> f32 {
    if a == [0.0, 0.0, 0.0] || b == [0.0, 0.0, 0.0] {
        return 0.0;
    }
    let dot = (a[0] * b[0] + a[1] * b[1] + a[2] * b[2]).clamp(-1.0, 1.0);
    dot.acos()
}

fn rotate_vector(q: Quat, v: [f32; 3]) -> [f32; 3] {
    let p = Quat::new(v[0], v[1], v[2], 0.0);
    let rotated = q.multiply(&p).multiply(&q.conjugate());
    [rotated.x, rotated.y, rotated.z]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn stationary_filter_stays_near_identity() {
        let mut filter = AhrsFilter::new(AhrsConfig::default());
        for _ in 0..200 {
            filter.update([0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0], 0.001);
        }
        let o = filter.orientation();
        assert_relative_eq!(o.magnitude(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn gyro_only_integration_accumulates_rotation() {
        let mut filter = AhrsFilter::new(AhrsConfig { gain: 0.0, ..AhrsConfig::default() });
        // 90 deg/s about Z for 1 second at 100 Hz.
        for _ in 0..100 {
            filter.update([0.0, 0.0, 90.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0], 0.01);
        }
        let euler = filter.orientation().to_euler_zyx();
        assert_relative_eq!(euler.yaw.abs(), 90.0, epsilon = 2.0);
    }

    #[test]
    fn reset_restores_identity() {
        let mut filter = AhrsFilter::new(AhrsConfig::default());
        filter.update([10.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0], 0.01);
        filter.reset();
        assert_eq!(filter.orientation(), Quat::IDENTITY);
    }
}
