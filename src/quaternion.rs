// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Quaternion and Euler-angle math shared by every adapter and the pool.
//!
//! Hamilton convention, NWU world frame (X=north, Y=west, Z=up). All
//! quaternions that leave this module are unit-norm.

use std::ops::{Add, Mul};

/// A unit (or near-unit) quaternion in `(x, y, z, w)` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

/// Roll/pitch/yaw in degrees, ZYX intrinsic order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Euler {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Quat { x, y, z, w }
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }

    /// Normalizes to unit length. Returns the identity quaternion on a
    /// degenerate (near-zero) input rather than dividing by zero.
    pub fn normalize(&self) -> Quat {
        let mag = self.magnitude();
        if mag < 1e-9 {
            return Quat::IDENTITY;
        }
        Quat::new(self.x / mag, self.y / mag, self.z / mag, self.w / mag)
    }

    pub fn conjugate(&self) -> Quat {
        Quat::new(-self.x, -self.y, -self.z, self.w)
    }

    /// Hamilton product, renormalized.
    pub fn multiply(&self, other: &Quat) -> Quat {
        let (a, b) = (self, other);
        let raw = Quat::new(
            a.w * b.x + a.x * b.w + a.y * b.z - a.z * b.y,
            a.w * b.y - a.x * b.z + a.y * b.w + a.z * b.x,
            a.w * b.z + a.x * b.y - a.y * b.x + a.z * b.w,
            a.w * b.w - a.x * b.x - a.y * b.y - a.z * b.z,
        );
        raw.normalize()
    }

    /// Builds a quaternion from ZYX (roll about X, pitch about Y, yaw about Z)
    /// Euler angles given in degrees.
    pub fn from_euler_zyx(e: &Euler) -> Quat {
        let (roll, pitch, yaw) = (e.roll.to_radians(), e.pitch.to_radians(), e.yaw.to_radians());
        let (sr, cr) = (roll * 0.5).sin_cos();
        let (sp, cp) = (pitch * 0.5).sin_cos();
        let (sy, cy) = (yaw * 0.5).sin_cos();

        Quat::new(
            sr * cp * cy - cr * sp * sy,
            cr * sp * cy + sr * cp * sy,
            cr * cp * sy - sr * sp * cy,
            cr * cp * cy + sr * sp * sy,
        )
    }

    /// Inverse of [`Quat::from_euler_zyx`]. Pitch is clamped to +/-90 degrees
    /// at the gimbal rather than producing a NaN.
    pub fn to_euler_zyx(&self) -> Euler {
        let (x, y, z, w) = (self.x, self.y, self.z, self.w);

        let sinr_cosp = 2.0 * (w * x + y * z);
        let cosr_cosp = 1.0 - 2.0 * (x * x + y * y);
        let roll = sinr_cosp.atan2(cosr_cosp);

        let sinp = 2.0 * (w * y - z * x);
        let pitch = if sinp.abs() >= 1.0 {
            std::f32::consts::FRAC_PI_2.copysign(sinp)
        } else {
            sinp.asin()
        };

        let siny_cosp = 2.0 * (w * z + x * y);
        let cosy_cosp = 1.0 - 2.0 * (y * y + z * z);
        let yaw = siny_cosp.atan2(cosy_cosp);

        Euler {
            roll: roll.to_degrees(),
            pitch: pitch.to_degrees(),
            yaw: yaw.to_degrees(),
        }
    }

    /// Angular distance between two unit quaternions, in radians:
    /// `2 * acos(clamp(|(b * conj(a)).w|, 0, 1))`.
    pub fn angular_distance(a: &Quat, b: &Quat) -> f32 {
        let rel = b.multiply(&a.conjugate());
        let w = rel.w.abs().clamp(0.0, 1.0);
        2.0 * w.acos()
    }
}

impl Mul for Quat {
    type Output = Quat;
    fn mul(self, rhs: Quat) -> Quat {
        self.multiply(&rhs)
    }
}

impl Add for Quat {
    type Output = Quat;
    fn add(self, rhs: Quat) -> Quat {
        Quat::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z, self.w + rhs.w)
    }
}

/// Component-wise linear interpolation between two quaternions followed by
/// renormalization, used by the pool's blend step (see Design Notes: kept as
/// the specified minimum rather than true slerp).
pub fn lerp_normalize(a: &Quat, b: &Quat, w: f32) -> Quat {
    let w = w.clamp(0.0, 1.0);
    let blended = Quat::new(
        a.x * (1.0 - w) + b.x * w,
        a.y * (1.0 - w) + b.y * w,
        a.z * (1.0 - w) + b.z * w,
        a.w * (1.0 - w) + b.w * w,
    );
    blended.normalize()
}

/// Wrapped difference between two angles in degrees, result in (-180, 180].
pub fn degree_delta(a: f32, b: f32) -> f32 {
    let mut delta = a - b;
    if delta > 180.0 {
        delta -= 360.0;
    } else if delta < -180.0 {
        delta += 360.0;
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn normalize_is_unit_length() {
        let q = Quat::new(1.0, 2.0, 3.0, 4.0).normalize();
        assert_relative_eq!(q.magnitude(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn normalize_degenerate_input_is_identity() {
        let q = Quat::new(0.0, 0.0, 0.0, 0.0).normalize();
        assert_eq!(q, Quat::IDENTITY);
    }

    #[test]
    fn conjugate_of_identity_is_identity() {
        assert_eq!(Quat::IDENTITY.conjugate(), Quat::IDENTITY);
    }

    #[test]
    fn multiply_by_identity_is_noop() {
        let q = Quat::new(0.1, 0.2, 0.3, 0.9).normalize();
        let result = q.multiply(&Quat::IDENTITY);
        assert_relative_eq!(result.x, q.x, epsilon = 1e-5);
        assert_relative_eq!(result.w, q.w, epsilon = 1e-5);
    }

    #[test]
    fn euler_round_trip() {
        let e = Euler { roll: 10.0, pitch: -20.0, yaw: 45.0 };
        let q = Quat::from_euler_zyx(&e);
        let back = q.to_euler_zyx();
        assert_relative_eq!(back.roll, e.roll, epsilon = 1e-3);
        assert_relative_eq!(back.pitch, e.pitch, epsilon = 1e-3);
        assert_relative_eq!(back.yaw, e.yaw, epsilon = 1e-3);
    }

    #[test]
    fn angular_distance_identity_is_zero() {
        let d = Quat::angular_distance(&Quat::IDENTITY, &Quat::IDENTITY);
        assert_relative_eq!(d, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn angular_distance_90_degrees() {
        let q = Quat::from_euler_zyx(&Euler { roll: 0.0, pitch: 0.0, yaw: 90.0 });
        let d = Quat::angular_distance(&Quat::IDENTITY, &q);
        assert_relative_eq!(d.to_degrees(), 90.0, epsilon = 1e-2);
    }

    #[test]
    fn degree_delta_wraps() {
        assert_relative_eq!(degree_delta(170.0, -170.0), -20.0, epsilon = 1e-4);
        assert_relative_eq!(degree_delta(-170.0, 170.0), 20.0, epsilon = 1e-4);
    }

    #[test]
    fn lerp_normalize_at_zero_is_a() {
        let a = Quat::from_euler_zyx(&Euler { roll: 5.0, pitch: 0.0, yaw: 0.0 });
        let b = Quat::from_euler_zyx(&Euler { roll: 45.0, pitch: 0.0, yaw: 0.0 });
        let result = lerp_normalize(&a, &b, 0.0);
        assert_relative_eq!(result.x, a.x, epsilon = 1e-5);
    }
}
