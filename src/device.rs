// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! The device-adapter contract and the data that flows across it.
//!
//! Each vendor implements [`DeviceDriver`]; the connection pool holds
//! adapters behind `Arc<dyn DeviceDriver>` rather than the function-pointer
//! vtable the original C driver uses for the same purpose (see Design Notes).

use crate::error::Result;
use crate::quaternion::Quat;

/// A single fused-or-raw orientation sample delivered by an adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuPose {
    pub orientation: Quat,
    pub position: [f32; 3],
    pub has_orientation: bool,
    pub has_position: bool,
    /// Driver-relative monotonic timestamp, milliseconds.
    pub timestamp_ms: u32,
}

impl ImuPose {
    pub fn orientation_only(orientation: Quat, timestamp_ms: u32) -> Self {
        ImuPose {
            orientation,
            position: [0.0, 0.0, 0.0],
            has_orientation: true,
            has_position: false,
            timestamp_ms,
        }
    }

    pub fn with_position(orientation: Quat, position: [f32; 3], timestamp_ms: u32) -> Self {
        ImuPose {
            orientation,
            position,
            has_orientation: true,
            has_position: true,
            timestamp_ms,
        }
    }
}

/// Per-device calibration constants consumed (not computed) by the look-ahead
/// stage of the output pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LookAheadCalibration {
    pub constant_ms: f32,
    pub frametime_multiplier: f32,
    pub scanline_adjust_ms: f32,
    pub cap_ms: f32,
}

/// The descriptor a `supported_device` probe returns: everything the pool,
/// the output pipeline, and the shared-memory publisher need to know about a
/// device without holding a live handle to it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProperties {
    pub name: &'static str,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    pub display_resolution: (u32, u32),
    pub fov_degrees: f32,
    pub lens_distance_ratio: f32,
    pub imu_cycles_per_s: f32,
    pub imu_buffer_size: usize,
    pub look_ahead: LookAheadCalibration,
    pub sbs_mode_supported: bool,
    pub can_be_supplemental: bool,
    pub provides_orientation: bool,
    pub provides_position: bool,
    pub firmware_update_recommended: bool,
}

/// Side-by-side vs. single-plane display mode, with a bidirectional lookup
/// table per adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Single,
    SideBySide,
}

/// The capability set every vendor adapter implements. Mirrors the shape of
/// the `ARGlasses` trait this crate's dependency family uses, generalized
/// here to a multi-vendor, pool-driven lifecycle.
pub trait DeviceDriver: Send + Sync {
    /// Stable identity used by the pool and by adapters' own callbacks to
    /// refer back to a connection without holding a cyclic reference.
    fn driver_id(&self) -> &str;

    fn properties(&self) -> &DeviceProperties;

    /// Opens the transport, claims the interface, and enables the IMU
    /// stream. Idempotent: calling it while already connected succeeds.
    fn connect(&self) -> Result<bool>;

    /// Blocks until the device disconnects or an unrecoverable error occurs,
    /// invoking `on_pose` for every new sample in the common NWU frame.
    /// Must return promptly after [`DeviceDriver::disconnect`] is called
    /// with `soft = true`.
    fn block_on_device(&self, on_pose: &dyn Fn(ImuPose)) -> Result<()>;

    fn is_sbs_mode(&self) -> bool;

    fn set_sbs_mode(&self, enabled: bool) -> bool;

    fn is_connected(&self) -> bool;

    /// `soft`: the device is still physically present (e.g. role change).
    /// `!soft`: the device was physically unplugged.
    fn disconnect(&self, soft: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imu_pose_orientation_only_has_no_position() {
        let pose = ImuPose::orientation_only(Quat::IDENTITY, 42);
        assert!(pose.has_orientation);
        assert!(!pose.has_position);
        assert_eq!(pose.timestamp_ms, 42);
    }
}
