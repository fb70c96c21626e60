// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Multi-device IMU aggregation and pose-fusion engine for USB-attached XR
//! glasses: per-vendor device adapters, a connection pool that elects a
//! primary/supplemental pair and time-syncs their streams, and an output
//! pipeline that publishes the fused pose to shared memory.

pub mod adapters;
pub mod ahrs;
pub mod buffer;
pub mod config;
pub mod device;
pub mod device_handle;
pub mod error;
pub mod hotplug;
pub mod output;
pub mod pool;
pub mod quaternion;
pub mod rate;
pub mod shm;
pub mod system;
pub mod timesync;

pub use device::{DeviceDriver, DeviceProperties, DisplayMode, ImuPose, LookAheadCalibration};
pub use error::{Error, Result};
pub use quaternion::{Euler, Quat};
pub use system::System;
