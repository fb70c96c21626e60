// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! VITURE adapter. Grounded on `original_source/src/viture.c` and
//! `include/sdks/viture_glasses_constants.h`.
//!
//! Unlike XREAL, the VITURE SDK delivers pre-fused Euler angles rather than
//! raw inertial samples or a quaternion; this is the adapter that exercises
//! the "accept either representation" rule (`DeviceDriver` only ever emits
//! quaternions — the Euler-to-quaternion conversion happens here).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};

use crate::adapters::RateLimitedLog;
use crate::device::{DeviceDriver, DeviceProperties, ImuPose, LookAheadCalibration};
use crate::error::{Error, Result};
use crate::quaternion::{Euler, Quat};

pub const VENDOR_ID: u16 = 0x35CA;

const IMU_TIMEOUT_MS: i32 = 250;

static MALFORMED_PACKET_LOG: RateLimitedLog = RateLimitedLog::new();

/// `{x:0.5, y:-0.5, z:-0.5, w:0.5}` in the original driver.
const CONVERSION_QUAT: Quat = Quat { x: 0.5, y: -0.5, z: -0.5, w: 0.5 };

pub fn properties_for(product_id: u16, bus_number: u8, address: u8) -> DeviceProperties {
    DeviceProperties {
        name: "VITURE One",
        vendor_id: VENDOR_ID,
        product_id,
        bus_number,
        address,
        display_resolution: (1920, 1080),
        fov_degrees: 46.0,
        lens_distance_ratio: 0.035,
        imu_cycles_per_s: 60.0,
        imu_buffer_size: 1,
        look_ahead: LookAheadCalibration {
            constant_ms: 10.0,
            frametime_multiplier: 0.3,
            scanline_adjust_ms: 0.0,
            cap_ms: 40.0,
        },
        sbs_mode_supported: false,
        can_be_supplemental: true,
        provides_orientation: true,
        provides_position: false,
        firmware_update_recommended: false,
    }
}

/// Reassembles a big-endian-packed `f32` from 4 bytes, matching the
/// original's `makeFloat` byte-reversal decode.
fn make_float(data: &[u8]) -> Result<f32> {
    if data.len() < 4 {
        return Err(Error::MalformedPacket("viture: short euler field"));
    }
    Ok(f32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

fn parse_euler_report(data: &[u8]) -> Result<Euler> {
    if data.len() < 12 {
        return Err(Error::MalformedPacket("viture: short report"));
    }
    Ok(Euler {
        roll: make_float(&data[0..4])?,
        pitch: make_float(&data[4..8])?,
        yaw: make_float(&data[8..12])?,
    })
}

struct State {
    device: Option<HidDevice>,
}

pub struct VitureDriver {
    driver_id: String,
    properties: DeviceProperties,
    state: Mutex<State>,
    stop_requested: AtomicBool,
}

impl VitureDriver {
    pub fn new(driver_id: String, product_id: u16, bus_number: u8, address: u8) -> Self {
        VitureDriver {
            driver_id,
            properties: properties_for(product_id, bus_number, address),
            state: Mutex::new(State { device: None }),
            stop_requested: AtomicBool::new(false),
        }
    }
}

impl DeviceDriver for VitureDriver {
    fn driver_id(&self) -> &str {
        &self.driver_id
    }

    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn connect(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.device.is_some() {
            return Ok(true);
        }
        let api = HidApi::new().map_err(Error::HidError)?;
        let device = api
            .open(self.properties.vendor_id, self.properties.product_id)
            .map_err(Error::HidError)?;
        log::info!("viture: connected to {}", self.driver_id);
        state.device = Some(device);
        Ok(true)
    }

    fn block_on_device(&self, on_pose: &dyn Fn(ImuPose)) -> Result<()> {
        self.stop_requested.store(false, Ordering::SeqCst);
        let mut timestamp_ms: u32 = 0;

        let result = loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break Ok(());
            }

            let mut packet = [0u8; 64];
            let read_result = {
                let state = self.state.lock().unwrap();
                match &state.device {
                    Some(device) => device.read_timeout(&mut packet, IMU_TIMEOUT_MS),
                    None => break Err(Error::DeviceGone("viture: not connected")),
                }
            };

            let n = match read_result {
                Ok(n) => n,
                Err(_) => break Err(Error::DeviceGone("viture: read failed")),
            };
            if n == 0 {
                continue;
            }

            match parse_euler_report(&packet[..n]) {
                Ok(euler) => {
                    let imu_quat = Quat::from_euler_zyx(&euler);
                    let converted = imu_quat.multiply(&CONVERSION_QUAT);
                    timestamp_ms = timestamp_ms.wrapping_add(16); // ~60 Hz cadence
                    on_pose(ImuPose::orientation_only(converted, timestamp_ms));
                }
                Err(e) => {
                    MALFORMED_PACKET_LOG.warn(&format!("viture: malformed packet: {e}"));
                    continue;
                }
            }
        };

        if let Err(e) = &result {
            log::warn!("viture: worker loop for {} exiting: {e}", self.driver_id);
        }
        result
    }

    fn is_sbs_mode(&self) -> bool {
        false
    }

    fn set_sbs_mode(&self, _enabled: bool) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().device.is_some()
    }

    fn disconnect(&self, soft: bool) {
        self.stop_requested.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(IMU_TIMEOUT_MS as u64 / 4));
        if !soft {
            self.state.lock().unwrap().device = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn make_float_matches_byte_reversal() {
        let be_bytes = 1.5f32.to_be_bytes();
        assert_relative_eq!(make_float(&be_bytes).unwrap(), 1.5, epsilon = 1e-6);
    }

    #[test]
    fn parse_euler_report_rejects_short_input() {
        assert!(parse_euler_report(&[0u8; 4]).is_err());
    }

    #[test]
    fn euler_to_quat_applies_conversion() {
        let euler = Euler { roll: 0.0, pitch: 0.0, yaw: 0.0 };
        let q = Quat::from_euler_zyx(&euler).multiply(&CONVERSION_QUAT);
        // Identity euler rotated by the fixed conversion quat should just be
        // the conversion quat itself (already unit-norm).
        assert_relative_eq!(q.magnitude(), 1.0, epsilon = 1e-5);
    }
}
