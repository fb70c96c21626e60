// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Rokid adapter. Grounded on `original_source/src/devices/rokid.c` and
//! `include/sdks/rokid.h`.
//!
//! The vendor SDK delivers a pre-fused quaternion in an east-up-south frame
//! over its own event queue; this adapter receives the equivalent data over
//! the HID transport its USB descriptor exposes and applies the same
//! east-up-south -> NWU adjustment (with the 5 degree factory calibration
//! offset folded in) that the original driver does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use hidapi::{HidApi, HidDevice};

use crate::adapters::RateLimitedLog;
use crate::device::{DeviceDriver, DeviceProperties, ImuPose, LookAheadCalibration};
use crate::error::{Error, Result};
use crate::quaternion::Quat;

pub const VENDOR_ID: u16 = 1234; // 0x04D2
pub const PRODUCT_IDS: &[u16] = &[0x162B, 0x162C, 0x162D, 0x162E, 0x162F, 0x2002, 0x2180];

const IMU_TIMEOUT_MS: i32 = 1000;

static MALFORMED_PACKET_LOG: RateLimitedLog = RateLimitedLog::new();

/// East-up-south -> NWU, with the 5 degree factory calibration offset folded in.
const ADJUSTMENT_QUAT: Quat = Quat { w: 0.521, x: -0.478, y: 0.478, z: 0.521 };

pub fn properties_for(product_id: u16, bus_number: u8, address: u8) -> DeviceProperties {
    DeviceProperties {
        name: "Rokid Max",
        vendor_id: VENDOR_ID,
        product_id,
        bus_number,
        address,
        display_resolution: (1920, 1080),
        fov_degrees: 45.0,
        lens_distance_ratio: 0.02,
        imu_cycles_per_s: 90.0,
        imu_buffer_size: 1,
        look_ahead: LookAheadCalibration {
            constant_ms: 20.0,
            frametime_multiplier: 0.6,
            scanline_adjust_ms: 8.0,
            cap_ms: 40.0,
        },
        sbs_mode_supported: true,
        can_be_supplemental: true,
        provides_orientation: true,
        provides_position: false,
        firmware_update_recommended: false,
    }
}

fn parse_quat_report(data: &[u8]) -> Result<(Quat, u32)> {
    if data.len() < 24 {
        return Err(Error::MalformedPacket("rokid: short report"));
    }
    let mut reader = std::io::Cursor::new(data);
    let timestamp_ns = reader.read_u64::<LittleEndian>().map_err(|_| Error::MalformedPacket("rokid: timestamp"))?;
    let x = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rokid: quat"))?;
    let y = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rokid: quat"))?;
    let z = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rokid: quat"))?;
    let w = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rokid: quat"))?;
    Ok((Quat::new(x, y, z, w), (timestamp_ns / 1_000_000) as u32))
}

struct State {
    device: Option<HidDevice>,
    sbs_mode_enabled: bool,
}

pub struct RokidDriver {
    driver_id: String,
    properties: DeviceProperties,
    state: Mutex<State>,
    stop_requested: AtomicBool,
}

impl RokidDriver {
    pub fn new(driver_id: String, product_id: u16, bus_number: u8, address: u8) -> Self {
        RokidDriver {
            driver_id,
            properties: properties_for(product_id, bus_number, address),
            state: Mutex::new(State { device: None, sbs_mode_enabled: false }),
            stop_requested: AtomicBool::new(false),
        }
    }
}

impl DeviceDriver for RokidDriver {
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
        log::info!("rokid: connected to {}", self.driver_id);
        state.device = Some(device);
        Ok(true)
    }

    fn block_on_device(&self, on_pose: &dyn Fn(ImuPose)) -> Result<()> {
        self.stop_requested.store(false, Ordering::SeqCst);

        let result = loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break Ok(());
            }

            let mut packet = [0u8; 64];
            let read_result = {
                let state = self.state.lock().unwrap();
                match &state.device {
                    Some(device) => device.read_timeout(&mut packet, IMU_TIMEOUT_MS),
                    None => break Err(Error::DeviceGone("rokid: not connected")),
                }
            };

            let n = match read_result {
                Ok(n) => n,
                Err(_) => break Err(Error::DeviceGone("rokid: read failed")),
            };
            if n == 0 {
                continue;
            }

            match parse_quat_report(&packet[..n]) {
                Ok((imu_quat, timestamp_ms)) => {
                    let nwu_quat = imu_quat.multiply(&ADJUSTMENT_QUAT);
                    on_pose(ImuPose::orientation_only(nwu_quat, timestamp_ms));
                }
                Err(e) => {
                    MALFORMED_PACKET_LOG.warn(&format!("rokid: malformed packet: {e}"));
                    continue;
                }
            }
        };

        if let Err(e) = &result {
            log::warn!("rokid: worker loop for {} exiting: {e}", self.driver_id);
        }
        result
    }

    fn is_sbs_mode(&self) -> bool {
        self.state.lock().unwrap().sbs_mode_enabled
    }

    fn set_sbs_mode(&self, enabled: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        state.sbs_mode_enabled = enabled;
        enabled
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().device.is_some()
    }

    fn disconnect(&self, soft: bool) {
        self.stop_requested.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(200));
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
    fn rejects_short_reports() {
        assert!(parse_quat_report(&[0u8; 8]).is_err());
    }

    #[test]
    fn parses_identity_quaternion() {
        let mut data = vec![0u8; 24];
        // w (last f32) = 1.0
        data[20..24].copy_from_slice(&1.0f32.to_le_bytes());
        let (q, _) = parse_quat_report(&data).unwrap();
        assert_relative_eq!(q.w, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn properties_match_original_constants() {
        let props = properties_for(0x162B, 0, 0);
        assert_eq!(props.imu_cycles_per_s, 90.0);
        assert_eq!(props.fov_degrees, 45.0);
    }
}
