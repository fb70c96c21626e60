// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! RayNeo adapter. Grounded on `original_source/src/devices/rayneo.c` and
//! `include/sdks/rayneo.h`.
//!
//! RayNeo's SDK fires a raw accel/gyro/mag callback on every sample, but the
//! orientation actually delivered downstream comes from a separate
//! `GetHeadTrackerPose` query made only when the forced cycle time has
//! elapsed: the raw callback is a throttle trigger, not fusion input. This
//! is the only adapter of the four that also reports position.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use hidapi::{HidApi, HidDevice};

use crate::adapters::{RateLimitedLog, RateLimiter};
use crate::device::{DeviceDriver, DeviceProperties, ImuPose, LookAheadCalibration};
use crate::error::{Error, Result};
use crate::quaternion::Quat;

pub const VENDOR_ID: u16 = 0x1bbb;
pub const PRODUCT_ID: u16 = 0xaf50;

const IMU_TIMEOUT_MS: i32 = 250;

static MALFORMED_PACKET_LOG: RateLimitedLog = RateLimitedLog::new();
const FORCED_CYCLES_PER_S: f32 = 250.0;

/// `{w:0.561, x:-0.430, y:0.430, z:0.561}` in the original driver.
const ADJUSTMENT_QUAT: Quat = Quat { w: 0.561, x: -0.430, y: 0.430, z: 0.561 };

pub fn properties_for(bus_number: u8, address: u8) -> DeviceProperties {
    let imu_cycle_ms = 1000.0 / FORCED_CYCLES_PER_S;
    DeviceProperties {
        name: "RayNeo Air 2",
        vendor_id: VENDOR_ID,
        product_id: PRODUCT_ID,
        bus_number,
        address,
        display_resolution: (1920, 1080),
        fov_degrees: 46.0,
        lens_distance_ratio: 0.025,
        imu_cycles_per_s: FORCED_CYCLES_PER_S,
        imu_buffer_size: (10.0 / imu_cycle_ms).ceil() as usize,
        look_ahead: LookAheadCalibration {
            constant_ms: 10.0,
            frametime_multiplier: 0.3,
            scanline_adjust_ms: 8.0,
            cap_ms: 40.0,
        },
        sbs_mode_supported: true,
        can_be_supplemental: false,
        provides_orientation: true,
        provides_position: true,
        firmware_update_recommended: false,
    }
}

/// A raw callback sample: used only to decide whether the forced cycle
/// time has elapsed, never fed into fusion directly.
struct RawSample {
    timestamp_ms: u32,
}

/// The pre-fused pose a `GetHeadTrackerPose`-equivalent query returns.
struct HeadTrackerPose {
    orientation: Quat,
    position: [f32; 3],
}

fn parse_raw_sample(data: &[u8]) -> Result<RawSample> {
    if data.len() < 8 {
        return Err(Error::MalformedPacket("rayneo: short raw sample"));
    }
    let mut reader = std::io::Cursor::new(data);
    let timestamp_ns = reader.read_u64::<LittleEndian>().map_err(|_| Error::MalformedPacket("rayneo: timestamp"))?;
    Ok(RawSample { timestamp_ms: (timestamp_ns / 1_000_000) as u32 })
}

fn parse_head_tracker_pose(data: &[u8]) -> Result<HeadTrackerPose> {
    if data.len() < 8 + 16 + 12 {
        return Err(Error::MalformedPacket("rayneo: short pose query"));
    }
    let mut reader = std::io::Cursor::new(&data[8..]);
    let rx = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rayneo: pose"))?;
    let ry = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rayneo: pose"))?;
    let rz = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rayneo: pose"))?;
    let rw = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rayneo: pose"))?;
    let px = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rayneo: pose"))?;
    let py = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rayneo: pose"))?;
    let pz = reader.read_f32::<LittleEndian>().map_err(|_| Error::MalformedPacket("rayneo: pose"))?;
    Ok(HeadTrackerPose { orientation: Quat::new(rx, ry, rz, rw), position: [px, py, pz] })
}

struct State {
    device: Option<HidDevice>,
}

pub struct RayneoDriver {
    driver_id: String,
    properties: DeviceProperties,
    state: Mutex<State>,
    stop_requested: AtomicBool,
}

impl RayneoDriver {
    pub fn new(driver_id: String, bus_number: u8, address: u8) -> Self {
        RayneoDriver {
            driver_id,
            properties: properties_for(bus_number, address),
            state: Mutex::new(State { device: None }),
            stop_requested: AtomicBool::new(false),
        }
    }
}

impl DeviceDriver for RayneoDriver {
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
        log::info!("rayneo: connected to {}", self.driver_id);
        state.device = Some(device);
        Ok(true)
    }

    fn block_on_device(&self, on_pose: &dyn Fn(ImuPose)) -> Result<()> {
        self.stop_requested.store(false, Ordering::SeqCst);
        let mut limiter = RateLimiter::new(FORCED_CYCLES_PER_S);

        let result = loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break Ok(());
            }

            let mut packet = [0u8; 64];
            let read_result = {
                let state = self.state.lock().unwrap();
                match &state.device {
                    Some(device) => device.read_timeout(&mut packet, IMU_TIMEOUT_MS),
                    None => break Err(Error::DeviceGone("rayneo: not connected")),
                }
            };

            let n = match read_result {
                Ok(n) => n,
                Err(_) => break Err(Error::DeviceGone("rayneo: read failed")),
            };
            if n == 0 {
                continue;
            }

            let raw = match parse_raw_sample(&packet[..n]) {
                Ok(raw) => raw,
                Err(e) => {
                    MALFORMED_PACKET_LOG.warn(&format!("rayneo: malformed raw sample: {e}"));
                    continue;
                }
            };

            if !limiter.should_emit(raw.timestamp_ms) {
                continue;
            }

            let pose = match parse_head_tracker_pose(&packet[..n]) {
                Ok(pose) => pose,
                Err(e) => {
                    MALFORMED_PACKET_LOG.warn(&format!("rayneo: malformed pose query: {e}"));
                    continue;
                }
            };

            let nwu_quat = pose.orientation.multiply(&ADJUSTMENT_QUAT);
            on_pose(ImuPose::with_position(nwu_quat, pose.position, raw.timestamp_ms));
        };

        if let Err(e) = &result {
            log::warn!("rayneo: worker loop for {} exiting: {e}", self.driver_id);
        }
        result
    }

    fn is_sbs_mode(&self) -> bool {
        false // queried asynchronously by the real SDK; unsupported here
    }

    fn set_sbs_mode(&self, _enabled: bool) -> bool {
        true // SwitchTo3D/SwitchTo2D are fire-and-forget in the original
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

    #[test]
    fn rejects_short_raw_sample() {
        assert!(parse_raw_sample(&[0u8; 4]).is_err());
    }

    #[test]
    fn rejects_short_pose_query() {
        assert!(parse_head_tracker_pose(&[0u8; 10]).is_err());
    }

    #[test]
    fn properties_report_position_support() {
        let props = properties_for(1, 1);
        assert!(props.provides_position);
        assert!(!props.can_be_supplemental);
    }
}
