// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

// Packet layout based on code by thejackimonster.
// See https://gitlab.com/TheJackiMonster/nrealAirLinuxDriver

//! XREAL (formerly Nreal) adapter. Grounded on `original_source/src/devices/xreal.c`
//! and on this crate's own `nreal_air.rs`/`nreal.rs`, generalized to the
//! common [`DeviceDriver`] contract and to explicit AHRS fusion over raw
//! inertial samples rather than a vendor-fused orientation.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use hidapi::{HidApi, HidDevice};

use crate::adapters::{RateLimitedLog, RateLimiter, SbsModeTable};
use crate::ahrs::{AhrsConfig, AhrsFilter};
use crate::device::{DeviceDriver, DeviceProperties, DisplayMode, ImuPose, LookAheadCalibration};
use crate::error::{Error, Result};
use crate::quaternion::Quat;

pub const VENDOR_ID: u16 = 0x3318;
pub const PRODUCT_IDS: &[u16] = &[0x0424, 0x0428, 0x0432, 0x0426];

const IMU_TIMEOUT_MS: i32 = 250;
const FORCED_CYCLES_PER_S: f32 = 250.0;

const GYRO_FSR_DPS: f32 = 2000.0;
const ACCEL_FSR_G: f32 = 16.0;
const MAG_FSR_GAUSS: f32 = 16.0;
const SCALE_DIVISOR: f32 = 8_388_608.0; // 2^23

/// Post-rotation from the device's raw frame into NWU, a 180 degree turn
/// about X (`{x:1, y:0, z:0, w:0}` in the original driver).
const NWU_CONVERSION_QUAT: Quat = Quat { x: 1.0, y: 0.0, z: 0.0, w: 0.0 };

static SBS_TABLE: SbsModeTable = SbsModeTable::new(&[(1, 3), (5, 9), (10, 11)]);
static MALFORMED_PACKET_LOG: RateLimitedLog = RateLimitedLog::new();

pub fn properties_for(product_id: u16, bus_number: u8, address: u8) -> DeviceProperties {
    let imu_cycle_ms = 1000.0 / FORCED_CYCLES_PER_S;
    DeviceProperties {
        name: "XREAL Air",
        vendor_id: VENDOR_ID,
        product_id,
        bus_number,
        address,
        display_resolution: (1920, 1080),
        fov_degrees: 46.0,
        lens_distance_ratio: 0.02,
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
        provides_position: false,
        firmware_update_recommended: product_id == 0x0424,
    }
}

struct State {
    device: Option<HidDevice>,
    sbs_mode_byte: u8,
    ahrs: AhrsFilter,
    last_timestamp_ms: Option<u32>,
}

pub struct XrealDriver {
    driver_id: String,
    properties: DeviceProperties,
    state: Mutex<State>,
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl XrealDriver {
    pub fn new(driver_id: String, product_id: u16, bus_number: u8, address: u8) -> Self {
        XrealDriver {
            driver_id,
            properties: properties_for(product_id, bus_number, address),
            state: Mutex::new(State {
                device: None,
                sbs_mode_byte: 1,
                ahrs: AhrsFilter::new(AhrsConfig { sample_rate_hz: 1000.0, ..AhrsConfig::default() }),
                last_timestamp_ms: None,
            }),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    fn parse_report(data: &[u8]) -> Result<Option<([f32; 3], [f32; 3], [f32; 3], u32)>> {
        if data.len() < 0x40 || data[0] != 0x01 || data[1] != 0x02 {
            return Ok(None);
        }
        let mut reader = Cursor::new(&data[4..]);
        let timestamp_ns =
            reader.read_u64::<LittleEndian>().map_err(|_| Error::MalformedPacket("short timestamp"))?;
        let timestamp_ms = (timestamp_ns / 1_000_000) as u32;

        let gyro_x = reader.read_i24::<LittleEndian>().map_err(|_| Error::MalformedPacket("short gyro"))? as f32;
        let gyro_y = reader.read_i24::<LittleEndian>().map_err(|_| Error::MalformedPacket("short gyro"))? as f32;
        let gyro_z = reader.read_i24::<LittleEndian>().map_err(|_| Error::MalformedPacket("short gyro"))? as f32;
        let gyro = [
            gyro_x * GYRO_FSR_DPS / SCALE_DIVISOR,
            gyro_y * GYRO_FSR_DPS / SCALE_DIVISOR,
            gyro_z * GYRO_FSR_DPS / SCALE_DIVISOR,
        ];

        let acc_x = reader.read_i24::<LittleEndian>().map_err(|_| Error::MalformedPacket("short accel"))? as f32;
        let acc_y = reader.read_i24::<LittleEndian>().map_err(|_| Error::MalformedPacket("short accel"))? as f32;
        let acc_z = reader.read_i24::<LittleEndian>().map_err(|_| Error::MalformedPacket("short accel"))? as f32;
        let accel = [
            acc_x * ACCEL_FSR_G / SCALE_DIVISOR,
            acc_y * ACCEL_FSR_G / SCALE_DIVISOR,
            acc_z * ACCEL_FSR_G / SCALE_DIVISOR,
        ];

        let mag_x = reader.read_i16::<LittleEndian>().map_err(|_| Error::MalformedPacket("short mag"))? as f32;
        let mag_y = reader.read_i16::<LittleEndian>().map_err(|_| Error::MalformedPacket("short mag"))? as f32;
        let mag_z = reader.read_i16::<LittleEndian>().map_err(|_| Error::MalformedPacket("short mag"))? as f32;
        let mag = [
            mag_x * MAG_FSR_GAUSS / 32_768.0,
            mag_y * MAG_FSR_GAUSS / 32_768.0,
            mag_z * MAG_FSR_GAUSS / 32_768.0,
        ];

        Ok(Some((gyro, accel, mag, timestamp_ms)))
    }
}

impl DeviceDriver for XrealDriver {
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
        log::info!("xreal: connected to {}", self.driver_id);
        state.device = Some(device);
        Ok(true)
    }

    fn block_on_device(&self, on_pose: &dyn Fn(ImuPose)) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        let mut limiter = RateLimiter::new(FORCED_CYCLES_PER_S);

        let result = loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break Ok(());
            }

            let mut packet = [0u8; 0x80];
            let read_result = {
                let state = self.state.lock().unwrap();
                match &state.device {
                    Some(device) => device.read_timeout(&mut packet, IMU_TIMEOUT_MS),
                    None => break Err(Error::DeviceGone("xreal: not connected")),
                }
            };

            let n = match read_result {
                Ok(n) => n,
                Err(_) => break Err(Error::DeviceGone("xreal: read failed")),
            };
            if n == 0 {
                continue; // Transient: timeout with no data.
            }

            match Self::parse_report(&packet[..n]) {
                Ok(Some((gyro, accel, mag, timestamp_ms))) => {
                    let mut state = self.state.lock().unwrap();
                    let dt = match state.last_timestamp_ms {
                        Some(prev) => (timestamp_ms.wrapping_sub(prev) as f32 / 1000.0).max(0.0),
                        None => 1.0 / 1000.0,
                    };
                    state.last_timestamp_ms = Some(timestamp_ms);
                    state.ahrs.update(gyro, accel, mag, dt);
                    let orientation = state.ahrs.orientation().multiply(&NWU_CONVERSION_QUAT);
                    drop(state);

                    if limiter.should_emit(timestamp_ms) {
                        on_pose(ImuPose::orientation_only(orientation, timestamp_ms));
                    }
                }
                Ok(None) => continue, // Not an IMU update report (e.g. INIT handshake).
                Err(e) => {
                    MALFORMED_PACKET_LOG.warn(&format!("xreal: malformed packet: {e}"));
                    continue;
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            log::warn!("xreal: worker loop for {} exiting: {e}", self.driver_id);
        }
        result
    }

    fn is_sbs_mode(&self) -> bool {
        let state = self.state.lock().unwrap();
        SBS_TABLE.display_mode_of(state.sbs_mode_byte) == DisplayMode::SideBySide
    }

    fn set_sbs_mode(&self, enabled: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        let target = if enabled {
            SBS_TABLE.to_sbs(state.sbs_mode_byte)
        } else {
            SBS_TABLE.to_single(state.sbs_mode_byte)
        };
        match target {
            Some(byte) => {
                state.sbs_mode_byte = byte;
                true
            }
            None => false,
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().device.is_some()
    }

    fn disconnect(&self, soft: bool) {
        self.stop_requested.store(true, Ordering::SeqCst);
        // Give the worker a read-timeout quantum to notice before we drop
        // the handle out from under it.
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
    fn rejects_short_packets() {
        let short = [0u8; 4];
        assert!(XrealDriver::parse_report(&short).unwrap().is_none());
    }

    #[test]
    fn rejects_wrong_signature() {
        let mut packet = [0u8; 0x40];
        packet[0] = 0xAA;
        packet[1] = 0x53;
        assert!(XrealDriver::parse_report(&packet).unwrap().is_none());
    }

    #[test]
    fn parses_zeroed_update_report() {
        let mut packet = [0u8; 0x40];
        packet[0] = 0x01;
        packet[1] = 0x02;
        let parsed = XrealDriver::parse_report(&packet).unwrap().unwrap();
        assert_eq!(parsed.0, [0.0, 0.0, 0.0]);
        assert_eq!(parsed.3, 0);
    }

    #[test]
    fn properties_use_forced_cycle_rate() {
        let props = properties_for(0x0424, 1, 2);
        assert_eq!(props.imu_cycles_per_s, 250.0);
        assert!(!props.can_be_supplemental);
    }
}
