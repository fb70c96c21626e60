// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Shared-memory IMU pose publisher. Grounded on
//! `original_source/src/plugins/breezy_desktop.c` (layout offsets, version,
//! parity checksum, zero-init-on-create).

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::output::PublishSlot;
use crate::quaternion::Quat;

pub const DATA_LAYOUT_VERSION: u8 = 5;

const CONFIG_RECORD_SIZE: usize = 1 + 1 + 4 * 4 + 4 * 2 + 4 + 4 + 1 + 1;
const IMU_RECORD_SIZE: usize = 1 + 4 * 16 + 4 * 3 + 8 + 4 * 16 + 1;

/// Identity orientation reset value: four copies of the identity quaternion.
pub const ORIENTATION_RESET: [f32; 16] = [
    0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0,
];
pub const POSITION_RESET: [f32; 3] = [0.0, 0.0, 0.0];

/// Config header published at roughly 4 Hz.
#[derive(Debug, Clone, Copy)]
pub struct ConfigRecord {
    pub enabled: bool,
    pub look_ahead_cfg: [f32; 4],
    pub display_resolution: (u32, u32),
    pub fov_degrees: f32,
    pub lens_distance_ratio: f32,
    pub sbs_enabled: bool,
    pub custom_banner_enabled: bool,
}

/// Owns the mmap'd segment and writes config/IMU records under a mutex,
/// mirroring the original's single shared-memory writer.
pub struct SharedMemoryPublisher {
    mmap: Mutex<MmapMut>,
}

impl SharedMemoryPublisher {
    pub fn create(path: &str) -> Result<Self> {
        let size = CONFIG_RECORD_SIZE + IMU_RECORD_SIZE;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(Error::Io)?;
        file.set_len(size as u64).map_err(Error::Io)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(Error::Io)? };
        mmap[..].fill(0);
        mmap[0] = DATA_LAYOUT_VERSION;

        Ok(SharedMemoryPublisher { mmap: Mutex::new(mmap) })
    }

    pub fn write_config(&self, config: &ConfigRecord) -> Result<()> {
        let mut mmap = self.mmap.lock().unwrap();
        let mut buf = [0u8; CONFIG_RECORD_SIZE];
        let mut offset = 0;

        buf[offset] = DATA_LAYOUT_VERSION;
        offset += 1;
        buf[offset] = config.enabled as u8;
        offset += 1;
        for v in config.look_ahead_cfg {
            buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
            offset += 4;
        }
        buf[offset..offset + 4].copy_from_slice(&config.display_resolution.0.to_le_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&config.display_resolution.1.to_le_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&config.fov_degrees.to_le_bytes());
        offset += 4;
        buf[offset..offset + 4].copy_from_slice(&config.lens_distance_ratio.to_le_bytes());
        offset += 4;
        buf[offset] = config.sbs_enabled as u8;
        offset += 1;
        buf[offset] = config.custom_banner_enabled as u8;

        mmap[0..CONFIG_RECORD_SIZE].copy_from_slice(&buf);
        mmap.flush().map_err(|e| {
            log::error!("shm: failed to flush config record: {e}");
            Error::IpcWriteFailure(e.to_string())
        })?;
        Ok(())
    }

    /// Writes one IMU record: the publish-slot triple as 16 floats
    /// (current/stage1/stage2 quats plus a trailing pad float), position,
    /// the sample timestamp, and a parity byte readers must check.
    pub fn write_imu_record(&self, slot: &PublishSlot, position: [f32; 3], epoch_ms: u64) -> Result<()> {
        let mut mmap = self.mmap.lock().unwrap();
        let mut buf = [0u8; IMU_RECORD_SIZE];
        let mut offset = 0;

        buf[offset] = 0; // smooth_follow_enabled: not modeled by this core
        offset += 1;

        let smooth_follow_origin = [0.0f32; 16];
        for v in smooth_follow_origin {
            buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
            offset += 4;
        }

        for v in position {
            buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
            offset += 4;
        }

        buf[offset..offset + 8].copy_from_slice(&epoch_ms.to_le_bytes());
        offset += 8;

        let orientation_block = quats_to_block(slot.current, slot.stage1_evicted, slot.stage2_evicted);
        for v in orientation_block {
            buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
            offset += 4;
        }

        let parity = compute_parity(&buf[1 + 16 * 4 + 3 * 4..offset]);
        buf[offset] = parity;

        mmap[CONFIG_RECORD_SIZE..CONFIG_RECORD_SIZE + IMU_RECORD_SIZE].copy_from_slice(&buf);
        mmap.flush().map_err(|e| {
            log::error!("shm: failed to flush imu record: {e}");
            Error::IpcWriteFailure(e.to_string())
        })?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        let mut mmap = self.mmap.lock().unwrap();
        let start = CONFIG_RECORD_SIZE;
        mmap[start..start + IMU_RECORD_SIZE].fill(0);
        mmap.flush().map_err(|e| Error::IpcWriteFailure(e.to_string()))?;
        Ok(())
    }
}

fn quats_to_block(current: Quat, stage1: Quat, stage2: Quat) -> [f32; 16] {
    let mut block = [0.0f32; 16];
    block[0..4].copy_from_slice(&[current.x, current.y, current.z, current.w]);
    block[4..8].copy_from_slice(&[stage1.x, stage1.y, stage1.z, stage1.w]);
    block[8..12].copy_from_slice(&[stage2.x, stage2.y, stage2.z, stage2.w]);
    block
}

/// XOR of every byte in the region being protected.
fn compute_parity(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_reset_is_four_identity_quats() {
        for chunk in ORIENTATION_RESET.chunks(4) {
            assert_eq!(chunk, &[0.0, 0.0, 0.0, 1.0]);
        }
    }

    #[test]
    fn parity_is_xor_of_all_bytes() {
        let bytes = [0x0Fu8, 0xF0, 0x01];
        assert_eq!(compute_parity(&bytes), 0x0F ^ 0xF0 ^ 0x01);
    }

    #[test]
    fn quats_to_block_lays_out_three_quats_and_pads() {
        let block = quats_to_block(Quat::IDENTITY, Quat::IDENTITY, Quat::IDENTITY);
        assert_eq!(&block[0..4], &[0.0, 0.0, 0.0, 1.0]);
        assert_eq!(&block[12..16], &[0.0, 0.0, 0.0, 0.0]);
    }
}
