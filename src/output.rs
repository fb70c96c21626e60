// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Output pipeline: health watchdog, two-stage look-ahead ring buffer, and
//! velocity computation. Grounded on `original_source/src/outputs.c` and
//! `src/buffer.c` (`imu_buffer_type`, `push_to_imu_buffer`).

use crate::buffer::RingBuffer;
use crate::device::ImuPose;
use crate::quaternion::{degree_delta, Quat};

const IMU_CHECKPOINT_MS: u32 = 250;
const HEALTH_GRACE_MS: u32 = 1000;

/// Every sample from the primary stream, buffered through a two-stage
/// ring so a downstream consumer can read a look-ahead triple: the current
/// orientation plus two progressively older checkpoints.
pub struct OutputPipeline {
    stage1: [RingBuffer; 5], // x, y, z, w, timestamp_ms
    stage2: [RingBuffer; 5],

    last_checkpoint_ms: Option<u32>,
    last_healthy_quat: Option<Quat>,
    last_healthy_timestamp_ms: u32,
    last_euler: Option<(f32, [f32; 3])>, // (timestamp_s, [roll, pitch, yaw])
    imu_cycles_per_s: f32,
}

/// One publication-ready triple of poses spanning the look-ahead window.
#[derive(Debug, Clone, Copy)]
pub struct PublishSlot {
    pub current: Quat,
    pub current_ts_ms: u32,
    pub stage1_evicted: Quat,
    pub stage1_ts_ms: u32,
    pub stage2_evicted: Quat,
    pub stage2_ts_ms: u32,
}

/// Euler-angle velocities, degrees/sec per axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EulerVelocity {
    pub roll_dps: f32,
    pub pitch_dps: f32,
    pub yaw_dps: f32,
}

fn new_buffers(size: usize) -> [RingBuffer; 5] {
    [
        RingBuffer::new(size),
        RingBuffer::new(size),
        RingBuffer::new(size),
        RingBuffer::new(size),
        RingBuffer::new(size),
    ]
}

impl OutputPipeline {
    pub fn new(imu_buffer_size: usize, imu_cycles_per_s: f32) -> Self {
        OutputPipeline {
            stage1: new_buffers(imu_buffer_size),
            stage2: new_buffers(imu_buffer_size),
            last_checkpoint_ms: None,
            last_healthy_quat: None,
            last_healthy_timestamp_ms: 0,
            last_euler: None,
            imu_cycles_per_s,
        }
    }

    /// Feeds a new fused sample through the two-stage buffer. Returns a
    /// [`PublishSlot`] once stage 2 has also filled, i.e. once enough
    /// history has accumulated to cover the configured look-ahead window.
    pub fn handle_imu_update(&mut self, pose: &ImuPose, now_ms: u32) -> Option<PublishSlot> {
        self.update_health(pose.orientation, now_ms);

        let q = pose.orientation;
        let values = [q.x, q.y, q.z, q.w, pose.timestamp_ms as f32];

        let mut stage1_evicted = [0.0f32; 5];
        let mut stage1_was_full = true;
        for i in 0..5 {
            stage1_was_full &= self.stage1[i].is_full();
            stage1_evicted[i] = self.stage1[i].push(values[i]);
        }

        let mut slot = None;
        if stage1_was_full {
            let mut stage2_evicted = [0.0f32; 5];
            let mut stage2_was_full = true;
            for i in 0..5 {
                stage2_was_full &= self.stage2[i].is_full();
                stage2_evicted[i] = self.stage2[i].push(stage1_evicted[i]);
            }

            if stage2_was_full {
                slot = Some(PublishSlot {
                    current: q,
                    current_ts_ms: pose.timestamp_ms,
                    stage1_evicted: Quat::new(stage1_evicted[0], stage1_evicted[1], stage1_evicted[2], stage1_evicted[3]),
                    stage1_ts_ms: stage1_evicted[4] as u32,
                    stage2_evicted: Quat::new(stage2_evicted[0], stage2_evicted[1], stage2_evicted[2], stage2_evicted[3]),
                    stage2_ts_ms: stage2_evicted[4] as u32,
                });
            }
        }

        slot
    }

    fn update_health(&mut self, q: Quat, now_ms: u32) {
        let due = match self.last_checkpoint_ms {
            Some(last) => now_ms.wrapping_sub(last) >= IMU_CHECKPOINT_MS,
            None => true,
        };
        if !due {
            return;
        }
        self.last_checkpoint_ms = Some(now_ms);

        let changed = self.last_healthy_quat != Some(q);
        if changed {
            self.last_healthy_quat = Some(q);
            self.last_healthy_timestamp_ms = now_ms;
        }
    }

    /// A device is alive if its fused orientation has changed within the
    /// last second (a bit-identical quaternion held for a full second is
    /// treated as a stalled stream, not genuine stillness).
    pub fn is_imu_alive(&self, now_ms: u32) -> bool {
        now_ms.wrapping_sub(self.last_healthy_timestamp_ms) < HEALTH_GRACE_MS
    }

    /// Degrees/sec per Euler axis, derived from the change since the last
    /// call, scaled by the configured cycle rate.
    pub fn euler_velocity(&mut self, q: Quat, timestamp_s: f32) -> EulerVelocity {
        let euler = q.to_euler_zyx();
        let current = [euler.roll, euler.pitch, euler.yaw];

        let velocity = match self.last_euler {
            Some((_, prev)) => EulerVelocity {
                roll_dps: degree_delta(current[0], prev[0]) * self.imu_cycles_per_s,
                pitch_dps: degree_delta(current[1], prev[1]) * self.imu_cycles_per_s,
                yaw_dps: degree_delta(current[2], prev[2]) * self.imu_cycles_per_s,
            },
            None => EulerVelocity { roll_dps: 0.0, pitch_dps: 0.0, yaw_dps: 0.0 },
        };

        self.last_euler = Some((timestamp_s, current));
        velocity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pose_at(ts: u32) -> ImuPose {
        ImuPose::orientation_only(Quat::from_euler_zyx(&crate::quaternion::Euler { roll: 0.0, pitch: 0.0, yaw: ts as f32 }), ts)
    }

    #[test]
    fn no_publish_slot_until_both_stages_fill() {
        let mut pipeline = OutputPipeline::new(2, 250.0);
        assert!(pipeline.handle_imu_update(&pose_at(0), 0).is_none());
        assert!(pipeline.handle_imu_update(&pose_at(4), 4).is_none());
    }

    #[test]
    fn publish_slot_emitted_once_both_stages_full() {
        let mut pipeline = OutputPipeline::new(2, 250.0);
        let mut got_slot = false;
        for i in 0..10u32 {
            if pipeline.handle_imu_update(&pose_at(i * 4), i * 4).is_some() {
                got_slot = true;
            }
        }
        assert!(got_slot);
    }

    #[test]
    fn health_watchdog_flags_stalled_stream() {
        let mut pipeline = OutputPipeline::new(4, 250.0);
        pipeline.handle_imu_update(&pose_at(0), 0);
        assert!(pipeline.is_imu_alive(0));
        // Same quaternion, far enough in the future to exceed the grace period.
        pipeline.handle_imu_update(&pose_at(0), 2000);
        assert!(!pipeline.is_imu_alive(2000));
    }

    #[test]
    fn euler_velocity_is_zero_on_first_call() {
        let mut pipeline = OutputPipeline::new(4, 250.0);
        let v = pipeline.euler_velocity(Quat::IDENTITY, 0.0);
        assert_eq!(v, EulerVelocity { roll_dps: 0.0, pitch_dps: 0.0, yaw_dps: 0.0 });
    }

    #[test]
    fn euler_velocity_scales_by_cycle_rate() {
        let mut pipeline = OutputPipeline::new(4, 100.0);
        pipeline.euler_velocity(Quat::IDENTITY, 0.0);
        let q = Quat::from_euler_zyx(&crate::quaternion::Euler { roll: 0.0, pitch: 0.0, yaw: 1.0 });
        let v = pipeline.euler_velocity(q, 1.0);
        assert_relative_eq!(v.yaw_dps, 100.0, epsilon = 1.0);
    }
}
