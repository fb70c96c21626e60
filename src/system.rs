// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Root facade tying the connection pool, hotplug supervisor, output
//! pipeline, and shared-memory publisher together behind one handle,
//! replacing the original's process-wide globals (see Design Notes).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::device::ImuPose;
use crate::device_handle::DeviceHandle;
use crate::error::Result;
use crate::hotplug::run_hotplug_loop;
use crate::output::OutputPipeline;
use crate::pool::ConnectionPool;
use crate::shm::SharedMemoryPublisher;

/// How long the connection supervisor sleeps between checks when no device
/// is attached yet.
const NO_DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Owns every long-lived subsystem. A single instance is expected per
/// process; nothing here prevents constructing more than one for testing.
pub struct System {
    pub config: Config,
    pub pool: Arc<ConnectionPool>,
    pub device_handle: Arc<DeviceHandle>,
    output: Mutex<OutputPipeline>,
    publisher: Option<SharedMemoryPublisher>,
    running: Arc<AtomicBool>,
}

impl System {
    pub fn new(config: Config, shm_path: Option<&str>, imu_buffer_size: usize, imu_cycles_per_s: f32) -> Result<Self> {
        let publisher = match shm_path {
            Some(path) => Some(SharedMemoryPublisher::create(path)?),
            None => None,
        };

        Ok(System {
            pool: Arc::new(ConnectionPool::new(&config)),
            device_handle: Arc::new(DeviceHandle::new()),
            output: Mutex::new(OutputPipeline::new(imu_buffer_size, imu_cycles_per_s)),
            publisher,
            running: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// Wires the pool's fused-pose callback to the output pipeline, starts the
    /// hotplug supervisor, and starts the connection supervisor that drives
    /// the elected primary/supplemental through `connect_active`/
    /// `block_on_active` whenever a device is present. Without the latter, a
    /// device arriving would update the pool's bookkeeping but no worker
    /// would ever read a pose from it.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        self.pool.set_on_fused_pose(move |pose: ImuPose| {
            this.handle_fused_pose(pose);
        });

        self.running.store(true, Ordering::SeqCst);

        let pool = self.pool.clone();
        let running = self.running.clone();
        thread::spawn(move || {
            if let Err(e) = run_hotplug_loop(pool, running) {
                log::error!("system: hotplug loop exited: {e}");
            }
        });

        let pool = self.pool.clone();
        let running = self.running.clone();
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                if pool.connection_count() == 0 {
                    thread::sleep(NO_DEVICE_POLL_INTERVAL);
                    continue;
                }
                pool.connect_active();
                pool.block_on_active();
            }
        });

        log::info!("system: started");
    }

    fn handle_fused_pose(&self, pose: ImuPose) {
        let slot = {
            let mut output = self.output.lock().unwrap();
            output.handle_imu_update(&pose, pose.timestamp_ms)
        };

        if let (Some(slot), Some(publisher)) = (slot, &self.publisher) {
            if let Err(e) = publisher.write_imu_record(&slot, pose.position, pose.timestamp_ms as u64) {
                log::error!("system: dropped an imu record: {e}");
            }
        }
    }

    pub fn stop(&self) {
        log::info!("system: stopping");
        self.running.store(false, Ordering::SeqCst);
        self.pool.disconnect_all(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_without_shm_path_has_no_publisher() {
        let system = System::new(Config::default(), None, 8, 250.0).unwrap();
        assert!(system.publisher.is_none());
    }
}
