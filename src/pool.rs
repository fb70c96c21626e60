// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Multi-device connection pool: primary/supplemental election, per-connection
//! worker threads, and the cross-stream blend. Grounded on
//! `original_source/include/connection_pool.h` and `src/connection_pool.c`.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::Config;
use crate::device::{DeviceDriver, ImuPose};
use crate::quaternion::{lerp_normalize, Quat};
use crate::rate::RateEstimator;
use crate::timesync::TimeSync;

/// Confidence at or below which the supplemental stream is ignored and the
/// fused output is simply the primary's relative orientation.
const BLEND_CONFIDENCE_THRESHOLD: f32 = 0.2;

struct Connection {
    driver: Arc<dyn DeviceDriver>,
    supplemental: bool,
    active: bool,
    worker_running: bool,
    worker: Option<JoinHandle<()>>,
    ref_quat: Option<Quat>,
    last_quat: Option<Quat>,
    last_rel_quat: Quat,
    last_ts_ms: u32,
}

impl Connection {
    fn new(driver: Arc<dyn DeviceDriver>) -> Self {
        let supplemental = driver.properties().can_be_supplemental;
        Connection {
            driver,
            supplemental,
            active: false,
            worker_running: false,
            worker: None,
            ref_quat: None,
            last_quat: None,
            last_rel_quat: Quat::IDENTITY,
            last_ts_ms: 0,
        }
    }
}

struct State {
    connections: Vec<Connection>,
    primary_idx: Option<usize>,
    supplemental_idx: Option<usize>,
    rate_primary: RateEstimator,
    rate_supplemental: RateEstimator,
    time_sync: Option<TimeSync>,
    last_offset_s: f32,
    last_confidence: f32,
    time_sync_window_s: f32,
    time_sync_buffer_margin: f32,
}

impl State {
    fn new(config: &Config) -> Self {
        State {
            connections: Vec::new(),
            primary_idx: None,
            supplemental_idx: None,
            rate_primary: RateEstimator::with_ready_threshold(
                config.rate_estimator_window,
                config.rate_estimator_ready_threshold,
            ),
            rate_supplemental: RateEstimator::with_ready_threshold(
                config.rate_estimator_window,
                config.rate_estimator_ready_threshold,
            ),
            time_sync: None,
            last_offset_s: 0.0,
            last_confidence: 0.0,
            time_sync_window_s: config.window_duration_s,
            time_sync_buffer_margin: config.time_sync_buffer_margin,
        }
    }

    fn find_by_driver_id(&self, driver_id: &str) -> Option<usize> {
        self.connections.iter().position(|c| c.driver.driver_id() == driver_id)
    }

    fn pick_primary(&self) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| !c.driver.properties().can_be_supplemental)
            .or(if self.connections.is_empty() { None } else { Some(0) })
    }

    fn pick_supplemental(&self, primary: Option<usize>) -> Option<usize> {
        self.connections.iter().enumerate().position(|(i, c)| {
            Some(i) != primary && c.driver.properties().can_be_supplemental
        })
    }

    fn reelect(&mut self) {
        self.primary_idx = self.pick_primary();
        self.supplemental_idx = self.pick_supplemental(self.primary_idx);
    }

    fn invalidate_time_sync(&mut self) {
        self.time_sync = None;
        self.rate_primary.reset();
        self.rate_supplemental.reset();
        self.last_offset_s = 0.0;
        self.last_confidence = 0.0;
    }
}

/// Tracks every currently-attached device, elects a primary/supplemental
/// pair, fans in their pose samples, and produces the blended orientation.
pub struct ConnectionPool {
    state: Mutex<State>,
    on_fused_pose: Mutex<Option<Box<dyn Fn(ImuPose) + Send + Sync>>>,
}

impl ConnectionPool {
    pub fn new(config: &Config) -> Self {
        ConnectionPool { state: Mutex::new(State::new(config)), on_fused_pose: Mutex::new(None) }
    }

    pub fn set_on_fused_pose(&self, callback: impl Fn(ImuPose) + Send + Sync + 'static) {
        *self.on_fused_pose.lock().unwrap() = Some(Box::new(callback));
    }

    /// Registers a newly arrived device and re-runs election. If the primary
    /// was already running and this arrival fills a previously-empty
    /// supplemental slot, starts a worker for it immediately so a device
    /// hotplugged mid-session doesn't sit idle until the next reconnect.
    pub fn handle_device_added(self: &Arc<Self>, driver: Arc<dyn DeviceDriver>) {
        let driver_id = driver.driver_id().to_string();
        let mut state = self.state.lock().unwrap();

        let blocked_on_active = state
            .primary_idx
            .map(|i| state.connections[i].active && state.connections[i].worker_running)
            .unwrap_or(false);
        let had_supplemental = state.supplemental_idx.is_some();

        state.connections.push(Connection::new(driver));
        state.reelect();

        if blocked_on_active && !had_supplemental {
            if let Some(sidx) = state.supplemental_idx {
                self.start_worker(&mut state, sidx);
            }
        }

        log::info!(
            "pool: {driver_id} added; primary={:?} supplemental={:?}",
            state.primary_idx.map(|i| state.connections[i].driver.driver_id().to_string()),
            state.supplemental_idx.map(|i| state.connections[i].driver.driver_id().to_string()),
        );
    }

    /// Removes a device by its driver id. Soft-disconnects it (and, if it
    /// was primary, the current supplemental too, since the supplemental's
    /// relevance is tied to the primary it was time-synced against), then
    /// re-elects both roles. If the primary survives and a supplemental is
    /// newly elected while the primary was already running, starts a worker
    /// for it right away.
    pub fn handle_device_removed(self: &Arc<Self>, driver_id: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(idx) = state.find_by_driver_id(driver_id) else { return };

        let was_primary = state.primary_idx == Some(idx);
        let blocked_on_active = state
            .primary_idx
            .map(|i| state.connections[i].active && state.connections[i].worker_running)
            .unwrap_or(false);
        let supplemental_was_missing =
            state.supplemental_idx.is_none() || state.supplemental_idx == Some(idx);

        state.connections[idx].driver.disconnect(false);

        if was_primary {
            if let Some(supp_idx) = state.supplemental_idx {
                log::info!("pool: primary {driver_id} left, soft-disconnecting supplemental too");
                state.connections[supp_idx].driver.disconnect(true);
            }
        }

        state.connections.remove(idx);
        state.reelect();
        state.invalidate_time_sync();

        let supplemental_changed = supplemental_was_missing && state.supplemental_idx.is_some();
        if blocked_on_active && !was_primary && supplemental_changed {
            if let Some(sidx) = state.supplemental_idx {
                self.start_worker(&mut state, sidx);
            }
        }

        log::info!("pool: {driver_id} removed; {} device(s) remain", state.connections.len());
    }

    /// Starts a worker thread for the connection at `idx`, marking it active.
    /// No-op if a worker for that connection is already running.
    fn start_worker(self: &Arc<Self>, state: &mut State, idx: usize) {
        if state.connections[idx].worker_running {
            return;
        }
        state.connections[idx].active = true;
        state.connections[idx].worker_running = true;

        let driver = state.connections[idx].driver.clone();
        let driver_id = driver.driver_id().to_string();
        let pool = self.clone();
        let handle = std::thread::spawn(move || {
            let _ = driver.block_on_device(&|pose| pool.ingest_pose(&driver_id, pose));
            pool.worker_finished(&driver_id);
        });
        state.connections[idx].worker = Some(handle);
    }

    /// Marks a connection's worker stopped once its `block_on_device` call
    /// returns, whether from disconnection or an unrecoverable transport error.
    fn worker_finished(&self, driver_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state.find_by_driver_id(driver_id) {
            state.connections[idx].worker_running = false;
            state.connections[idx].active = false;
        }
    }

    /// Opens the transport on the primary (and supplemental, if present)
    /// outside of any worker thread. Returns whether the primary connected.
    pub fn connect_active(&self) -> bool {
        let (primary, supplemental) = {
            let state = self.state.lock().unwrap();
            (
                state.primary_idx.map(|i| state.connections[i].driver.clone()),
                state.supplemental_idx.map(|i| state.connections[i].driver.clone()),
            )
        };

        let primary_ok = match &primary {
            Some(driver) => driver.connect().unwrap_or(false),
            None => false,
        };
        if let Some(driver) = &supplemental {
            let _ = driver.connect();
        }
        primary_ok
    }

    /// Starts a worker for the supplemental (if any) and runs the primary's
    /// `block_on_device` on the calling thread, blocking until it returns.
    /// Once the primary exits, soft-disconnects the supplemental and joins
    /// its worker without holding the pool lock across the join.
    pub fn block_on_active(self: &Arc<Self>) {
        let (primary_driver, supplemental_driver) = {
            let mut state = self.state.lock().unwrap();
            if let Some(idx) = state.primary_idx {
                state.connections[idx].active = true;
                state.connections[idx].worker_running = true;
            }
            if let Some(idx) = state.supplemental_idx {
                self.start_worker(&mut state, idx);
            }
            (
                state.primary_idx.map(|i| state.connections[i].driver.clone()),
                state.supplemental_idx.map(|i| state.connections[i].driver.clone()),
            )
        };

        if let Some(driver) = primary_driver {
            let driver_id = driver.driver_id().to_string();
            let pool = self.clone();
            let _ = driver.block_on_device(&|pose| pool.ingest_pose(&driver_id, pose));
            pool.worker_finished(&driver_id);
        }

        // The primary's worker returned: wind down the supplemental too, then
        // wait for its worker without holding the pool lock across the join.
        if let Some(driver) = supplemental_driver {
            driver.disconnect(true);
            let driver_id = driver.driver_id().to_string();
            let handle = {
                let mut state = self.state.lock().unwrap();
                state.find_by_driver_id(&driver_id).and_then(|idx| state.connections[idx].worker.take())
            };
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }

    /// Feeds one pose sample from the named connection into the pool: rate
    /// estimators, time-sync, and (when the sample came from the primary)
    /// the blend step, forwarded via the fused-pose callback outside the lock.
    pub fn ingest_pose(&self, driver_id: &str, pose: ImuPose) {
        let mut fused: Option<ImuPose> = None;
        {
            let mut state = self.state.lock().unwrap();
            let Some(idx) = state.find_by_driver_id(driver_id) else { return };
            let is_primary = state.primary_idx == Some(idx);
            let is_supplemental = state.supplemental_idx == Some(idx);
            if !is_primary && !is_supplemental {
                return;
            }

            state.connections[idx].last_quat = Some(pose.orientation);
            state.connections[idx].last_ts_ms = pose.timestamp_ms;

            if is_primary {
                state.rate_primary.add(pose.timestamp_ms);
            } else {
                state.rate_supplemental.add(pose.timestamp_ms);
            }

            if state.time_sync.is_none()
                && state.supplemental_idx.is_some()
                && state.rate_primary.ready()
                && state.rate_supplemental.ready()
            {
                let rate1 = state.rate_primary.rate_hz().unwrap_or(1.0);
                let rate2 = state.rate_supplemental.rate_hz().unwrap_or(1.0);
                log::debug!("pool: establishing time-sync at {rate1:.1} Hz / {rate2:.1} Hz");
                state.time_sync = Some(TimeSync::new(
                    state.time_sync_window_s,
                    rate1,
                    rate2,
                    state.time_sync_buffer_margin,
                ));
                if let Some(pidx) = state.primary_idx {
                    let q = state.connections[pidx].last_quat;
                    state.connections[pidx].ref_quat = q;
                }
                if let Some(sidx) = state.supplemental_idx {
                    let q = state.connections[sidx].last_quat;
                    state.connections[sidx].ref_quat = q;
                }
            }

            let ref_quat = state.connections[idx].ref_quat.unwrap_or(Quat::IDENTITY);
            let rel_quat = ref_quat.conjugate().multiply(&pose.orientation);
            state.connections[idx].last_rel_quat = rel_quat;

            if let Some(ts) = &mut state.time_sync {
                let source = if is_primary { 0 } else { 1 };
                ts.add_quaternion_sample(source, rel_quat);
                if ts.is_ready() {
                    if let Ok(offset) = ts.compute_offset() {
                        state.last_offset_s = offset.offset_seconds;
                        state.last_confidence = offset.confidence;
                    }
                }
            }

            if is_primary {
                fused = Some(self.blend_locked(&mut state, pose.timestamp_ms));
            }
        }

        if let Some(fused_pose) = fused {
            if let Some(cb) = self.on_fused_pose.lock().unwrap().as_ref() {
                cb(fused_pose);
            }
        }
    }

    fn blend_locked(&self, state: &mut State, timestamp_ms: u32) -> ImuPose {
        let q1 = state
            .primary_idx
            .map(|i| state.connections[i].last_rel_quat)
            .unwrap_or(Quat::IDENTITY);

        let fused = match state.supplemental_idx {
            Some(sidx) if state.last_confidence > BLEND_CONFIDENCE_THRESHOLD => {
                let q2 = state.connections[sidx].last_rel_quat;
                lerp_normalize(&q1, &q2, state.last_confidence.clamp(0.0, 1.0))
            }
            _ => q1,
        };

        ImuPose::orientation_only(fused, timestamp_ms)
    }

    pub fn device_is_sbs_mode(&self) -> bool {
        let driver = {
            let state = self.state.lock().unwrap();
            state.primary_idx.map(|i| state.connections[i].driver.clone())
        };
        match driver {
            Some(d) => d.is_sbs_mode(),
            None => false,
        }
    }

    pub fn device_set_sbs_mode(&self, enabled: bool) -> bool {
        let driver = {
            let state = self.state.lock().unwrap();
            state.primary_idx.map(|i| state.connections[i].driver.clone())
        };
        match driver {
            Some(d) => d.set_sbs_mode(enabled),
            None => false,
        }
    }

    pub fn disconnect_all(&self, soft: bool) {
        let drivers: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            for c in &mut state.connections {
                c.active = false;
            }
            state.connections.iter().map(|c| c.driver.clone()).collect()
        };
        for driver in drivers {
            driver.disconnect(soft);
        }
        let mut state = self.state.lock().unwrap();
        state.invalidate_time_sync();
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    pub fn last_offset_seconds(&self) -> f32 {
        self.state.lock().unwrap().last_offset_s
    }

    pub fn last_confidence(&self) -> f32 {
        self.state.lock().unwrap().last_confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceProperties, LookAheadCalibration};
    use crate::error::Result;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeDriver {
        id: String,
        props: DeviceProperties,
        connected: AtomicBool,
        sbs: AtomicBool,
        poses: Mutex<Vec<ImuPose>>,
        emitted: AtomicU32,
    }

    impl FakeDriver {
        fn new(id: &str, can_be_supplemental: bool, poses: Vec<ImuPose>) -> Self {
            FakeDriver {
                id: id.to_string(),
                props: DeviceProperties {
                    name: "fake",
                    vendor_id: 0,
                    product_id: 0,
                    bus_number: 0,
                    address: 0,
                    display_resolution: (1920, 1080),
                    fov_degrees: 46.0,
                    lens_distance_ratio: 0.02,
                    imu_cycles_per_s: 250.0,
                    imu_buffer_size: 8,
                    look_ahead: LookAheadCalibration {
                        constant_ms: 10.0,
                        frametime_multiplier: 0.3,
                        scanline_adjust_ms: 8.0,
                        cap_ms: 40.0,
                    },
                    sbs_mode_supported: true,
                    can_be_supplemental,
                    provides_orientation: true,
                    provides_position: false,
                    firmware_update_recommended: false,
                },
                connected: AtomicBool::new(false),
                sbs: AtomicBool::new(false),
                poses: Mutex::new(poses),
                emitted: AtomicU32::new(0),
            }
        }
    }

    impl DeviceDriver for FakeDriver {
        fn driver_id(&self) -> &str {
            &self.id
        }
        fn properties(&self) -> &DeviceProperties {
            &self.props
        }
        fn connect(&self) -> Result<bool> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(true)
        }
        fn block_on_device(&self, on_pose: &dyn Fn(ImuPose)) -> Result<()> {
            let poses = self.poses.lock().unwrap().clone();
            for pose in poses {
                on_pose(pose);
                self.emitted.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
        fn is_sbs_mode(&self) -> bool {
            self.sbs.load(Ordering::SeqCst)
        }
        fn set_sbs_mode(&self, enabled: bool) -> bool {
            self.sbs.store(enabled, Ordering::SeqCst);
            true
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        fn disconnect(&self, _soft: bool) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn single_device_becomes_primary() {
        let pool = Arc::new(ConnectionPool::new(&Config { rate_estimator_window: 200, ..Config::default() }));
        let driver = Arc::new(FakeDriver::new("a", false, vec![]));
        pool.handle_device_added(driver);
        let state = pool.state.lock().unwrap();
        assert_eq!(state.primary_idx, Some(0));
        assert_eq!(state.supplemental_idx, None);
    }

    #[test]
    fn supplemental_only_device_is_primary_when_alone() {
        let pool = Arc::new(ConnectionPool::new(&Config { rate_estimator_window: 200, ..Config::default() }));
        let driver = Arc::new(FakeDriver::new("a", true, vec![]));
        pool.handle_device_added(driver);
        let state = pool.state.lock().unwrap();
        assert_eq!(state.primary_idx, Some(0));
    }

    #[test]
    fn second_device_elected_supplemental() {
        let pool = Arc::new(ConnectionPool::new(&Config { rate_estimator_window: 200, ..Config::default() }));
        pool.handle_device_added(Arc::new(FakeDriver::new("a", false, vec![])));
        pool.handle_device_added(Arc::new(FakeDriver::new("b", true, vec![])));
        let state = pool.state.lock().unwrap();
        assert_eq!(state.primary_idx, Some(0));
        assert_eq!(state.supplemental_idx, Some(1));
    }

    #[test]
    fn removing_primary_reelects() {
        let pool = Arc::new(ConnectionPool::new(&Config { rate_estimator_window: 200, ..Config::default() }));
        pool.handle_device_added(Arc::new(FakeDriver::new("a", false, vec![])));
        pool.handle_device_added(Arc::new(FakeDriver::new("b", true, vec![])));
        pool.handle_device_removed("a");
        let state = pool.state.lock().unwrap();
        assert_eq!(state.connections.len(), 1);
        assert_eq!(state.primary_idx, Some(0));
        assert_eq!(state.connections[0].driver.driver_id(), "b");
    }

    #[test]
    fn ingest_pose_from_primary_alone_fuses_to_its_own_orientation() {
        let pool = Arc::new(ConnectionPool::new(&Config { rate_estimator_window: 200, ..Config::default() }));
        pool.handle_device_added(Arc::new(FakeDriver::new("a", false, vec![])));

        let fused = Arc::new(Mutex::new(None));
        let fused2 = fused.clone();
        pool.set_on_fused_pose(move |p| *fused2.lock().unwrap() = Some(p));

        let q = Quat::new(0.0, 0.0, 0.1, 0.995).normalize();
        pool.ingest_pose("a", ImuPose::orientation_only(q, 10));

        let result = fused.lock().unwrap().unwrap();
        assert_eq!(result.orientation, q);
    }

    #[test]
    fn ingest_pose_from_unknown_driver_is_ignored() {
        let pool = Arc::new(ConnectionPool::new(&Config { rate_estimator_window: 200, ..Config::default() }));
        pool.handle_device_added(Arc::new(FakeDriver::new("a", false, vec![])));
        // Should not panic and should not trigger the fused callback.
        pool.ingest_pose("nonexistent", ImuPose::orientation_only(Quat::IDENTITY, 0));
        assert_eq!(pool.connection_count(), 1);
    }

    #[test]
    fn low_confidence_blend_falls_back_to_primary() {
        // With a supplemental present but no time-sync established yet
        // (confidence is still its default of 0.0), the fused output is
        // just the primary's own (reference-frame-relative) orientation.
        let pool = Arc::new(ConnectionPool::new(&Config { rate_estimator_window: 200, ..Config::default() }));
        pool.handle_device_added(Arc::new(FakeDriver::new("a", false, vec![])));
        pool.handle_device_added(Arc::new(FakeDriver::new("b", true, vec![])));

        let fused = Arc::new(Mutex::new(None));
        let fused2 = fused.clone();
        pool.set_on_fused_pose(move |p| *fused2.lock().unwrap() = Some(p));

        let q = Quat::new(0.0, 0.0, 0.2, 0.98).normalize();
        pool.ingest_pose("a", ImuPose::orientation_only(q, 10));

        let result = fused.lock().unwrap().unwrap();
        assert_eq!(result.orientation, q);
        assert_eq!(pool.last_confidence(), 0.0);
    }
}
