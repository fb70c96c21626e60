// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Process-wide "current active device" handle, shared by subsystems outside
//! the connection pool. Grounded on `original_source/include/runtime_context.h`
//! and `src/runtime_context.c` (`set_device_and_checkout`, `device_checkout`,
//! `device_checkin`, `device_present`).

use std::sync::{Arc, Mutex};

use crate::device::DeviceProperties;

type ChangeCallback = Box<dyn Fn(Option<&DeviceProperties>) + Send + Sync>;

struct Inner {
    current: Option<Arc<DeviceProperties>>,
    queued: Option<Arc<DeviceProperties>>,
    refcount: usize,
}

/// A reference-counted device descriptor with "queued replacement"
/// semantics: a device in use cannot be freed out from under an in-flight
/// checkout, so installing a new one while the old one is checked out queues
/// it until the last checkin.
pub struct DeviceHandle {
    inner: Mutex<Inner>,
    // Kept out of `inner` so firing the callback never needs to re-acquire
    // the lock guarding device state; a callback that calls back into
    // `checkout`/`checkin`/`is_present` would otherwise deadlock.
    on_change: Mutex<Option<ChangeCallback>>,
}

impl DeviceHandle {
    pub fn new() -> Self {
        DeviceHandle {
            inner: Mutex::new(Inner { current: None, queued: None, refcount: 0 }),
            on_change: Mutex::new(None),
        }
    }

    pub fn set_on_device_change(&self, callback: impl Fn(Option<&DeviceProperties>) + Send + Sync + 'static) {
        *self.on_change.lock().unwrap() = Some(Box::new(callback));
    }

    /// Installs `device` as current if nothing is held yet; otherwise queues
    /// it for installation once the current device's refcount drops to zero.
    pub fn set_device_and_checkout(&self, device: DeviceProperties) {
        let device = Arc::new(device);
        let mut fire_with: Option<Option<Arc<DeviceProperties>>> = None;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.current.is_none() {
                inner.current = Some(device.clone());
                inner.refcount = 1;
                fire_with = Some(Some(device));
            } else {
                inner.queued = Some(device);
            }
        }
        self.fire_change(fire_with);
    }

    /// Returns the current device and increments its refcount, or `None` if
    /// a replacement is queued (the handle is "transitioning").
    pub fn checkout(&self) -> Option<Arc<DeviceProperties>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.queued.is_some() {
            return None;
        }
        if let Some(dev) = inner.current.clone() {
            inner.refcount += 1;
            Some(dev)
        } else {
            None
        }
    }

    /// Releases a checkout. If the device passed in matches a queued
    /// replacement rather than the current device, it is simply dropped. If
    /// this was the last outstanding checkout of the current device, it is
    /// replaced by any queued device.
    pub fn checkin(&self, device: &Arc<DeviceProperties>) {
        let mut fire_with: Option<Option<Arc<DeviceProperties>>> = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let is_current = inner.current.as_ref().map(Arc::as_ptr) == Some(Arc::as_ptr(device));
            if !is_current {
                // Matches a queued (not-yet-installed) device: nothing to do,
                // the queued slot isn't refcounted until installed.
                return;
            }
            if inner.refcount > 0 {
                inner.refcount -= 1;
            }
            if inner.refcount == 0 {
                let next = inner.queued.take();
                inner.current = next.clone();
                inner.refcount = if next.is_some() { 1 } else { 0 };
                fire_with = Some(next);
            }
        }
        self.fire_change(fire_with);
    }

    /// True iff a device is current and no replacement is queued.
    pub fn is_present(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.current.is_some() && inner.queued.is_none()
    }

    fn fire_change(&self, fire_with: Option<Option<Arc<DeviceProperties>>>) {
        if let Some(device) = fire_with {
            if let Some(cb) = self.on_change.lock().unwrap().as_ref() {
                cb(device.as_deref());
            }
        }
    }
}

impl Default for DeviceHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LookAheadCalibration;

    fn sample_device(vendor_id: u16) -> DeviceProperties {
        DeviceProperties {
            name: "test",
            vendor_id,
            product_id: 1,
            bus_number: 0,
            address: 0,
            display_resolution: (1920, 1080),
            fov_degrees: 46.0,
            lens_distance_ratio: 0.02,
            imu_cycles_per_s: 250.0,
            imu_buffer_size: 16,
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
            firmware_update_recommended: false,
        }
    }

    #[test]
    fn first_install_is_immediate() {
        let handle = DeviceHandle::new();
        handle.set_device_and_checkout(sample_device(1));
        assert!(handle.is_present());
    }

    #[test]
    fn second_install_queues_until_checked_in() {
        let handle = DeviceHandle::new();
        handle.set_device_and_checkout(sample_device(1));
        let checked_out = handle.checkout().unwrap();
        handle.set_device_and_checkout(sample_device(2));
        // transitioning: a replacement is queued
        assert!(!handle.is_present());
        assert!(handle.checkout().is_none());
        handle.checkin(&checked_out);
        assert!(handle.is_present());
    }

    #[test]
    fn checkout_increments_refcount_and_checkin_decrements() {
        let handle = DeviceHandle::new();
        handle.set_device_and_checkout(sample_device(1));
        let a = handle.checkout().unwrap();
        let b = handle.checkout().unwrap();
        handle.set_device_and_checkout(sample_device(2));
        handle.checkin(&a);
        // still one outstanding checkout (b), so device 2 not installed yet
        assert!(!handle.is_present());
        handle.checkin(&b);
        assert!(handle.is_present());
    }
}
