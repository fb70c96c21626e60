// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! USB hotplug supervisor. Grounded on `original_source/src/devices.c`
//! (`libusb_hotplug_register_callback`, match-any vendor/product, the 5
//! second event-pump timeout).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusb::{HotplugBuilder, UsbContext};

use crate::adapters::{rayneo, rokid, viture, xreal};
use crate::device::DeviceDriver;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;

const EVENT_PUMP_TIMEOUT: Duration = Duration::from_secs(5);

/// Tries each vendor's adapter in turn and returns the first match,
/// mirroring `device_drivers[]` in the original's `devices.c`.
fn probe_device(vendor_id: u16, product_id: u16, bus: u8, address: u8) -> Option<Arc<dyn DeviceDriver>> {
    let driver_id = format!("{vendor_id:04x}:{product_id:04x}@{bus}:{address}");

    if vendor_id == xreal::VENDOR_ID && xreal::PRODUCT_IDS.contains(&product_id) {
        return Some(Arc::new(xreal::XrealDriver::new(driver_id, product_id, bus, address)));
    }
    if vendor_id == viture::VENDOR_ID {
        return Some(Arc::new(viture::VitureDriver::new(driver_id, product_id, bus, address)));
    }
    if vendor_id == rokid::VENDOR_ID && rokid::PRODUCT_IDS.contains(&product_id) {
        return Some(Arc::new(rokid::RokidDriver::new(driver_id, product_id, bus, address)));
    }
    if vendor_id == rayneo::VENDOR_ID && product_id == rayneo::PRODUCT_ID {
        return Some(Arc::new(rayneo::RayneoDriver::new(driver_id, bus, address)));
    }
    None
}

/// Runs the hotplug event pump on the calling thread until `running` is set
/// to false. On each arrival/departure, resolves the device to an adapter
/// (arrival) or a driver id (departure) and updates `pool` accordingly.
pub fn run_hotplug_loop(pool: Arc<ConnectionPool>, running: Arc<AtomicBool>) -> Result<()> {
    let context = rusb::Context::new().map_err(Error::UsbError)?;

    if !rusb::has_hotplug() {
        return Err(Error::TransportError("platform lacks libusb hotplug support".into()));
    }

    let callback_pool = pool.clone();
    let _registration = HotplugBuilder::new()
        .enumerate(true)
        .register(&context, Box::new(HotplugHandler { pool: callback_pool }))
        .map_err(Error::UsbError)?;

    log::info!("hotplug: event pump started");
    while running.load(Ordering::SeqCst) {
        let _ = context.handle_events(Some(EVENT_PUMP_TIMEOUT));
    }

    Ok(())
}

struct HotplugHandler {
    pool: Arc<ConnectionPool>,
}

impl<T: UsbContext> rusb::Hotplug<T> for HotplugHandler {
    fn device_arrived(&mut self, device: rusb::Device<T>) {
        let Ok(descriptor) = device.device_descriptor() else { return };
        let vendor_id = descriptor.vendor_id();
        let product_id = descriptor.product_id();
        let bus = device.bus_number();
        let address = device.address();

        match probe_device(vendor_id, product_id, bus, address) {
            Some(driver) => self.pool.handle_device_added(driver),
            None => log::debug!("hotplug: ignoring unknown device {vendor_id:04x}:{product_id:04x}"),
        }
    }

    fn device_left(&mut self, device: rusb::Device<T>) {
        let Ok(descriptor) = device.device_descriptor() else { return };
        let vendor_id = descriptor.vendor_id();
        let product_id = descriptor.product_id();
        let bus = device.bus_number();
        let address = device.address();
        let driver_id = format!("{vendor_id:04x}:{product_id:04x}@{bus}:{address}");
        self.pool.handle_device_removed(&driver_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_matches_xreal_by_vendor_and_product() {
        let driver = probe_device(xreal::VENDOR_ID, xreal::PRODUCT_IDS[0], 1, 2);
        assert!(driver.is_some());
        assert!(driver.unwrap().properties().name.contains("XREAL"));
    }

    #[test]
    fn probe_rejects_unknown_vendor() {
        assert!(probe_device(0xFFFF, 0xFFFF, 0, 0).is_none());
    }

    #[test]
    fn probe_matches_viture_by_vendor_alone() {
        let driver = probe_device(viture::VENDOR_ID, 0x0001, 0, 0);
        assert!(driver.is_some());
    }
}
