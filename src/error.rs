// Copyright (C) 2023, Alex Badics
// This file is part of ar-drivers-rs
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Error taxonomy shared by every module in this crate.

use thiserror::Error;

/// Crate-wide result alias, mirroring the rest of the ar-drivers family.
pub type Result<T> = std::result::Result<T, Error>;

/// The kinds of failure a device adapter, the connection pool, the time-sync
/// engine, or the output pipeline can report.
///
/// Adapters never panic: anything that would otherwise be a `panic!` or an
/// `unwrap()` on untrusted input is instead one of these variants.
#[derive(Debug, Error)]
pub enum Error {
    /// A read timed out or returned a benign partial result. Callers retry.
    #[error("transient I/O condition, retry")]
    Transient,

    /// A packet failed its signature, checksum, or size check and was discarded.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// The underlying transport could not be opened or claimed.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The device disappeared mid-operation.
    #[error("device disconnected: {0}")]
    DeviceGone(&'static str),

    /// Called before enough data has accumulated (rate estimator, time-sync).
    #[error("not enough samples yet")]
    NotReady,

    /// An allocation needed for FFT or resampling failed.
    #[error("out of memory computing {0}")]
    OutOfMemory(&'static str),

    /// A shared-memory segment could not be written.
    #[error("shared memory write failed: {0}")]
    IpcWriteFailure(String),

    /// No device claimed a hotplug event or no adapter recognizes a device.
    #[error("no matching device driver")]
    NotFound,

    #[error("USB transport: {0}")]
    UsbError(#[from] rusb::Error),

    #[error("HID transport: {0}")]
    HidError(#[from] hidapi::HidError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration: {0}")]
    Config(#[from] toml::de::Error),
}
