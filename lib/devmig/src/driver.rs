// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contract between the migration core and the passthrough-device driver.
//!
//! The driver is opaque to this crate: it knows how to move the device
//! between migration states, how to stream the device's internal state in
//! and out through a data channel, and how to serialize the device's
//! configuration space. Everything else (framing, ordering, recovery
//! policy) lives on this side of the boundary.

use std::io::{Read, Write};
use std::sync::Arc;

use thiserror::Error;

bitflags::bitflags! {
    /// Migration capabilities reported by the driver.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MigrateCaps: u64 {
        /// The device can be stopped and its remaining state read out.
        /// Required for any migration support at all.
        const STOP_COPY = 1 << 0;
        /// The device supports the P2P quiescent states, where it stops
        /// initiating DMA but still services requests from its peers.
        const P2P = 1 << 1;
        /// The device can emit state while still running.
        const PRE_COPY = 1 << 2;
    }
}

/// Migration state of the device itself, as maintained by the driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceState {
    Error,
    Stop,
    Running,
    StopCopy,
    Resuming,
    RunningP2p,
    PreCopy,
    PreCopyP2p,
}

impl DeviceState {
    /// The device is emitting state while the VM still runs.
    pub fn is_precopy(&self) -> bool {
        matches!(self, DeviceState::PreCopy | DeviceState::PreCopyP2p)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Error => "ERROR",
            DeviceState::Stop => "STOP",
            DeviceState::Running => "RUNNING",
            DeviceState::StopCopy => "STOP_COPY",
            DeviceState::Resuming => "RESUMING",
            DeviceState::RunningP2p => "RUNNING_P2P",
            DeviceState::PreCopy => "PRE_COPY",
            DeviceState::PreCopyP2p => "PRE_COPY_P2P",
        };
        write!(f, "{}", s)
    }
}

/// Errors reported by the device driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The device refused the requested operation.
    #[error("device rejected the request: {0}")]
    Rejected(String),

    /// The driver does not implement the requested operation.
    #[error("operation not supported by this device")]
    Unsupported,

    /// The driver hit an I/O error talking to the device.
    #[error("driver I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Estimated outstanding precopy data, as reported by the driver.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrecopyInfo {
    /// Bytes the device must transfer before the destination can make use
    /// of the stream at all.
    pub init_bytes: u64,
    /// Bytes the device has re-dirtied since they were last read.
    pub dirty_bytes: u64,
}

/// Raw conduit for device state bytes.
///
/// The driver hands one of these out when the device enters a state with
/// data to move (`PreCopy`, `StopCopy`, `Resuming`). Reads and writes are
/// performed without any migration-side lock held, so implementations must
/// be safe to call from the transfer threads.
pub trait DataChannel: Send + Sync {
    /// Read up to `buf.len()` bytes of device state. A return of 0 means
    /// the device has nothing to offer right now: the current precopy
    /// window is drained, or (in stop-copy) the state is fully read.
    fn read_chunk(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Deliver state bytes back into the device. A short count is treated
    /// as a fatal short write by the caller.
    fn write_chunk(&self, buf: &[u8]) -> std::io::Result<usize>;
}

/// Result of a successful [`MigrationDriver::set_state`] call.
pub struct StateUpdate {
    /// The state the device is now in.
    pub state: DeviceState,
    /// A fresh data channel, if entering `new` opened one.
    pub channel: Option<Arc<dyn DataChannel>>,
}

/// The device driver's migration interface.
pub trait MigrationDriver: Send + Sync + 'static {
    /// Report the device's migration capabilities.
    fn query_caps(&self) -> Result<MigrateCaps, DriverError>;

    /// Ask the device to move to `new`. This is the raw transition
    /// primitive; recovery on failure is the caller's job.
    fn set_state(&self, new: DeviceState) -> Result<StateUpdate, DriverError>;

    /// Size of the remaining device state if stopped now.
    fn query_stop_copy_size(&self) -> Result<u64, DriverError>;

    /// Outstanding precopy data estimates.
    fn query_precopy_info(&self) -> Result<PrecopyInfo, DriverError>;

    /// Serialize the device configuration space into `sink` as a
    /// self-delimited sub-stream.
    fn save_config(&self, sink: &mut dyn Write) -> Result<(), DriverError>;

    /// Restore the device configuration space from `source`, consuming
    /// exactly what `save_config` produced.
    fn load_config(&self, source: &mut dyn Read) -> Result<(), DriverError>;

    /// Hard-reset the device. Last resort when a state transition and its
    /// recovery both fail.
    fn reset(&self) -> Result<(), DriverError>;
}
