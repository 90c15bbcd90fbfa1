// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Migration transfer engine for a single passthrough device.
//!
//! [`DeviceMigration`] ties the pieces together: the state machine, the
//! main-channel save/load streams, the multifd packet path, and the
//! destination-side reorder buffer. The generic migration engine drives
//! it through [`MigrationHandlers`], a fixed contract invoked at defined
//! points of the overall migration protocol.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use slog::{error, info, o, Logger};
use thiserror::Error;

use crate::driver::{
    DataChannel, DeviceState, DriverError, MigrateCaps, MigrationDriver,
};
use crate::state::{StateError, StateMachine};

pub(crate) mod codec;
mod destination;
pub(crate) mod multifd;
mod source;

pub use codec::ProtocolError;
pub use multifd::PacketQueue;

use destination::LoadState;
use source::SaveCtx;

/// Errors reported to the migration engine. Only state-transition failures
/// are handled internally (via the recovery policy); everything else
/// aborts the migration in progress.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// The driver failed an operation outside a state transition.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// A state transition failed; see [`StateError`] for whether the
    /// device survived.
    #[error(transparent)]
    State(#[from] StateError),

    /// The peer sent something the wire format does not allow.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Accepting another state buffer would exceed the configured cap.
    #[error("queuing state buffer {idx} would exceed the maximum of {max}")]
    Backpressure { idx: u32, max: u64 },

    /// I/O failure on the device data channel, short writes included.
    #[error("device data channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A transfer thread was asked to exit cooperatively.
    #[error("migration cancelled")]
    Cancelled,

    /// The requested configuration cannot be carried out.
    #[error("migration not supported: {0}")]
    Unsupported(String),

    /// The device is in no state to begin the requested phase.
    #[error("device is in an unexpected state: {0}")]
    InvalidState(DeviceState),

    /// A transfer was attempted before the driver produced a data channel.
    #[error("no device data channel is installed")]
    NoDataChannel,
}

/// The global emulation lock: the one lock serializing access to shared
/// emulated-machine state.
///
/// This crate only ever acquires it around the terminal config-load step
/// on the destination; every other entry point is called by the engine
/// with the lock already held (or from a context that never needs it).
#[derive(Default)]
pub struct EmuLock {
    inner: Mutex<()>,
}

impl EmuLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().unwrap()
    }
}

/// Tri-state knob for features that default to "use it if available".
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OnOffAuto {
    On,
    Off,
    #[default]
    Auto,
}

/// Per-device migration settings, fixed at registration time. The engine
/// capability bits reflect what was negotiated for the overall migration.
#[derive(Clone, Debug)]
pub struct MigrationConfig {
    /// Transfer device state over the parallel channels instead of the
    /// main migration channel.
    pub multifd: OnOffAuto,

    /// The engine offers parallel device-state channels.
    pub device_state_channels: bool,

    /// The engine announces switchover on those channels, so a packetized
    /// transfer can be reassembled before the destination starts.
    pub send_switchover_start: bool,

    /// The switchover handshake was negotiated: the source waits for the
    /// destination to acknowledge receipt of all initial data.
    pub switchover_ack: bool,

    /// The engine wants postcopy RAM migration (not supported here).
    pub postcopy_ram: bool,

    /// The engine wants a background snapshot (not supported here).
    pub background_snapshot: bool,

    /// Maximum number of queued-but-unconsumed state buffers on the
    /// destination before incoming packets are refused.
    pub max_queued_buffers: u64,

    /// Upper bound on the transfer scratch buffer.
    pub data_buffer_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            multifd: OnOffAuto::Auto,
            device_state_channels: false,
            send_switchover_start: false,
            switchover_ack: false,
            postcopy_ram: false,
            background_snapshot: false,
            max_queued_buffers: u64::MAX,
            data_buffer_size: source::DATA_BUFFER_SIZE,
        }
    }
}

/// What the engine should do after a successful `load_state` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadAction {
    /// The record stream for this phase was fully consumed.
    Done,

    /// The source announced that all initial data has been sent; the
    /// engine should acknowledge the switchover handshake.
    ApproveSwitchover,
}

/// The handler contract the generic migration engine drives a device
/// through. One implementation is selected per device kind at
/// registration time.
///
/// All methods are called from the engine's thread of control except
/// [`load_state_buffer`](Self::load_state_buffer) (arbitrary channel
/// threads) and [`save_complete_thread`](Self::save_complete_thread) (a
/// dedicated thread the engine creates for the stop-copy push).
pub trait MigrationHandlers: Send + Sync {
    /// Validate that the negotiated migration can work at all.
    fn save_prepare(&self) -> Result<(), MigrateError>;

    /// Begin an outgoing migration: size buffers, enter precopy if
    /// supported, emit the setup record.
    fn save_setup(&self, sink: &mut dyn Write) -> Result<(), MigrateError>;

    /// Tear down the save side, win back the device if it is still in
    /// stop-copy.
    fn save_cleanup(&self);

    /// Cheap estimate of outstanding precopy bytes.
    fn pending_estimate(&self) -> u64;

    /// Authoritative outstanding-byte query; may talk to the driver.
    fn pending_exact(&self) -> u64;

    /// Whether iterative transfer still has work to do.
    fn is_active(&self) -> bool;

    /// Transfer one buffer of precopy data. Returns true once both
    /// precopy budgets are exhausted.
    fn save_iterate(&self, sink: &mut dyn Write) -> Result<bool, MigrateError>;

    /// Drain the remaining device state after the VM has been paused.
    fn save_complete(&self, sink: &mut dyn Write) -> Result<(), MigrateError>;

    /// Multifd variant of [`save_complete`](Self::save_complete), run on a
    /// dedicated thread; chunks the remaining state into indexed packets.
    fn save_complete_thread(
        &self,
        idstr: &str,
        instance_id: u32,
        abort: &AtomicBool,
        queue: &dyn PacketQueue,
    ) -> Result<(), MigrateError>;

    /// Emit the device configuration on the main channel.
    fn save_state(&self, sink: &mut dyn Write) -> Result<(), MigrateError>;

    /// Begin an incoming migration: enter `Resuming`, set up the reorder
    /// buffer.
    fn load_setup(&self) -> Result<(), MigrateError>;

    /// Tear down the load side, stopping the consumer thread if it is
    /// still running. Returns the consumer thread's verdict.
    ///
    /// Lock order is buffer mutex -> emulation lock, so the caller must
    /// not hold the emulation lock here: the consumer thread may be
    /// blocked acquiring it while this call waits on the buffer mutex.
    fn load_cleanup(&self) -> Result<(), MigrateError>;

    /// Consume one phase's records from the main channel.
    fn load_state(&self, source: &mut dyn Read)
        -> Result<LoadAction, MigrateError>;

    /// Accept one out-of-order device state packet from a parallel
    /// channel.
    fn load_state_buffer(&self, packet: &[u8]) -> Result<(), MigrateError>;

    /// Whether the source must wait for a switchover acknowledgement from
    /// this device.
    fn switchover_ack_needed(&self) -> bool;

    /// The switchover is starting: launch the consumer thread that drains
    /// the reorder buffer into the device. Like
    /// [`load_cleanup`](Self::load_cleanup), this must be called without
    /// the emulation lock held.
    fn switchover_start(&self) -> Result<(), MigrateError>;
}

/// Migration driver for one passthrough device.
pub struct DeviceMigration<D: MigrationDriver> {
    name: String,
    log: Logger,
    driver: Arc<D>,
    caps: MigrateCaps,
    config: MigrationConfig,
    emu_lock: Arc<EmuLock>,
    sm: StateMachine<D>,
    save: Mutex<SaveCtx>,
    load: Arc<LoadState>,
    /// Snapshot of the multifd decision, taken at setup time in case the
    /// configuration changes mid-migration.
    multifd: AtomicBool,
}

impl<D: MigrationDriver> DeviceMigration<D> {
    /// Register migration support for a device. Fails if the driver lacks
    /// the baseline stop-copy capability.
    pub fn new(
        name: &str,
        driver: Arc<D>,
        emu_lock: Arc<EmuLock>,
        config: MigrationConfig,
        log: &Logger,
    ) -> Result<Self, MigrateError> {
        let caps = driver.query_caps()?;
        if !caps.contains(MigrateCaps::STOP_COPY) {
            return Err(MigrateError::Unsupported(
                "device does not support stop-copy migration".to_string(),
            ));
        }

        let log = log
            .new(o!("component" => "migration", "device" => name.to_string()));
        info!(log, "device migration registered"; "caps" => ?caps);

        Ok(Self {
            name: name.to_string(),
            sm: StateMachine::new(Arc::clone(&driver), log.clone()),
            driver,
            caps,
            config,
            emu_lock,
            log,
            save: Mutex::new(SaveCtx::default()),
            load: Arc::new(LoadState::new()),
            multifd: AtomicBool::new(false),
        })
    }

    pub fn device_state(&self) -> DeviceState {
        self.sm.current()
    }

    pub fn caps(&self) -> MigrateCaps {
        self.caps
    }

    /// The VM is about to change run state and this device supports P2P:
    /// move it into the matching quiescent state first so its peers can
    /// still reach it while they stop. No-op for non-P2P devices.
    pub fn prepare_vm_state_change(&self) -> Result<(), StateError> {
        if !self.caps.contains(MigrateCaps::P2P) {
            return Ok(());
        }
        let new = if self.sm.current() == DeviceState::PreCopy {
            DeviceState::PreCopyP2p
        } else {
            DeviceState::RunningP2p
        };
        self.sm.transition_or_reset(new)
    }

    /// The VM changed run state. `finishing_migration` is set when the
    /// pause is the final pause of an outgoing migration, in which case a
    /// precopy device goes straight to stop-copy.
    pub fn vm_state_change(
        &self,
        running: bool,
        finishing_migration: bool,
    ) -> Result<(), StateError> {
        let new = if running {
            DeviceState::Running
        } else if self.sm.current().is_precopy() && finishing_migration {
            DeviceState::StopCopy
        } else {
            DeviceState::Stop
        };
        self.sm.transition_or_reset(new)
    }

    /// A precopy migration failed; get the device running again. Best
    /// effort: this is called while the engine is already unwinding, so
    /// failures are logged and swallowed.
    pub fn on_precopy_failed(&self) {
        if let Err(e) = self.sm.transition_or_reset(DeviceState::Running) {
            error!(
                self.log,
                "failed returning device to running after precopy failure";
                "error" => %e,
            );
        }
    }

    pub(crate) fn precopy_supported(&self) -> bool {
        self.caps.contains(MigrateCaps::PRE_COPY)
    }

    pub(crate) fn multifd_supported(&self) -> bool {
        self.config.device_state_channels && self.config.send_switchover_start
    }

    /// Resolve the tri-state multifd request against engine support.
    pub(crate) fn resolve_multifd(&self) -> Result<bool, MigrateError> {
        let enabled = match self.config.multifd {
            OnOffAuto::Auto => self.multifd_supported(),
            OnOffAuto::On => true,
            OnOffAuto::Off => false,
        };
        if enabled && !self.multifd_supported() {
            return Err(MigrateError::Unsupported(
                "multifd device state transfer requested but unsupported \
                 in the current config"
                    .to_string(),
            ));
        }
        Ok(enabled)
    }

    pub(crate) fn multifd_active(&self) -> bool {
        self.multifd.load(Ordering::Relaxed)
    }

    pub(crate) fn set_multifd_active(&self, active: bool) {
        self.multifd.store(active, Ordering::Relaxed);
    }

    pub(crate) fn data_channel(
        &self,
    ) -> Result<Arc<dyn DataChannel>, MigrateError> {
        self.sm.data_channel().ok_or(MigrateError::NoDataChannel)
    }
}

impl<D: MigrationDriver> MigrationHandlers for DeviceMigration<D> {
    fn save_prepare(&self) -> Result<(), MigrateError> {
        DeviceMigration::save_prepare(self)
    }

    fn save_setup(&self, sink: &mut dyn Write) -> Result<(), MigrateError> {
        DeviceMigration::save_setup(self, sink)
    }

    fn save_cleanup(&self) {
        DeviceMigration::save_cleanup(self)
    }

    fn pending_estimate(&self) -> u64 {
        DeviceMigration::pending_estimate(self)
    }

    fn pending_exact(&self) -> u64 {
        DeviceMigration::pending_exact(self)
    }

    fn is_active(&self) -> bool {
        DeviceMigration::is_active(self)
    }

    fn save_iterate(&self, sink: &mut dyn Write) -> Result<bool, MigrateError> {
        DeviceMigration::save_iterate(self, sink)
    }

    fn save_complete(&self, sink: &mut dyn Write) -> Result<(), MigrateError> {
        DeviceMigration::save_complete(self, sink)
    }

    fn save_complete_thread(
        &self,
        idstr: &str,
        instance_id: u32,
        abort: &AtomicBool,
        queue: &dyn PacketQueue,
    ) -> Result<(), MigrateError> {
        DeviceMigration::save_complete_thread(
            self,
            idstr,
            instance_id,
            abort,
            queue,
        )
    }

    fn save_state(&self, sink: &mut dyn Write) -> Result<(), MigrateError> {
        DeviceMigration::save_state(self, sink)
    }

    fn load_setup(&self) -> Result<(), MigrateError> {
        DeviceMigration::load_setup(self)
    }

    fn load_cleanup(&self) -> Result<(), MigrateError> {
        DeviceMigration::load_cleanup(self)
    }

    fn load_state(
        &self,
        source: &mut dyn Read,
    ) -> Result<LoadAction, MigrateError> {
        DeviceMigration::load_state(self, source)
    }

    fn load_state_buffer(&self, packet: &[u8]) -> Result<(), MigrateError> {
        DeviceMigration::load_state_buffer(self, packet)
    }

    fn switchover_ack_needed(&self) -> bool {
        self.precopy_supported()
    }

    fn switchover_start(&self) -> Result<(), MigrateError> {
        DeviceMigration::switchover_start(self)
    }
}
