// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live migration core for passthrough hardware devices.
//!
//! This crate moves the internal state of a passthrough device from a
//! source host to a destination host while the VM using it keeps running
//! (or is briefly paused). It owns the device migration state machine, the
//! framed main-channel wire format, and the out-of-order reassembly engine
//! used when state is fanned out across parallel channels. The device
//! driver itself, the generic migration engine, and the transport carrying
//! the bytes are collaborators behind traits.
//!
//! The entry point is [`DeviceMigration`], one per device; the migration
//! engine drives it through the [`MigrationHandlers`] contract.

pub mod driver;
pub mod migrate;
pub mod state;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_util;

pub use driver::{
    DataChannel, DeviceState, DriverError, MigrateCaps, MigrationDriver,
    PrecopyInfo, StateUpdate,
};
pub use migrate::{
    DeviceMigration, EmuLock, LoadAction, MigrateError, MigrationConfig,
    MigrationHandlers, OnOffAuto, PacketQueue, ProtocolError,
};
pub use state::StateError;
