// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framing for the main migration channel.
//!
//! The stream is a sequence of 64-bit big-endian tagged records. Tags are
//! composed so they cannot be mistaken for real data: the top 32 bits are
//! all ones, the next 16 are the magic 0xda7a, and the low 16 identify the
//! record. `DATA_STATE` is followed by a 64-bit length and that many raw
//! device bytes; every other record is self-contained.
//!
//! The device configuration space travels as a sub-stream bracketed by
//! `CONFIG_STATE` and `END_OF_STATE`; its interior is opaque to this crate
//! (the driver produces and consumes it).

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use super::MigrateError;
use crate::driver::MigrationDriver;

/// Violations of the wire format. Never retried; any of these aborts the
/// migration.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A 64-bit value where a record tag was expected is not one.
    #[error("unknown record tag {0:#018x}")]
    UnknownTag(u64),

    /// A record sequence was not closed by `END_OF_STATE`.
    #[error("expected end-of-state marker, found {0:#018x}")]
    EndMarkerMissing(u64),

    /// A terminal packet's payload did not open with `CONFIG_STATE`.
    #[error("config payload does not start with a config-state marker ({0:#018x})")]
    BadConfigMagic(u64),

    /// The main channel carried a config record while the actual transfer
    /// rides the parallel channels.
    #[error("config record on the main channel during multifd transfer")]
    UnexpectedConfigRecord,

    /// A device state packet smaller than its own header.
    #[error("device state packet too short ({len} bytes, header is {header})")]
    PacketTooShort { len: usize, header: usize },

    /// A device state packet from a future (or corrupt) sender.
    #[error("device state packet has unsupported version {0}")]
    PacketVersion(u32),

    /// A packet index with no room left to grow the buffer past it.
    #[error("device state packet index {0} is out of range")]
    PacketIndex(u32),

    /// Two packets claimed the same index.
    #[error("state buffer {0} is already filled")]
    DuplicateIndex(u32),

    /// A second packet arrived with the terminal flag set.
    #[error("terminal config packet observed twice (index {first}, then {again})")]
    UnexpectedTerminal { first: u32, again: u32 },

    /// A side-channel packet reached a receiver that is not reassembling
    /// a multifd transfer.
    #[error("received a device state packet outside multifd transfer")]
    MultifdNotActive,

    /// The source announced its initial data without the switchover
    /// handshake having been negotiated.
    #[error("received initial-data marker without a negotiated switchover handshake")]
    UnexpectedInitData,

    /// The migration stream itself failed.
    #[error("I/O error on migration stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Record tags. The numeric values are the wire format; they must never be
/// reordered or reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub(crate) enum Record {
    /// Terminates the record sequence of the current send phase.
    EndOfState = 0xffff_ffff_da7a_0001,
    /// Opens the device-configuration sub-stream.
    ConfigState = 0xffff_ffff_da7a_0002,
    /// Opens (and, with `EndOfState`, closes) the setup phase.
    SetupState = 0xffff_ffff_da7a_0003,
    /// A length-prefixed run of raw device state bytes.
    DataState = 0xffff_ffff_da7a_0004,
    /// One-time switchover-handshake marker: all initial data was sent.
    InitDataSent = 0xffff_ffff_da7a_0005,
}

pub(crate) fn put_record(
    sink: &mut dyn Write,
    record: Record,
) -> Result<(), ProtocolError> {
    sink.write_u64::<BigEndian>(record.into())?;
    Ok(())
}

pub(crate) fn get_record(
    source: &mut dyn Read,
) -> Result<Record, ProtocolError> {
    let raw = source.read_u64::<BigEndian>()?;
    Record::try_from(raw).map_err(|_| ProtocolError::UnknownTag(raw))
}

/// Require the next record to close the current sequence.
pub(crate) fn expect_end_of_state(
    source: &mut dyn Read,
) -> Result<(), ProtocolError> {
    let raw = source.read_u64::<BigEndian>()?;
    if raw != u64::from(Record::EndOfState) {
        return Err(ProtocolError::EndMarkerMissing(raw));
    }
    Ok(())
}

/// Emit the device configuration as a bracketed sub-stream.
pub(crate) fn save_config_state<D: MigrationDriver>(
    driver: &D,
    sink: &mut dyn Write,
) -> Result<(), MigrateError> {
    put_record(sink, Record::ConfigState)?;
    driver.save_config(sink)?;
    put_record(sink, Record::EndOfState)?;
    Ok(())
}

/// Restore the device configuration from a sub-stream whose `ConfigState`
/// tag has already been consumed by the caller's dispatch.
pub(crate) fn load_config_state<D: MigrationDriver>(
    driver: &D,
    source: &mut dyn Read,
) -> Result<(), MigrateError> {
    driver.load_config(source)?;
    expect_end_of_state(source)?;
    Ok(())
}
