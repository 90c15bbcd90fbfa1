// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packetized stop-copy transfer across the parallel channels.
//!
//! Instead of framed records on the main channel, the device state is
//! chunked into packets with a dense index assigned in read order. The
//! channels may deliver them in any order; the destination's reorder
//! buffer puts them back. The device configuration always travels as the
//! final packet, flagged terminal, so the receiver can tell when the
//! session is complete.

use std::sync::atomic::{AtomicBool, Ordering};

use slog::trace;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::codec;
use super::{DeviceMigration, MigrateError};
use crate::driver::{DeviceState, MigrationDriver};
use crate::stats;

pub(crate) const PACKET_VERSION: u32 = 0;

/// `flags` bit marking the terminal config packet.
pub(crate) const PACKET_FLAG_CONFIG: u32 = 1 << 0;

/// Wire header of one device state packet, little-endian, immediately
/// followed by the payload.
#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub(crate) struct PacketHeader {
    pub version: U32,
    pub idx: U32,
    pub flags: U32,
}

pub(crate) const PACKET_HEADER_LEN: usize =
    std::mem::size_of::<PacketHeader>();

/// The engine's fan-out queue for device state packets: a named channel
/// keyed by the session identifier (`idstr`, `instance_id`).
pub trait PacketQueue: Send + Sync {
    fn queue_device_state(
        &self,
        idstr: &str,
        instance_id: u32,
        packet: &[u8],
    ) -> std::io::Result<()>;
}

pub(crate) fn make_packet(idx: u32, flags: u32, payload: &[u8]) -> Vec<u8> {
    let header = PacketHeader {
        version: U32::new(PACKET_VERSION),
        idx: U32::new(idx),
        flags: U32::new(flags),
    };
    let mut packet = Vec::with_capacity(PACKET_HEADER_LEN + payload.len());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(payload);
    packet
}

impl<D: MigrationDriver> DeviceMigration<D> {
    /// Stop-copy push over the parallel channels. Runs on the dedicated
    /// thread the engine creates for this device; `abort` is the engine's
    /// cooperative cancellation flag.
    pub(crate) fn save_complete_thread(
        &self,
        idstr: &str,
        instance_id: u32,
        abort: &AtomicBool,
        queue: &dyn PacketQueue,
    ) -> Result<(), MigrateError> {
        if !self.multifd_active() {
            // The main-channel path does the transfer.
            return Ok(());
        }

        trace!(
            self.log, "multifd save thread started";
            "idstr" => idstr, "instance_id" => instance_id,
        );

        // Reached with the device in Stop or StopCopy only.
        self.sm.transition(DeviceState::StopCopy, DeviceState::Stop)?;
        let channel = self.data_channel()?;

        // Private read buffer; the main-channel scratch stays untouched.
        let buffer_size = self.save.lock().unwrap().buffer.len();
        let mut buffer = vec![0u8; buffer_size];

        let mut idx: u32 = 0;
        loop {
            if abort.load(Ordering::Relaxed) {
                return Err(MigrateError::Cancelled);
            }

            let n = channel.read_chunk(&mut buffer)?;
            if n == 0 {
                break;
            }

            let packet = make_packet(idx, 0, &buffer[..n]);
            queue.queue_device_state(idstr, instance_id, &packet)?;
            stats::add_bytes_transferred(packet.len() as u64);
            idx += 1;
        }

        // The config packet closes the session and always carries the
        // highest index.
        let mut config = Vec::new();
        codec::save_config_state(&*self.driver, &mut config)?;
        let packet = make_packet(idx, PACKET_FLAG_CONFIG, &config);
        queue.queue_device_state(idstr, instance_id, &packet)?;
        stats::add_bytes_transferred(packet.len() as u64);

        trace!(self.log, "multifd save thread finished"; "packets" => idx + 1);
        Ok(())
    }
}
