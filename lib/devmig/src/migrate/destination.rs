// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Destination-side state loading.
//!
//! The main-channel path replays framed records straight into the device.
//! The multifd path is trickier: packets arrive on arbitrary channel
//! threads in arbitrary order, get parked in an indexed reorder buffer,
//! and a dedicated consumer thread drains them into the device in strictly
//! ascending index order. The terminal config packet is only decoded once
//! every lower index has been delivered.
//!
//! Lock order is buffer mutex -> emulation lock, and the two are held
//! together only around the terminal config load. Device writes happen
//! with the buffer mutex released so producer threads never stall behind
//! the (slow) device.

use std::io::Read;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use byteorder::{BigEndian, ReadBytesExt};
use slog::{error, trace, Logger};
use zerocopy::FromBytes;

use super::codec::{self, ProtocolError, Record};
use super::multifd::{
    PacketHeader, PACKET_FLAG_CONFIG, PACKET_HEADER_LEN, PACKET_VERSION,
};
use super::{DeviceMigration, EmuLock, LoadAction, MigrateError};
use crate::driver::{DataChannel, DeviceState, MigrationDriver};

/// Chunk size for streaming main-channel data records into the device.
const LOAD_CHUNK_SIZE: usize = 64 * 1024;

/// One reorder-buffer slot. `Drained` keeps the index occupied after its
/// payload has gone into the device, so a late duplicate is still caught.
enum Slot {
    Empty,
    Filled(Vec<u8>),
    Drained,
}

#[derive(Default)]
struct LoadBufs {
    /// `load_setup` has run and `load_cleanup` has not.
    setup_done: bool,
    /// Reorder buffer, indexed by packet `idx`; grown on demand.
    slots: Vec<Slot>,
    /// Next index owed to the device.
    next_idx: u32,
    /// Index of the terminal config packet, unknown until observed.
    last_idx: Option<u32>,
    /// Buffers parked here but not yet consumed; capped by configuration.
    queued: u64,
    thread_running: bool,
    want_exit: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Slot::Empty
    }
}

/// Shared destination-side state: the reorder buffer and the handshake
/// primitives between producers, the consumer thread, and teardown.
pub(crate) struct LoadState {
    bufs: Mutex<LoadBufs>,
    buffer_ready: Condvar,
    thread_finished: Condvar,
    thread: Mutex<Option<JoinHandle<Result<(), MigrateError>>>>,
}

impl LoadState {
    pub(crate) fn new() -> Self {
        Self {
            bufs: Mutex::new(LoadBufs::default()),
            buffer_ready: Condvar::new(),
            thread_finished: Condvar::new(),
            thread: Mutex::new(None),
        }
    }
}

/// Write one full buffer into the device, treating a short count as a
/// fatal I/O failure.
fn write_chunk_all(
    channel: &dyn DataChannel,
    buf: &[u8],
) -> Result<(), MigrateError> {
    let n = channel.write_chunk(buf)?;
    if n != buf.len() {
        return Err(MigrateError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("short write to device ({} of {} bytes)", n, buf.len()),
        )));
    }
    Ok(())
}

/// Consumer thread body: drain the reorder buffer in ascending order, then
/// load the terminal config packet. Runs with the buffer mutex held except
/// during device writes.
fn consume_load_bufs<D: MigrationDriver>(
    log: &Logger,
    state: &LoadState,
    driver: &D,
    channel: &dyn DataChannel,
    emu_lock: &EmuLock,
) -> Result<(), MigrateError> {
    let mut bufs = state.bufs.lock().unwrap();
    loop {
        if bufs.want_exit {
            return Err(MigrateError::Cancelled);
        }
        if let Some(last) = bufs.last_idx {
            assert!(bufs.next_idx <= last);
        }

        let idx = bufs.next_idx;
        let filled =
            matches!(bufs.slots.get(idx as usize), Some(Slot::Filled(_)));
        if !filled {
            trace!(log, "starved for state buffer"; "idx" => idx);
            bufs = state.buffer_ready.wait(bufs).unwrap();
            continue;
        }

        if Some(idx) == bufs.last_idx {
            // The terminal config packet; loaded below, after the loop.
            break;
        }

        if idx == 0 {
            trace!(log, "first state buffer ready");
        }

        let payload = match std::mem::replace(
            &mut bufs.slots[idx as usize],
            Slot::Drained,
        ) {
            Slot::Filled(payload) => payload,
            _ => unreachable!(),
        };

        if !payload.is_empty() {
            // Loading into the device takes a while; release the lock so
            // producers keep delivering in the meantime.
            drop(bufs);
            let res = write_chunk_all(channel, &payload);
            bufs = state.bufs.lock().unwrap();
            res?;
            trace!(
                log, "state buffer loaded";
                "idx" => idx, "bytes" => payload.len(),
            );
        }

        assert!(bufs.queued > 0);
        bufs.queued -= 1;
        if bufs.last_idx == Some(idx + 1) {
            trace!(log, "last data buffer loaded");
        }
        bufs.next_idx += 1;
    }

    // Every index below the terminal packet has been delivered in order;
    // decode the config under the emulation lock. The buffer mutex stays
    // held across this, the one sanctioned double-hold.
    let idx = bufs.next_idx;
    let payload = match std::mem::replace(
        &mut bufs.slots[idx as usize],
        Slot::Drained,
    ) {
        Slot::Filled(payload) => payload,
        _ => unreachable!(),
    };
    trace!(log, "loading device config"; "idx" => idx);
    {
        let _vm = emu_lock.lock();
        let mut source: &[u8] = &payload;
        let raw =
            source.read_u64::<BigEndian>().map_err(ProtocolError::Io)?;
        if raw != u64::from(Record::ConfigState) {
            return Err(ProtocolError::BadConfigMagic(raw).into());
        }
        codec::load_config_state(driver, &mut source)?;
    }
    Ok(())
}

fn load_bufs_thread<D: MigrationDriver>(
    log: Logger,
    state: Arc<LoadState>,
    driver: Arc<D>,
    channel: Arc<dyn DataChannel>,
    emu_lock: Arc<EmuLock>,
) -> Result<(), MigrateError> {
    let res = consume_load_bufs(&log, &state, &*driver, &*channel, &emu_lock);
    if let Err(e) = &res {
        if !matches!(e, MigrateError::Cancelled) {
            error!(log, "state buffer consumer failed"; "error" => %e);
        }
    }

    let mut bufs = state.bufs.lock().unwrap();
    bufs.thread_running = false;
    drop(bufs);
    state.thread_finished.notify_all();
    res
}

impl<D: MigrationDriver> DeviceMigration<D> {
    pub(crate) fn load_setup(&self) -> Result<(), MigrateError> {
        let multifd = self.resolve_multifd()?;
        self.set_multifd_active(multifd);

        let previous = self.sm.current();
        self.sm.transition(DeviceState::Resuming, previous)?;

        let mut bufs = self.load.bufs.lock().unwrap();
        assert!(!bufs.setup_done);
        *bufs = LoadBufs { setup_done: true, ..Default::default() };
        Ok(())
    }

    pub(crate) fn load_cleanup(&self) -> Result<(), MigrateError> {
        {
            let bufs = self.load.bufs.lock().unwrap();
            if !bufs.setup_done {
                return Ok(());
            }
        }

        let res = if self.multifd_active() {
            self.shutdown_load_thread()
        } else {
            Ok(())
        };

        self.sm.clear_data_channel();
        *self.load.bufs.lock().unwrap() = LoadBufs::default();
        trace!(self.log, "load cleanup done");
        res
    }

    /// Stop the consumer thread if it is still running and collect its
    /// verdict. A cancellation we ourselves requested is not an error.
    fn shutdown_load_thread(&self) -> Result<(), MigrateError> {
        let mut cancelled_here = false;
        {
            let mut bufs = self.load.bufs.lock().unwrap();
            if bufs.thread_running {
                bufs.want_exit = true;
                cancelled_here = true;
                self.load.buffer_ready.notify_all();
                while bufs.thread_running {
                    bufs = self.load.thread_finished.wait(bufs).unwrap();
                }
            }
        }

        let handle = self.load.thread.lock().unwrap().take();
        match handle {
            None => Ok(()),
            Some(handle) => match handle.join() {
                Ok(Err(MigrateError::Cancelled)) if cancelled_here => Ok(()),
                Ok(res) => res,
                Err(_) => Err(MigrateError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "state buffer consumer thread panicked",
                ))),
            },
        }
    }

    /// Block until the consumer thread has delivered every buffer and
    /// loaded the device config, and return its verdict. The engine calls
    /// this before starting the VM on the destination, without the
    /// emulation lock held (the thread needs it for the config load).
    pub fn wait_load_finished(&self) -> Result<(), MigrateError> {
        {
            let mut bufs = self.load.bufs.lock().unwrap();
            while bufs.thread_running {
                bufs = self.load.thread_finished.wait(bufs).unwrap();
            }
        }

        let handle = self.load.thread.lock().unwrap().take();
        match handle {
            None => Ok(()),
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(MigrateError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "state buffer consumer thread panicked",
                )))
            }),
        }
    }

    /// The switchover is starting: spawn the consumer thread. Only the
    /// multifd path uses it.
    pub(crate) fn switchover_start(&self) -> Result<(), MigrateError> {
        if !self.multifd_active() {
            return Ok(());
        }

        let channel = self.data_channel()?;
        {
            let mut bufs = self.load.bufs.lock().unwrap();
            assert!(!bufs.thread_running);
            bufs.thread_running = true;
        }

        let log = self.log.clone();
        let state = Arc::clone(&self.load);
        let driver = Arc::clone(&self.driver);
        let emu_lock = Arc::clone(&self.emu_lock);
        let spawned = std::thread::Builder::new()
            .name(format!("devmig-load {}", self.name))
            .spawn(move || {
                load_bufs_thread(log, state, driver, channel, emu_lock)
            });

        match spawned {
            Ok(handle) => {
                *self.load.thread.lock().unwrap() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.load.bufs.lock().unwrap().thread_running = false;
                Err(MigrateError::Io(e))
            }
        }
    }

    /// Park one out-of-order packet in the reorder buffer. Called from
    /// arbitrary channel threads; takes only the buffer mutex.
    pub(crate) fn load_state_buffer(
        &self,
        packet: &[u8],
    ) -> Result<(), MigrateError> {
        if !self.multifd_active() {
            return Err(ProtocolError::MultifdNotActive.into());
        }

        let (header, payload) =
            PacketHeader::ref_from_prefix(packet).map_err(|_| {
                ProtocolError::PacketTooShort {
                    len: packet.len(),
                    header: PACKET_HEADER_LEN,
                }
            })?;
        if header.version.get() != PACKET_VERSION {
            return Err(ProtocolError::PacketVersion(header.version.get()).into());
        }
        let idx = header.idx.get();
        if idx == u32::MAX {
            // No room to grow the slot container past it.
            return Err(ProtocolError::PacketIndex(idx).into());
        }
        let terminal = header.flags.get() & PACKET_FLAG_CONFIG != 0;

        trace!(
            self.log, "state buffer arrived";
            "idx" => idx, "terminal" => terminal,
        );

        let mut bufs = self.load.bufs.lock().unwrap();

        if bufs.slots.len() <= idx as usize {
            bufs.slots.resize_with(idx as usize + 1, Slot::default);
        }
        if !matches!(bufs.slots[idx as usize], Slot::Empty) {
            return Err(ProtocolError::DuplicateIndex(idx).into());
        }
        if terminal {
            if let Some(first) = bufs.last_idx {
                return Err(ProtocolError::UnexpectedTerminal {
                    first,
                    again: idx,
                }
                .into());
            }
        }
        if bufs.queued + 1 > self.config.max_queued_buffers {
            // Rejected before the counter moves; the payload is not
            // stored.
            return Err(MigrateError::Backpressure {
                idx,
                max: self.config.max_queued_buffers,
            });
        }

        if terminal {
            bufs.last_idx = Some(idx);
        }
        bufs.queued += 1;
        bufs.slots[idx as usize] = Slot::Filled(payload.to_vec());
        self.load.buffer_ready.notify_one();
        Ok(())
    }

    /// Replay one phase's records from the main channel.
    pub(crate) fn load_state(
        &self,
        source: &mut dyn Read,
    ) -> Result<LoadAction, MigrateError> {
        loop {
            let record = codec::get_record(source)?;
            trace!(self.log, "incoming record"; "record" => ?record);

            match record {
                Record::EndOfState => return Ok(LoadAction::Done),
                Record::ConfigState => {
                    if self.multifd_active() {
                        return Err(
                            ProtocolError::UnexpectedConfigRecord.into()
                        );
                    }
                    codec::load_config_state(&*self.driver, source)?;
                    return Ok(LoadAction::Done);
                }
                Record::SetupState => {
                    codec::expect_end_of_state(source)?;
                    return Ok(LoadAction::Done);
                }
                Record::DataState => {
                    let len = source
                        .read_u64::<BigEndian>()
                        .map_err(ProtocolError::Io)?;
                    if len > 0 {
                        self.load_buffer(source, len)?;
                    }
                }
                Record::InitDataSent => {
                    if !self.precopy_supported()
                        || !self.config.switchover_ack
                    {
                        return Err(ProtocolError::UnexpectedInitData.into());
                    }
                    return Ok(LoadAction::ApproveSwitchover);
                }
            }
        }
    }

    /// Stream `len` raw bytes from the main channel into the device.
    fn load_buffer(
        &self,
        source: &mut dyn Read,
        len: u64,
    ) -> Result<(), MigrateError> {
        let channel = self.data_channel()?;
        let mut chunk = vec![0u8; LOAD_CHUNK_SIZE.min(len as usize)];
        let mut remaining = len;
        while remaining > 0 {
            let n = chunk.len().min(remaining as usize);
            source
                .read_exact(&mut chunk[..n])
                .map_err(ProtocolError::Io)?;
            write_chunk_all(&*channel, &chunk[..n])?;
            remaining -= n as u64;
        }
        trace!(self.log, "device data loaded"; "bytes" => len);
        Ok(())
    }
}

#[cfg(test)]
impl<D: MigrationDriver> DeviceMigration<D> {
    pub(crate) fn queued_buffers(&self) -> u64 {
        self.load.bufs.lock().unwrap().queued
    }

    pub(crate) fn slot_is_filled(&self, idx: u32) -> bool {
        matches!(
            self.load.bufs.lock().unwrap().slots.get(idx as usize),
            Some(Slot::Filled(_))
        )
    }
}
