// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Source-side transfer over the main migration channel.
//!
//! Precopy data moves one buffer per `save_iterate` call while the VM
//! still runs; `save_complete` drains whatever is left once the VM is
//! paused. Both paths share [`DeviceMigration::save_block`], which turns
//! one read from the device into one `DATA_STATE` record.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use slog::{error, info, trace};

use super::codec::{self, ProtocolError, Record};
use super::{DeviceMigration, MigrateError};
use crate::driver::{DeviceState, MigrationDriver, PrecopyInfo};
use crate::stats;

/// Default transfer buffer size. Sized for devices whose total migration
/// state is on the order of hundreds of megabytes; larger buffers have not
/// shown a throughput benefit.
pub(crate) const DATA_BUFFER_SIZE: usize = 1024 * 1024;

/// Worst-case stop-copy size reported when the driver cannot be queried,
/// so a failed query can never make the engine underestimate the remaining
/// downtime.
const STOP_COPY_SIZE_FALLBACK: u64 = 100 * 1024 * 1024 * 1024;

/// Save-side scratch state, live between `save_setup` and `save_cleanup`.
#[derive(Default)]
pub(crate) struct SaveCtx {
    /// Reusable read buffer; its length is the negotiated chunk size.
    pub(crate) buffer: Vec<u8>,
    /// Outstanding precopy budgets, primed at setup and decremented as
    /// data is sent.
    pub(crate) precopy: PrecopyInfo,
    /// The one-time switchover-handshake marker has been emitted.
    pub(crate) initial_data_sent: bool,
    /// Latch for the "iterative save started" trace event.
    pub(crate) event_iterate_started: bool,
    /// Latch for the "no data available" trace event; re-armed by the next
    /// productive read.
    pub(crate) event_no_data_hit: bool,
}

impl<D: MigrationDriver> DeviceMigration<D> {
    /// Check that the negotiated migration is one this transfer can serve.
    pub(crate) fn save_prepare(&self) -> Result<(), MigrateError> {
        if self.config.postcopy_ram {
            return Err(MigrateError::Unsupported(
                "device state migration is not supported with postcopy"
                    .to_string(),
            ));
        }
        if self.config.background_snapshot {
            return Err(MigrateError::Unsupported(
                "device state migration is not supported with background \
                 snapshot"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn save_setup(
        &self,
        sink: &mut dyn Write,
    ) -> Result<(), MigrateError> {
        let multifd = self.resolve_multifd()?;
        self.set_multifd_active(multifd);

        codec::put_record(sink, Record::SetupState)?;

        // Best effort: a failed query leaves the configured cap in place.
        let stop_copy_size = self
            .driver
            .query_stop_copy_size()
            .unwrap_or(self.config.data_buffer_size as u64);
        let buffer_size =
            self.config.data_buffer_size.min(stop_copy_size as usize);
        {
            let mut save = self.save.lock().unwrap();
            save.buffer = vec![0; buffer_size];
            save.precopy = PrecopyInfo::default();
            save.initial_data_sent = false;
            save.event_iterate_started = false;
            save.event_no_data_hit = false;
        }

        if self.precopy_supported() {
            match self.sm.current() {
                DeviceState::Running => {
                    self.sm.transition(
                        DeviceState::PreCopy,
                        DeviceState::Running,
                    )?;
                    let info =
                        self.driver.query_precopy_info().unwrap_or_default();
                    self.save.lock().unwrap().precopy = info;
                }
                // The stop-copy push will move the device itself.
                DeviceState::Stop => {}
                s => return Err(MigrateError::InvalidState(s)),
            }
        }

        info!(
            self.log, "save setup";
            "buffer_size" => buffer_size, "multifd" => multifd,
        );

        codec::put_record(sink, Record::EndOfState)?;
        Ok(())
    }

    pub(crate) fn save_cleanup(&self) {
        // Leaving stop-copy can take a while. Doing it here, after the
        // migration itself has completed, keeps it out of the downtime
        // window.
        if self.sm.current() == DeviceState::StopCopy {
            if let Err(e) = self.sm.transition_or_reset(DeviceState::Stop) {
                error!(
                    self.log, "failed leaving stop-copy during cleanup";
                    "error" => %e,
                );
            }
        }

        {
            let mut save = self.save.lock().unwrap();
            save.buffer = Vec::new();
            save.precopy = PrecopyInfo::default();
            save.initial_data_sent = false;
        }
        self.sm.clear_data_channel();
        trace!(self.log, "save cleanup done");
    }

    /// Read one buffer from the device and emit it as a `DATA_STATE`
    /// record. Returns the number of device bytes moved; 0 means the
    /// device had nothing to offer (not an error).
    fn save_block(
        &self,
        sink: &mut dyn Write,
        save: &mut SaveCtx,
    ) -> Result<usize, MigrateError> {
        let channel = self.data_channel()?;
        let n = channel.read_chunk(&mut save.buffer)?;
        if n == 0 {
            if !save.event_no_data_hit {
                trace!(self.log, "device reported no data available");
                save.event_no_data_hit = true;
            }
            return Ok(0);
        }
        save.event_no_data_hit = false;

        codec::put_record(sink, Record::DataState)?;
        sink.write_u64::<BigEndian>(n as u64).map_err(ProtocolError::Io)?;
        sink.write_all(&save.buffer[..n]).map_err(ProtocolError::Io)?;
        stats::add_bytes_transferred(n as u64);

        trace!(self.log, "device data block saved"; "bytes" => n);
        Ok(n)
    }

    /// Charge `sent` bytes against the precopy budgets, draining the
    /// initial budget before the dirty one.
    fn update_estimated_pending(save: &mut SaveCtx, sent: u64) {
        if sent == 0 {
            // The device has emptied this precopy window.
            save.precopy = PrecopyInfo::default();
            return;
        }
        let init = save.precopy.init_bytes.min(sent);
        save.precopy.init_bytes -= init;
        let rest = sent - init;
        save.precopy.dirty_bytes -= save.precopy.dirty_bytes.min(rest);
    }

    pub(crate) fn save_iterate(
        &self,
        sink: &mut dyn Write,
    ) -> Result<bool, MigrateError> {
        let mut save = self.save.lock().unwrap();
        if !save.event_iterate_started {
            trace!(self.log, "iterative save started");
            save.event_iterate_started = true;
        }

        let n = self.save_block(sink, &mut save)?;
        Self::update_estimated_pending(&mut save, n as u64);

        if self.config.switchover_ack
            && save.precopy.init_bytes == 0
            && save.precopy.dirty_bytes == 0
            && !save.initial_data_sent
        {
            // One-shot handshake marker, in place of the usual terminator.
            codec::put_record(sink, Record::InitDataSent)?;
            save.initial_data_sent = true;
        } else {
            codec::put_record(sink, Record::EndOfState)?;
        }

        trace!(
            self.log, "save iterate";
            "precopy_init" => save.precopy.init_bytes,
            "precopy_dirty" => save.precopy.dirty_bytes,
        );
        Ok(save.precopy.init_bytes == 0 && save.precopy.dirty_bytes == 0)
    }

    pub(crate) fn save_complete(
        &self,
        sink: &mut dyn Write,
    ) -> Result<(), MigrateError> {
        if self.multifd_active() {
            // The data rides the parallel channels; keep the main channel
            // well formed with a bare terminator.
            codec::put_record(sink, Record::EndOfState)?;
            return Ok(());
        }

        // Reached with the device in Stop or StopCopy only.
        self.sm.transition(DeviceState::StopCopy, DeviceState::Stop)?;

        let mut save = self.save.lock().unwrap();
        loop {
            let n = self.save_block(sink, &mut save)?;
            if n == 0 {
                break;
            }
        }

        codec::put_record(sink, Record::EndOfState)?;
        trace!(self.log, "stop-copy data drained");
        Ok(())
    }

    pub(crate) fn save_state(
        &self,
        sink: &mut dyn Write,
    ) -> Result<(), MigrateError> {
        if self.multifd_active() {
            codec::put_record(sink, Record::EndOfState)?;
            return Ok(());
        }
        codec::save_config_state(&*self.driver, sink)
    }

    pub(crate) fn pending_estimate(&self) -> u64 {
        if !self.sm.current().is_precopy() {
            return 0;
        }
        let save = self.save.lock().unwrap();
        save.precopy.init_bytes + save.precopy.dirty_bytes
    }

    pub(crate) fn pending_exact(&self) -> u64 {
        let stop_copy = self
            .driver
            .query_stop_copy_size()
            .unwrap_or(STOP_COPY_SIZE_FALLBACK);

        if self.sm.current().is_precopy() {
            let info = self.driver.query_precopy_info().unwrap_or_default();
            self.save.lock().unwrap().precopy = info;
        }

        trace!(self.log, "pending exact"; "stop_copy" => stop_copy);
        stop_copy
    }

    pub(crate) fn is_active(&self) -> bool {
        self.sm.current().is_precopy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        parse_stream, test_logger, Rec, TestDriver,
    };
    use crate::{EmuLock, MigrateCaps, MigrationConfig};
    use std::sync::Arc;

    fn precopy_migration(
        driver: &Arc<TestDriver>,
        config: MigrationConfig,
    ) -> DeviceMigration<TestDriver> {
        DeviceMigration::new(
            "dev0",
            Arc::clone(driver),
            Arc::new(EmuLock::new()),
            config,
            &test_logger(),
        )
        .unwrap()
    }

    #[test]
    fn setup_frames_and_sizes_the_buffer() {
        let driver = Arc::new(
            TestDriver::new(MigrateCaps::STOP_COPY).with_stop_copy_size(4096),
        );
        let mig = precopy_migration(&driver, MigrationConfig::default());

        let mut out = Vec::new();
        mig.save_setup(&mut out).unwrap();
        assert_eq!(parse_stream(&out), vec![Rec::Setup, Rec::Eos]);
        assert_eq!(mig.save.lock().unwrap().buffer.len(), 4096);
    }

    #[test]
    fn iterate_charges_init_budget_before_dirty() {
        let driver = Arc::new(
            TestDriver::new(MigrateCaps::STOP_COPY | MigrateCaps::PRE_COPY)
                .with_precopy(8192, 1000)
                .with_chunks(&[&[0xaa; 4096], &[0xbb; 4096], &[0xcc; 1000]]),
        );
        let config = MigrationConfig {
            switchover_ack: true,
            ..Default::default()
        };
        let mig = precopy_migration(&driver, config);

        let mut out = Vec::new();
        mig.save_setup(&mut out).unwrap();
        assert_eq!(mig.device_state(), crate::DeviceState::PreCopy);

        let mut out = Vec::new();
        assert!(!mig.save_iterate(&mut out).unwrap());
        assert_eq!(
            parse_stream(&out),
            vec![Rec::Data(vec![0xaa; 4096]), Rec::Eos],
        );

        // The init budget hits zero here but dirty data remains, so the
        // usual terminator still closes the turn.
        let mut out = Vec::new();
        assert!(!mig.save_iterate(&mut out).unwrap());
        assert_eq!(
            parse_stream(&out),
            vec![Rec::Data(vec![0xbb; 4096]), Rec::Eos],
        );

        // Both budgets exhausted: the one-time handshake marker takes the
        // terminator's place.
        let mut out = Vec::new();
        assert!(mig.save_iterate(&mut out).unwrap());
        assert_eq!(
            parse_stream(&out),
            vec![Rec::Data(vec![0xcc; 1000]), Rec::Init],
        );

        // A later turn with nothing to send goes back to plain
        // terminators; the marker is never repeated.
        let mut out = Vec::new();
        assert!(mig.save_iterate(&mut out).unwrap());
        assert_eq!(parse_stream(&out), vec![Rec::Eos]);
    }

    #[test]
    fn iterate_with_no_data_zeroes_the_budgets() {
        let driver = Arc::new(
            TestDriver::new(MigrateCaps::STOP_COPY | MigrateCaps::PRE_COPY)
                .with_precopy(100, 100),
        );
        let mig = precopy_migration(&driver, MigrationConfig::default());

        let mut out = Vec::new();
        mig.save_setup(&mut out).unwrap();

        let mut out = Vec::new();
        assert!(mig.save_iterate(&mut out).unwrap());
        assert_eq!(parse_stream(&out), vec![Rec::Eos]);
        assert_eq!(mig.pending_estimate(), 0);
    }

    #[test]
    fn complete_drains_the_device_in_stop_copy() {
        let driver = Arc::new(
            TestDriver::new(MigrateCaps::STOP_COPY)
                .with_chunks(&[&[1u8; 10], &[2u8; 20]]),
        );
        let mig = precopy_migration(&driver, MigrationConfig::default());

        let mut out = Vec::new();
        mig.save_setup(&mut out).unwrap();
        mig.vm_state_change(false, false).unwrap();
        assert_eq!(mig.device_state(), crate::DeviceState::Stop);

        let mut out = Vec::new();
        mig.save_complete(&mut out).unwrap();
        assert_eq!(mig.device_state(), crate::DeviceState::StopCopy);
        assert_eq!(
            parse_stream(&out),
            vec![Rec::Data(vec![1; 10]), Rec::Data(vec![2; 20]), Rec::Eos],
        );

        mig.save_cleanup();
        assert_eq!(mig.device_state(), crate::DeviceState::Stop);
    }

    #[test]
    fn pending_exact_falls_back_to_the_worst_case() {
        let driver = Arc::new(
            TestDriver::new(MigrateCaps::STOP_COPY).with_stop_copy_failure(),
        );
        let mig = precopy_migration(&driver, MigrationConfig::default());
        assert_eq!(mig.pending_exact(), super::STOP_COPY_SIZE_FALLBACK);
    }
}
