// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mock driver and transport pieces shared by the tests.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use slog::{o, Discard, Logger};

use crate::driver::{
    DataChannel, DeviceState, DriverError, MigrateCaps, MigrationDriver,
    PrecopyInfo, StateUpdate,
};
use crate::migrate::codec::{self, Record};
use crate::PacketQueue;

pub(crate) fn test_logger() -> Logger {
    Logger::root(Discard, o!())
}

/// In-memory data channel: reads are scripted chunks, writes are recorded.
pub(crate) struct TestChannel {
    reads: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl TestChannel {
    fn new() -> Self {
        Self {
            reads: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn push_chunks(&self, chunks: &[&[u8]]) {
        let mut reads = self.reads.lock().unwrap();
        for chunk in chunks {
            reads.push_back(chunk.to_vec());
        }
    }

    /// Each `write_chunk` call, in order.
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    /// All written bytes, concatenated.
    pub(crate) fn written_flat(&self) -> Vec<u8> {
        self.written.lock().unwrap().concat()
    }

    pub(crate) fn set_fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

impl DataChannel for TestChannel {
    fn read_chunk(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut reads = self.reads.lock().unwrap();
        let front = match reads.front_mut() {
            None => return Ok(0),
            Some(front) => front,
        };
        let n = front.len().min(buf.len());
        buf[..n].copy_from_slice(&front[..n]);
        if n == front.len() {
            reads.pop_front();
        } else {
            front.drain(..n);
        }
        Ok(n)
    }

    fn write_chunk(&self, buf: &[u8]) -> std::io::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            ));
        }
        self.written.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }
}

/// Scriptable mock of the device driver. State transitions succeed unless
/// a target state has been poisoned with [`TestDriver::fail_state`]; the
/// data channel is handed out once, on the first transition into a state
/// with data to move.
pub(crate) struct TestDriver {
    caps: MigrateCaps,
    stop_copy_size: u64,
    fail_stop_copy_query: bool,
    precopy: Mutex<PrecopyInfo>,
    config: Mutex<Vec<u8>>,
    channel: Arc<TestChannel>,
    channel_armed: AtomicBool,
    fail_states: Mutex<Vec<DeviceState>>,
    applied: Mutex<Vec<DeviceState>>,
    resets: AtomicUsize,
    loaded: Mutex<Option<Vec<u8>>>,
}

impl TestDriver {
    pub(crate) fn new(caps: MigrateCaps) -> Self {
        Self {
            caps,
            stop_copy_size: 1024 * 1024,
            fail_stop_copy_query: false,
            precopy: Mutex::new(PrecopyInfo::default()),
            config: Mutex::new(Vec::new()),
            channel: Arc::new(TestChannel::new()),
            channel_armed: AtomicBool::new(true),
            fail_states: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            loaded: Mutex::new(None),
        }
    }

    /// Script the chunks `read_chunk` hands out; reads return 0 once they
    /// are exhausted.
    pub(crate) fn with_chunks(self, chunks: &[&[u8]]) -> Self {
        self.channel.push_chunks(chunks);
        self
    }

    pub(crate) fn with_precopy(self, init_bytes: u64, dirty_bytes: u64) -> Self {
        *self.precopy.lock().unwrap() = PrecopyInfo { init_bytes, dirty_bytes };
        self
    }

    pub(crate) fn with_config(self, config: Vec<u8>) -> Self {
        *self.config.lock().unwrap() = config;
        self
    }

    pub(crate) fn with_stop_copy_size(mut self, size: u64) -> Self {
        self.stop_copy_size = size;
        self
    }

    pub(crate) fn with_stop_copy_failure(mut self) -> Self {
        self.fail_stop_copy_query = true;
        self
    }

    /// Make the next transition into `state` fail.
    pub(crate) fn fail_state(&self, state: DeviceState) {
        self.fail_states.lock().unwrap().push(state);
    }

    /// Allow the driver to hand out the data channel again, as a device
    /// that was asynchronously reset would.
    pub(crate) fn rearm_data_channel(&self) {
        self.channel_armed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn channel(&self) -> &TestChannel {
        &self.channel
    }

    pub(crate) fn applied_states(&self) -> Vec<DeviceState> {
        self.applied.lock().unwrap().clone()
    }

    pub(crate) fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub(crate) fn loaded_config(&self) -> Option<Vec<u8>> {
        self.loaded.lock().unwrap().clone()
    }
}

impl MigrationDriver for TestDriver {
    fn query_caps(&self) -> Result<MigrateCaps, DriverError> {
        Ok(self.caps)
    }

    fn set_state(&self, new: DeviceState) -> Result<StateUpdate, DriverError> {
        if self.fail_states.lock().unwrap().contains(&new) {
            return Err(DriverError::Rejected(format!(
                "injected failure entering {}",
                new
            )));
        }
        self.applied.lock().unwrap().push(new);

        let wants_channel = matches!(
            new,
            DeviceState::PreCopy | DeviceState::StopCopy | DeviceState::Resuming
        );
        let channel: Option<Arc<dyn DataChannel>> =
            if wants_channel && self.channel_armed.swap(false, Ordering::SeqCst)
            {
                Some(Arc::clone(&self.channel) as Arc<dyn DataChannel>)
            } else {
                None
            };
        Ok(StateUpdate { state: new, channel })
    }

    fn query_stop_copy_size(&self) -> Result<u64, DriverError> {
        if self.fail_stop_copy_query {
            return Err(DriverError::Unsupported);
        }
        Ok(self.stop_copy_size)
    }

    fn query_precopy_info(&self) -> Result<PrecopyInfo, DriverError> {
        Ok(*self.precopy.lock().unwrap())
    }

    fn save_config(&self, sink: &mut dyn Write) -> Result<(), DriverError> {
        let config = self.config.lock().unwrap();
        sink.write_u32::<LittleEndian>(config.len() as u32)?;
        sink.write_all(&config)?;
        Ok(())
    }

    fn load_config(&self, source: &mut dyn Read) -> Result<(), DriverError> {
        let len = source.read_u32::<LittleEndian>()?;
        let mut data = vec![0u8; len as usize];
        source.read_exact(&mut data)?;
        *self.loaded.lock().unwrap() = Some(data);
        Ok(())
    }

    fn reset(&self) -> Result<(), DriverError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Packet sink backed by a crossbeam channel, standing in for the
/// engine's multifd fan-out queue.
pub(crate) struct TestQueue {
    tx: crossbeam_channel::Sender<(String, u32, Vec<u8>)>,
    rx: crossbeam_channel::Receiver<(String, u32, Vec<u8>)>,
}

impl TestQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn drain(&self) -> Vec<(String, u32, Vec<u8>)> {
        self.rx.try_iter().collect()
    }
}

impl PacketQueue for TestQueue {
    fn queue_device_state(
        &self,
        idstr: &str,
        instance_id: u32,
        packet: &[u8],
    ) -> std::io::Result<()> {
        self.tx
            .send((idstr.to_string(), instance_id, packet.to_vec()))
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "packet queue closed",
                )
            })
    }
}

/// A parsed main-channel record, with the mock driver's config framing
/// unwrapped.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Rec {
    Setup,
    Eos,
    Init,
    Data(Vec<u8>),
    Config(Vec<u8>),
}

pub(crate) fn parse_stream(buf: &[u8]) -> Vec<Rec> {
    let mut s = buf;
    let mut out = Vec::new();
    while !s.is_empty() {
        match codec::get_record(&mut s).unwrap() {
            Record::SetupState => out.push(Rec::Setup),
            Record::EndOfState => out.push(Rec::Eos),
            Record::InitDataSent => out.push(Rec::Init),
            Record::DataState => {
                let len = s.read_u64::<BigEndian>().unwrap() as usize;
                let mut data = vec![0u8; len];
                s.read_exact(&mut data).unwrap();
                out.push(Rec::Data(data));
            }
            Record::ConfigState => {
                let len = s.read_u32::<LittleEndian>().unwrap() as usize;
                let mut data = vec![0u8; len];
                s.read_exact(&mut data).unwrap();
                out.push(Rec::Config(data));
            }
        }
    }
    out
}
