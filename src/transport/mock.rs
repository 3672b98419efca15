//! In-process stand-ins for the scan engine.
//!
//! [`MockDevice`] runs the command decoder and raster/vector scanner on a
//! background thread behind the same [`IoStream`] the TCP transport uses.
//! [`ScriptedStream`] replays canned reply bytes and records what was written.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, unbounded};
use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::{ByteSink, ByteSource, Connector, DEFAULT_READ_BUFFER, IoStream, Stream};
use crate::error::BeamError;
use crate::protocol::{ArrayItems, Command, decode_all, decode_one, encode_samples, sync_sentinel};
use crate::types::{DacCodeRange, OutputEnable, OutputMode, VectorPoint};

/// Host-side write buffer size before bytes reach the device unflushed
const HOST_WRITE_BUFFER: usize = 8192;
/// Device output FIFO level that triggers a transfer without `Flush`
const DEVICE_FIFO_LEVEL: usize = 512;
/// Reply packets the device may queue before it stalls
const REPLY_QUEUE: usize = 256;

/// What the emulated ADC returns
#[derive(Clone)]
pub enum SamplePattern {
    /// Consecutive values, one per emitted sample, wrapping at `u16::MAX`
    Counter,
    Constant(u16),
    /// Function of the beam position in DAC codes
    Position(Arc<dyn Fn(u16, u16) -> u16 + Send + Sync>),
}

impl std::fmt::Debug for SamplePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplePattern::Counter => write!(f, "Counter"),
            SamplePattern::Constant(value) => write!(f, "Constant({value})"),
            SamplePattern::Position(_) => write!(f, "Position(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub pattern: SamplePattern,
    /// Upper bound of a random delay before each reply packet
    pub jitter: Option<Duration>,
    pub seed: u64,
    /// How long a host read waits for the device before timing out
    pub read_timeout: Duration,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            pattern: SamplePattern::Counter,
            jitter: None,
            seed: 0x5eed_1234_abcd_0001,
            read_timeout: Duration::from_secs(10),
        }
    }
}

/// Every command the emulated device has executed, in order
#[derive(Clone, Default)]
pub struct DeviceLog {
    commands: Arc<Mutex<Vec<Command>>>,
}

impl DeviceLog {
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.commands.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
    }

    fn record(&self, command: &Command) {
        self.commands.lock().push(command.clone());
    }
}

/// Host end of the command channel; bytes cross to the device on flush
/// or once the local buffer fills.
pub struct DeviceWriter {
    tx: Sender<Vec<u8>>,
    pending: Vec<u8>,
}

impl DeviceWriter {
    fn send_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.pending);
        self.tx
            .send(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device stopped"))
    }
}

impl Write for DeviceWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= HOST_WRITE_BUFFER {
            self.send_pending()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_pending()
    }
}

/// Host end of the reply channel
pub struct DeviceReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
    timeout: Duration,
}

impl Read for DeviceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.current.len() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(bytes) => {
                    self.current = bytes;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "device silent"));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

pub type MockStream = IoStream<DeviceWriter, DeviceReader>;

/// Handle to a running emulated device
pub struct MockDevice {
    log: DeviceLog,
    handle: Option<JoinHandle<()>>,
}

impl MockDevice {
    /// Start a device thread and return it with the host's stream.
    pub fn spawn(options: MockOptions) -> Result<(Self, MockStream), BeamError> {
        Self::spawn_with_log(options, DeviceLog::default())
    }

    fn spawn_with_log(
        options: MockOptions,
        log: DeviceLog,
    ) -> Result<(Self, MockStream), BeamError> {
        let (cmd_tx, cmd_rx) = unbounded();
        let (reply_tx, reply_rx) = bounded(REPLY_QUEUE);
        let read_timeout = options.read_timeout;
        let engine = Emulator::new(options, log.clone(), reply_tx);
        let handle = thread::Builder::new()
            .name("mock-device".to_string())
            .spawn(move || engine.run(cmd_rx))
            .map_err(|e| BeamError::io(e, "spawning mock device"))?;

        let writer = DeviceWriter {
            tx: cmd_tx,
            pending: Vec::new(),
        };
        let reader = DeviceReader {
            rx: reply_rx,
            current: Vec::new(),
            pos: 0,
            timeout: read_timeout,
        };
        let device = MockDevice {
            log,
            handle: Some(handle),
        };
        Ok((device, IoStream::new(writer, reader, DEFAULT_READ_BUFFER)))
    }

    pub fn log(&self) -> &DeviceLog {
        &self.log
    }

    /// Wait for the device thread; it exits once the host stream is dropped.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Mock device thread panicked");
            }
        }
    }
}

/// Spawns a fresh [`MockDevice`] on every connect; all devices share one log.
#[derive(Clone, Default)]
pub struct MockConnector {
    options: MockOptions,
    log: DeviceLog,
    connects: Arc<Mutex<usize>>,
}

impl MockConnector {
    pub fn new(options: MockOptions) -> Self {
        Self {
            options,
            log: DeviceLog::default(),
            connects: Arc::default(),
        }
    }

    pub fn log(&self) -> DeviceLog {
        self.log.clone()
    }

    /// Number of successful connects so far
    pub fn connects(&self) -> usize {
        *self.connects.lock()
    }
}

impl Connector for MockConnector {
    fn connect(&mut self) -> Result<Box<dyn Stream>, BeamError> {
        let (_device, stream) = MockDevice::spawn_with_log(self.options.clone(), self.log.clone())?;
        *self.connects.lock() += 1;
        debug!("Mock device spawned (connect #{})", self.connects());
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        "mock://device".to_string()
    }
}

/// Marker for a host that went away mid-reply
struct HostGone;

/// The emulated command executor and scanner.
struct Emulator {
    options: MockOptions,
    log: DeviceLog,
    replies: Sender<Vec<u8>>,
    output: OutputMode,
    region: (DacCodeRange, DacCodeRange),
    x_index: u32,
    y_index: u32,
    counter: u16,
    free_run: Option<u16>,
    fifo: Vec<u8>,
    rng: u64,
}

impl Emulator {
    fn new(options: MockOptions, log: DeviceLog, replies: Sender<Vec<u8>>) -> Self {
        let full = DacCodeRange {
            start: 0,
            count: 1,
            step: 0,
        };
        let rng = options.seed.max(1);
        Self {
            options,
            log,
            replies,
            output: OutputMode::SixteenBit,
            region: (full, full),
            x_index: 0,
            y_index: 0,
            counter: 0,
            free_run: None,
            fifo: Vec::new(),
            rng,
        }
    }

    fn run(mut self, commands: Receiver<Vec<u8>>) {
        let mut input: Vec<u8> = Vec::new();
        loop {
            if let Some(dwell) = self.free_run {
                match commands.try_recv() {
                    Ok(bytes) => input.extend_from_slice(&bytes),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => return,
                }
                if input.is_empty() {
                    if self.free_run_line(dwell).is_err() {
                        return;
                    }
                    continue;
                }
                // any incoming command ends a free run
                debug!("Mock device: free run interrupted");
                self.free_run = None;
                self.reset_position();
            } else {
                match commands.recv() {
                    Ok(bytes) => input.extend_from_slice(&bytes),
                    Err(_) => return,
                }
            }

            let mut consumed = 0;
            loop {
                match decode_one(&input[consumed..]) {
                    Ok(Some((command, used))) => {
                        consumed += used;
                        self.log.record(&command);
                        if self.execute(command).is_err() {
                            return;
                        }
                        if self.free_run.is_some() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Mock device dropping undecodable input: {e}");
                        consumed = input.len();
                        break;
                    }
                }
            }
            input.drain(..consumed);
        }
    }

    fn execute(&mut self, command: Command) -> Result<(), HostGone> {
        trace!("Mock device executing {command:?}");
        match command {
            Command::Synchronize { cookie, output, .. } => {
                self.output = output;
                self.fifo.extend_from_slice(&sync_sentinel(cookie));
                Ok(())
            }
            Command::Abort => {
                self.free_run = None;
                self.reset_position();
                Ok(())
            }
            Command::Flush => self.send_fifo(),
            Command::ExternalCtrl { .. }
            | Command::BeamSelect { .. }
            | Command::Blank { .. }
            | Command::Delay { .. } => Ok(()),
            Command::Array(ArrayItems::RasterPixel(dwells)) => {
                for _ in dwells {
                    self.raster_pixel(OutputEnable::Enabled)?;
                }
                Ok(())
            }
            Command::Array(ArrayItems::RasterPixelFill(dwells)) => {
                for _ in dwells {
                    self.raster_fill()?;
                }
                Ok(())
            }
            Command::Array(ArrayItems::VectorPixel(points)) => {
                for VectorPoint { x, y, .. } in points {
                    self.sample(x, y, OutputEnable::Enabled)?;
                }
                Ok(())
            }
            Command::RasterPixelFill { .. } => self.raster_fill(),
            Command::RasterRegion { x, y } => {
                self.region = (x, y);
                self.reset_position();
                Ok(())
            }
            Command::RasterPixel { output, .. } => self.raster_pixel(output),
            Command::RasterPixelRun { length, output, .. } => {
                for _ in 0..=length as u32 {
                    self.raster_pixel(output)?;
                }
                Ok(())
            }
            Command::RasterPixelFreeRun { dwell } => {
                self.free_run = Some(dwell);
                Ok(())
            }
            Command::VectorPixel { x, y, output, .. } => self.sample(x, y, output),
        }
    }

    fn reset_position(&mut self) {
        self.x_index = 0;
        self.y_index = 0;
    }

    fn raster_pixel(&mut self, output: OutputEnable) -> Result<(), HostGone> {
        let (x_range, y_range) = self.region;
        let x = x_range.code_at(self.x_index);
        let y = y_range.code_at(self.y_index);
        self.x_index += 1;
        if self.x_index >= x_range.count as u32 {
            self.x_index = 0;
            self.y_index += 1;
            if self.y_index >= y_range.count as u32 {
                self.y_index = 0;
            }
        }
        self.sample(x, y, output)
    }

    /// Scan out the rest of the current frame.
    fn raster_fill(&mut self) -> Result<(), HostGone> {
        loop {
            self.raster_pixel(OutputEnable::Enabled)?;
            if self.x_index == 0 && self.y_index == 0 {
                return Ok(());
            }
        }
    }

    fn free_run_line(&mut self, _dwell: u16) -> Result<(), HostGone> {
        loop {
            self.raster_pixel(OutputEnable::Enabled)?;
            if self.x_index == 0 {
                return Ok(());
            }
        }
    }

    fn sample(&mut self, x: u16, y: u16, output: OutputEnable) -> Result<(), HostGone> {
        if !output.is_enabled() || self.output == OutputMode::NoOutput {
            return Ok(());
        }
        let value = match &self.options.pattern {
            SamplePattern::Counter => self.counter,
            SamplePattern::Constant(value) => *value,
            SamplePattern::Position(f) => f(x, y),
        };
        self.counter = self.counter.wrapping_add(1);
        self.fifo
            .extend_from_slice(&encode_samples(&[value], self.output));
        if self.fifo.len() >= DEVICE_FIFO_LEVEL {
            self.send_fifo()?;
        }
        Ok(())
    }

    fn send_fifo(&mut self) -> Result<(), HostGone> {
        if self.fifo.is_empty() {
            return Ok(());
        }
        if let Some(max) = self.options.jitter {
            let delay = self.next_random() % (max.as_micros() as u64 + 1);
            thread::sleep(Duration::from_micros(delay));
        }
        let bytes = std::mem::take(&mut self.fifo);
        self.replies.send(bytes).map_err(|_| HostGone)
    }

    /// xorshift64
    fn next_random(&mut self) -> u64 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        x
    }
}

/// Records every byte written so tests can decode what was sent
#[derive(Clone, Default)]
pub struct WriteLog {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl WriteLog {
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn commands(&self) -> Result<Vec<Command>, BeamError> {
        decode_all(&self.bytes.lock())
    }

    pub fn clear(&self) {
        self.bytes.lock().clear();
    }
}

impl Write for WriteLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serves a fixed reply `chunk` bytes per read, then end of stream
pub struct ScriptedReader {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .chunk
            .min(buf.len())
            .min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// A stream with canned replies that records what the host writes.
pub struct ScriptedStream {
    stream: IoStream<WriteLog, ScriptedReader>,
    written: WriteLog,
}

impl ScriptedStream {
    pub fn new(replies: &[u8], chunk: usize) -> Self {
        let written = WriteLog::default();
        let reader = ScriptedReader {
            data: replies.to_vec(),
            pos: 0,
            chunk: chunk.max(1),
        };
        Self {
            stream: IoStream::new(written.clone(), reader, DEFAULT_READ_BUFFER),
            written,
        }
    }

    pub fn written(&self) -> WriteLog {
        self.written.clone()
    }
}

impl Stream for ScriptedStream {
    fn split(&mut self) -> (&mut dyn ByteSink, &mut dyn ByteSource) {
        self.stream.split()
    }
}
