//! Session with the scan engine: connect, synchronize, transfer.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::error::BeamError;
use crate::protocol::{Command, decode_samples, sync_sentinel};
use crate::streaming::{AbortHandle, ScanOptions, ScanPoint, StreamReport, stream_points};
use crate::transport::{Connector, Stream};
use crate::types::{DacCodeRange, DwellTime, OutputEnable, OutputMode, SyncMode, VectorPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, but the command queue state is unknown
    Unsynchronized,
    Synchronizing,
    Synchronized,
}

/// One logical session with the device.
///
/// Owns the stream exclusively. Every transfer first brings the device to a
/// known state with a cookie handshake; any transport failure drops the
/// stream and surfaces as [`BeamError::Transfer`].
pub struct Connection {
    connector: Option<Box<dyn Connector>>,
    stream: Option<Box<dyn Stream>>,
    state: ConnectionState,
    next_cookie: u16,
    desired: SyncMode,
    active: Option<SyncMode>,
}

fn initial_cookie() -> u16 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u16)
        .unwrap_or(0);
    millis & !1
}

impl Connection {
    /// A connection that opens its stream through `connector` on first use.
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Some(Box::new(connector)),
            stream: None,
            state: ConnectionState::Disconnected,
            next_cookie: initial_cookie(),
            desired: SyncMode::default(),
            active: None,
        }
    }

    /// Wrap an already open stream. It cannot be reopened once it fails.
    pub fn from_stream(stream: Box<dyn Stream>) -> Self {
        Self {
            connector: None,
            stream: Some(stream),
            state: ConnectionState::Unsynchronized,
            next_cookie: initial_cookie(),
            desired: SyncMode::default(),
            active: None,
        }
    }

    /// Start the cookie sequence at `seed` (rounded down to even).
    pub fn with_cookie_seed(mut self, seed: u16) -> Self {
        self.next_cookie = seed & !1;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_synchronized(&self) -> bool {
        self.state == ConnectionState::Synchronized
    }

    /// Mode the device was last synchronized into
    pub fn active_mode(&self) -> Option<SyncMode> {
        self.active
    }

    pub fn desired_mode(&self) -> SyncMode {
        self.desired
    }

    /// Request a mode for the next handshake. A change from the active mode
    /// forces a new handshake before the next transfer.
    pub fn set_mode(&mut self, mode: SyncMode) {
        self.desired = mode;
    }

    pub fn connect(&mut self) -> Result<(), BeamError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let connector = self.connector.as_mut().ok_or(BeamError::NotConnected)?;
        self.state = ConnectionState::Connecting;
        match connector.connect() {
            Ok(stream) => {
                info!("Connected to {}", connector.describe());
                self.stream = Some(stream);
                self.state = ConnectionState::Unsynchronized;
                self.active = None;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(BeamError::Transfer {
                    context: format!("connecting to {}", connector.describe()),
                    source: Box::new(e),
                })
            }
        }
    }

    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            info!("Disconnected");
        }
        self.state = ConnectionState::Disconnected;
        self.active = None;
    }

    /// Mark the device's queue state unknown; the next transfer resynchronizes.
    pub fn invalidate(&mut self) {
        if self.stream.is_some() {
            self.state = ConnectionState::Unsynchronized;
        }
    }

    fn next_sync_cookie(&mut self) -> u16 {
        let cookie = self.next_cookie;
        self.next_cookie = self.next_cookie.wrapping_add(2);
        cookie
    }

    /// An odd cookie for tagging outgoing commands; never collides with a
    /// synchronization cookie.
    pub fn allocate_cookie(&mut self) -> u16 {
        let cookie = self.next_sync_cookie() | 1;
        debug!("allocating cookie {cookie:#06x}");
        cookie
    }

    /// Run `op` on the stream; transport failures disconnect, anything
    /// else leaves the queue state unknown.
    fn guarded<T>(
        &mut self,
        context: &str,
        op: impl FnOnce(&mut dyn Stream) -> Result<T, BeamError>,
    ) -> Result<T, BeamError> {
        let stream = self.stream.as_mut().ok_or(BeamError::NotConnected)?;
        match op(stream.as_mut()) {
            Ok(value) => Ok(value),
            Err(e) if e.is_transport() => {
                warn!("Transport failure while {context}: {e}");
                self.disconnect();
                Err(match e {
                    BeamError::Transfer { .. } => e,
                    other => BeamError::Transfer {
                        context: context.to_string(),
                        source: Box::new(other),
                    },
                })
            }
            Err(e) => {
                self.state = ConnectionState::Unsynchronized;
                Err(e)
            }
        }
    }

    /// Bring the device into the desired mode with a known empty queue.
    ///
    /// Does nothing when already synchronized in that mode.
    pub fn synchronize(&mut self) -> Result<(), BeamError> {
        self.connect()?;
        if self.state == ConnectionState::Synchronized && self.active == Some(self.desired) {
            debug!("already synchronized");
            return Ok(());
        }

        let mode = self.desired;
        let cookie = self.next_sync_cookie();
        debug!("synchronizing with cookie {cookie:#06x} into {mode:?}");
        self.state = ConnectionState::Synchronizing;

        let mut request = Vec::new();
        Command::Synchronize {
            cookie,
            raster: mode.raster,
            output: mode.output,
        }
        .encode_into(&mut request)?;
        Command::Flush.encode_into(&mut request)?;

        let discarded = self.guarded("synchronizing", |stream| {
            stream.write(&request)?;
            stream.flush()?;
            let received = stream.read_until(&sync_sentinel(cookie))?;
            Ok(received.len().saturating_sub(4))
        })?;
        if discarded > 0 {
            debug!("discarded {discarded} stale bytes before sentinel");
        }
        self.state = ConnectionState::Synchronized;
        self.active = Some(mode);
        Ok(())
    }

    /// Synchronize into `mode`, re-handshaking only if it differs.
    pub fn synchronize_mode(&mut self, mode: SyncMode) -> Result<(), BeamError> {
        self.set_mode(mode);
        self.synchronize()
    }

    fn output_mode(&self) -> OutputMode {
        self.active.map(|mode| mode.output).unwrap_or_default()
    }

    /// Send raw bytes and flush, without reading anything back.
    pub fn transfer_bytes(&mut self, bytes: &[u8]) -> Result<(), BeamError> {
        self.synchronize()?;
        self.guarded("sending bytes", |stream| {
            stream.write(bytes)?;
            stream.flush()
        })
    }

    /// Send one command and flush, without reading anything back.
    pub fn transfer_raw(&mut self, command: &Command) -> Result<(), BeamError> {
        self.transfer_bytes(&command.encode()?)
    }

    /// Send one command and collect the samples it produces.
    pub fn transfer(&mut self, command: &Command) -> Result<Vec<u16>, BeamError> {
        self.transfer_all(std::slice::from_ref(command))
    }

    /// Send a command sequence and collect every sample it produces.
    pub fn transfer_all(&mut self, commands: &[Command]) -> Result<Vec<u16>, BeamError> {
        self.synchronize()?;
        let mode = self.output_mode();
        let mut request = Vec::new();
        for command in commands {
            command.encode_into(&mut request)?;
        }
        Command::Flush.encode_into(&mut request)?;
        let points: usize = commands.iter().map(Command::output_points).sum();
        let bytes = self.guarded("transferring commands", |stream| {
            stream.write(&request)?;
            stream.flush()?;
            stream.read(points * mode.bytes_per_sample())
        })?;
        decode_samples(&bytes, mode)
    }

    /// Visit one point in vector mode and return its sample.
    pub fn transfer_vector_pixel(&mut self, x: u16, y: u16, dwell: u16) -> Result<u16, BeamError> {
        let output = match self.desired.output {
            OutputMode::NoOutput => OutputMode::SixteenBit,
            other => other,
        };
        self.synchronize_mode(SyncMode::vector(output))?;
        let samples = self.transfer(&Command::VectorPixel {
            x,
            y,
            dwell,
            output: OutputEnable::Enabled,
        })?;
        samples
            .first()
            .copied()
            .ok_or_else(|| BeamError::Protocol("vector pixel returned no sample".to_string()))
    }

    /// Stream an arbitrary point sequence in the currently desired mode.
    ///
    /// After an abort the connection is left unsynchronized, so the next
    /// transfer drains whatever the device still sends.
    pub fn transfer_stream<P, I, F>(
        &mut self,
        points: I,
        options: &ScanOptions,
        abort: &AbortHandle,
        on_samples: F,
    ) -> Result<StreamReport, BeamError>
    where
        P: ScanPoint,
        I: IntoIterator<Item = P>,
        I::IntoIter: Send,
        F: FnMut(&[u16]) -> Result<(), BeamError>,
    {
        self.synchronize()?;
        let mut options = options.clone();
        options.output = self.output_mode();
        let report = self.guarded("streaming", |stream| {
            stream_points(stream, points, &options, abort, on_samples)
        })?;
        if report.aborted {
            self.state = ConnectionState::Unsynchronized;
        }
        Ok(report)
    }

    /// Raster-scan a region with the given per-pixel dwells.
    pub fn raster_scan<I, F>(
        &mut self,
        x: DacCodeRange,
        y: DacCodeRange,
        dwells: I,
        options: &ScanOptions,
        abort: &AbortHandle,
        on_samples: F,
    ) -> Result<StreamReport, BeamError>
    where
        I: IntoIterator<Item = DwellTime>,
        I::IntoIter: Send,
        F: FnMut(&[u16]) -> Result<(), BeamError>,
    {
        self.synchronize_mode(SyncMode::raster(options.output))?;
        let region = Command::RasterRegion { x, y }.encode()?;
        self.guarded("starting raster region", |stream| stream.write(&region))?;
        self.transfer_stream(dwells, options, abort, on_samples)
    }

    /// Visit explicit beam positions in order.
    pub fn vector_scan<I, F>(
        &mut self,
        points: I,
        options: &ScanOptions,
        abort: &AbortHandle,
        on_samples: F,
    ) -> Result<StreamReport, BeamError>
    where
        I: IntoIterator<Item = VectorPoint>,
        I::IntoIter: Send,
        F: FnMut(&[u16]) -> Result<(), BeamError>,
    {
        self.synchronize_mode(SyncMode::vector(options.output))?;
        self.transfer_stream(points, options, abort, on_samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_samples;
    use crate::transport::{MockConnector, MockOptions, ScriptedStream};

    #[test]
    fn test_sync_discards_exactly_the_garbage_prefix() {
        let mut replies = vec![0x12, 0x34, 0xff, 0x00, 0xff];
        replies.extend_from_slice(&sync_sentinel(0x1f2a));
        replies.extend_from_slice(&[0xab, 0xcd]);
        let stream = ScriptedStream::new(&replies, 3);
        let written = stream.written();
        let mut conn = Connection::from_stream(Box::new(stream)).with_cookie_seed(0x1f2a);

        conn.synchronize().unwrap();
        assert_eq!(conn.state(), ConnectionState::Synchronized);
        assert_eq!(written.bytes(), vec![0x01, 0x1f, 0x2a, 0x20]);

        // already synchronized: the next transfer reads the trailing bytes
        let samples = conn
            .transfer(&Command::RasterPixel {
                dwell: 1,
                output: OutputEnable::Enabled,
            })
            .unwrap();
        assert_eq!(samples, vec![0xabcd]);
    }

    #[test]
    fn test_cookies_even_for_sync_odd_for_commands() {
        let stream = ScriptedStream::new(&[], 1);
        let mut conn = Connection::from_stream(Box::new(stream)).with_cookie_seed(0xfffe);
        assert_eq!(conn.next_sync_cookie(), 0xfffe);
        assert_eq!(conn.allocate_cookie(), 0x0001);
        assert_eq!(conn.next_sync_cookie(), 0x0002);
        assert_eq!(initial_cookie() % 2, 0);
    }

    #[test]
    fn test_incomplete_sync_disconnects() {
        let stream = ScriptedStream::new(&[0x00, 0xff, 0xff], 2);
        let mut conn = Connection::from_stream(Box::new(stream)).with_cookie_seed(4);
        let err = conn.synchronize().unwrap_err();
        assert!(matches!(err, BeamError::Transfer { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
        assert!(matches!(conn.synchronize(), Err(BeamError::NotConnected)));
    }

    #[test]
    fn test_mode_change_forces_handshake() {
        let mut replies = sync_sentinel(10).to_vec();
        replies.extend_from_slice(&sync_sentinel(12));
        replies.extend_from_slice(&encode_samples(&[0x55], OutputMode::EightBit));
        let stream = ScriptedStream::new(&replies, 16);
        let written = stream.written();
        let mut conn = Connection::from_stream(Box::new(stream)).with_cookie_seed(10);

        conn.synchronize().unwrap();
        conn.synchronize().unwrap();
        conn.synchronize_mode(SyncMode::vector(OutputMode::EightBit))
            .unwrap();
        assert_eq!(conn.active_mode(), Some(SyncMode::vector(OutputMode::EightBit)));

        let commands = written.commands().unwrap();
        let syncs = commands
            .iter()
            .filter(|c| matches!(c, Command::Synchronize { .. }))
            .count();
        assert_eq!(syncs, 2);
        let samples = conn
            .transfer(&Command::VectorPixel {
                x: 1,
                y: 2,
                dwell: 3,
                output: OutputEnable::Enabled,
            })
            .unwrap();
        assert_eq!(samples, vec![0x55]);
    }

    #[test]
    fn test_connects_lazily_through_connector() {
        let connector = MockConnector::new(MockOptions::default());
        let log = connector.log();
        let mut conn = Connection::new(connector.clone());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let sample = conn.transfer_vector_pixel(100, 200, 4).unwrap();
        assert_eq!(sample, 0);
        assert_eq!(connector.connects(), 1);
        assert_eq!(conn.active_mode(), Some(SyncMode::vector(OutputMode::SixteenBit)));
        assert_eq!(
            log.count(|c| matches!(c, Command::Synchronize { raster: false, .. })),
            1
        );
    }

    #[test]
    fn test_raster_scan_end_to_end() {
        let connector = MockConnector::new(MockOptions::default());
        let log = connector.log();
        let mut conn = Connection::new(connector);
        let x = DacCodeRange::new(0, 8, 256).unwrap();
        let y = DacCodeRange::new(0, 4, 256).unwrap();
        let options = ScanOptions {
            latency: 10,
            window: 2,
            ..ScanOptions::default()
        };
        let mut samples = Vec::new();
        let report = conn
            .raster_scan(
                x,
                y,
                std::iter::repeat(DwellTime(1)).take(32),
                &options,
                &AbortHandle::new(),
                |chunk| {
                    samples.extend_from_slice(chunk);
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(samples, (0..32).collect::<Vec<u16>>());
        assert_eq!(report.chunks_sent, 4);
        assert!(conn.is_synchronized());
        assert_eq!(log.count(|c| matches!(c, Command::RasterRegion { .. })), 1);
    }

    #[test]
    fn test_aborted_stream_leaves_connection_unsynchronized() {
        let connector = MockConnector::new(MockOptions::default());
        let mut conn = Connection::new(connector);
        let abort = AbortHandle::new();
        abort.abort();
        let report = conn
            .vector_scan(
                vec![VectorPoint::new(1, 1, 2); 10],
                &ScanOptions::default(),
                &abort,
                |_| Ok(()),
            )
            .unwrap();
        assert!(report.aborted);
        assert_eq!(report.chunks_sent, 0);
        assert_eq!(conn.state(), ConnectionState::Unsynchronized);

        // the next transfer resynchronizes on its own
        abort.reset();
        conn.transfer_vector_pixel(0, 0, 2).unwrap();
        assert!(conn.is_synchronized());
    }

    #[test]
    fn test_schema_error_does_not_disconnect() {
        let connector = MockConnector::new(MockOptions::default());
        let mut conn = Connection::new(connector);
        let options = ScanOptions {
            latency: 4,
            ..ScanOptions::default()
        };
        let result = conn.vector_scan(
            vec![VectorPoint::new(0, 0, 9)],
            &options,
            &AbortHandle::new(),
            |_| Ok(()),
        );
        assert!(matches!(result, Err(BeamError::Schema(_))));
        assert!(conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Unsynchronized);
    }
}
