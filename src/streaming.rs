//! Windowed streaming of long pixel programs.
//!
//! Points are grouped into chunks whose total dwell stays within a latency
//! budget. A producer thread encodes and writes chunks while the caller's
//! thread reads each chunk's samples back in order. At most `window` chunks
//! are written but not yet consumed at any time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, unbounded};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::error::BeamError;
use crate::protocol::{ArrayItems, Command, MAX_ARRAY_LEN, decode_samples};
use crate::transport::{ByteSink, ByteSource, Stream};
use crate::types::{DwellTime, OutputEnable, OutputMode, VectorPoint};

/// Cooperative cancellation shared between a scan and whoever wants to stop it
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm after an aborted scan.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Tuning for a streamed scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Most dwell (in wire units) a single chunk may contain
    pub latency: u32,
    /// Chunks allowed in flight between producer and consumer
    pub window: usize,
    pub output: OutputMode,
    #[serde(skip)]
    pub output_enable: OutputEnable,
    /// Blank the beam once the program ends
    pub blank_on_finish: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            latency: 65536,
            window: 32,
            output: OutputMode::SixteenBit,
            output_enable: OutputEnable::Enabled,
            blank_on_finish: true,
        }
    }
}

impl ScanOptions {
    pub fn validate(&self) -> Result<(), BeamError> {
        if self.latency == 0 {
            return Err(BeamError::InvalidParameter(
                "latency budget must be positive".to_string(),
            ));
        }
        if self.window == 0 {
            return Err(BeamError::InvalidParameter(
                "window must hold at least one chunk".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters gathered over one streamed scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReport {
    pub chunks_sent: usize,
    pub chunks_received: usize,
    pub samples: usize,
    pub max_in_flight: usize,
    pub aborted: bool,
}

/// A point that can be streamed: raster dwells or vector positions.
pub trait ScanPoint: Copy + Send {
    fn dwell(&self) -> u16;

    /// Append the commands for one chunk and return the samples it produces.
    fn encode_chunk(
        chunk: &[Self],
        output: OutputEnable,
        out: &mut Vec<u8>,
    ) -> Result<usize, BeamError>;
}

impl ScanPoint for DwellTime {
    fn dwell(&self) -> u16 {
        self.0
    }

    fn encode_chunk(
        chunk: &[Self],
        output: OutputEnable,
        out: &mut Vec<u8>,
    ) -> Result<usize, BeamError> {
        let Some(first) = chunk.first() else {
            return Ok(0);
        };
        if chunk.iter().all(|p| p == first) {
            Command::RasterPixelRun {
                length: (chunk.len() - 1) as u16,
                dwell: first.0,
                output,
            }
            .encode_into(out)?;
        } else if output.is_enabled() {
            Command::Array(ArrayItems::RasterPixel(chunk.iter().map(|p| p.0).collect()))
                .encode_into(out)?;
        } else {
            for point in chunk {
                Command::RasterPixel {
                    dwell: point.0,
                    output,
                }
                .encode_into(out)?;
            }
        }
        Ok(if output.is_enabled() { chunk.len() } else { 0 })
    }
}

impl ScanPoint for VectorPoint {
    fn dwell(&self) -> u16 {
        self.dwell
    }

    fn encode_chunk(
        chunk: &[Self],
        output: OutputEnable,
        out: &mut Vec<u8>,
    ) -> Result<usize, BeamError> {
        if chunk.len() > 1 && output.is_enabled() {
            Command::Array(ArrayItems::VectorPixel(chunk.to_vec())).encode_into(out)?;
        } else {
            // array elements carry no flags, so disabled points go one by one
            for point in chunk {
                Command::VectorPixel {
                    x: point.x,
                    y: point.y,
                    dwell: point.dwell,
                    output,
                }
                .encode_into(out)?;
            }
        }
        Ok(if output.is_enabled() { chunk.len() } else { 0 })
    }
}

/// Splits a point sequence into chunks bounded by a dwell budget.
///
/// A chunk closes when its dwell total reaches the budget exactly or it
/// holds [`MAX_ARRAY_LEN`] points. A point that would overflow the budget
/// opens the next chunk instead.
pub struct Chunker<I: Iterator> {
    points: I,
    latency: u64,
    carry: Option<I::Item>,
    failed: bool,
}

impl<I> Chunker<I>
where
    I: Iterator,
    I::Item: ScanPoint,
{
    pub fn new(points: I, latency: u32) -> Result<Self, BeamError> {
        if latency == 0 {
            return Err(BeamError::InvalidParameter(
                "latency budget must be positive".to_string(),
            ));
        }
        Ok(Self {
            points,
            latency: latency as u64,
            carry: None,
            failed: false,
        })
    }
}

impl<I> Iterator for Chunker<I>
where
    I: Iterator,
    I::Item: ScanPoint,
{
    type Item = Result<Vec<I::Item>, BeamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let mut chunk = Vec::new();
        let mut total = 0u64;
        while let Some(point) = self.carry.take().or_else(|| self.points.next()) {
            let dwell = point.dwell() as u64;
            if dwell > self.latency {
                self.failed = true;
                return Some(Err(BeamError::Schema(format!(
                    "point dwell {dwell} exceeds latency budget {}",
                    self.latency
                ))));
            }
            if total + dwell > self.latency {
                self.carry = Some(point);
                break;
            }
            total += dwell;
            chunk.push(point);
            if total == self.latency || chunk.len() == MAX_ARRAY_LEN {
                break;
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}

/// Bookkeeping shared by both sides of the pipeline
#[derive(Default)]
struct Shared {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    stop: AtomicBool,
}

struct Produced {
    chunks_sent: usize,
    aborted: bool,
}

struct Consumed {
    chunks_received: usize,
    samples: usize,
}

fn finish_program(sink: &mut dyn ByteSink, blank: bool) -> Result<(), BeamError> {
    let mut bytes = Vec::new();
    if blank {
        Command::Blank {
            enable: true,
            inline: false,
        }
        .encode_into(&mut bytes)?;
    }
    Command::Flush.encode_into(&mut bytes)?;
    sink.write(&bytes)?;
    sink.flush()
}

/// Run the producer side. On failure whatever was already written is still
/// flushed behind a blank, so the consumer's outstanding reads complete.
fn produce<P, I>(
    sink: &mut dyn ByteSink,
    points: I,
    options: &ScanOptions,
    abort: &AbortHandle,
    shared: &Shared,
    tokens: Receiver<()>,
    sent: Sender<usize>,
) -> Result<Produced, BeamError>
where
    P: ScanPoint,
    I: Iterator<Item = P>,
{
    let mut chunks_sent = 0;
    let result = produce_chunks(
        sink,
        points,
        options,
        abort,
        shared,
        tokens,
        sent,
        &mut chunks_sent,
    );
    if let Err(e) = &result {
        warn!("Producer failed after {chunks_sent} chunks: {e}");
        shared.stop.store(true, Ordering::SeqCst);
        if let Err(flush_err) = finish_program(sink, true) {
            debug!("Could not flush after producer failure: {flush_err}");
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn produce_chunks<P, I>(
    sink: &mut dyn ByteSink,
    points: I,
    options: &ScanOptions,
    abort: &AbortHandle,
    shared: &Shared,
    tokens: Receiver<()>,
    sent: Sender<usize>,
    chunks_sent: &mut usize,
) -> Result<Produced, BeamError>
where
    P: ScanPoint,
    I: Iterator<Item = P>,
{
    let mut bytes = Vec::new();
    for chunk in Chunker::new(points, options.latency)? {
        let chunk = chunk?;
        if abort.is_aborted() || shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let token = match tokens.try_recv() {
            Ok(token) => Ok(token),
            Err(TryRecvError::Empty) => {
                // the device must not sit on samples we are about to wait for
                trace!("Window full after {} chunks, flushing", *chunks_sent);
                Command::Flush.encode_into(&mut bytes)?;
                sink.write(&bytes)?;
                sink.flush()?;
                bytes.clear();
                tokens.recv().map_err(|_| ())
            }
            Err(TryRecvError::Disconnected) => Err(()),
        };
        if token.is_err() || abort.is_aborted() {
            break;
        }

        bytes.clear();
        let samples = P::encode_chunk(&chunk, options.output_enable, &mut bytes)?;
        let samples = if options.output == OutputMode::NoOutput {
            0
        } else {
            samples
        };
        sink.write(&bytes)?;
        bytes.clear();

        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        *chunks_sent += 1;
        trace!("Chunk {}: {} points, {samples} samples", *chunks_sent, chunk.len());
        if sent.send(samples).is_err() {
            break;
        }
    }

    let aborted = abort.is_aborted() || shared.stop.load(Ordering::SeqCst);
    if aborted {
        warn!("Scan aborted after {} chunks", *chunks_sent);
    }
    finish_program(sink, aborted || options.blank_on_finish)?;
    Ok(Produced {
        chunks_sent: *chunks_sent,
        aborted,
    })
}

fn consume<F>(
    source: &mut dyn ByteSource,
    mode: OutputMode,
    shared: &Shared,
    tokens: Sender<()>,
    sent: Receiver<usize>,
    on_samples: &mut F,
) -> Result<Consumed, BeamError>
where
    F: FnMut(&[u16]) -> Result<(), BeamError>,
{
    let mut consumed = Consumed {
        chunks_received: 0,
        samples: 0,
    };
    for expected in sent.iter() {
        let bytes = source.read(expected * mode.bytes_per_sample())?;
        let samples = decode_samples(&bytes, mode)?;
        if !samples.is_empty() {
            on_samples(&samples)?;
        }
        consumed.chunks_received += 1;
        consumed.samples += samples.len();
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        // the producer may already be gone
        let _ = tokens.send(());
    }
    Ok(consumed)
}

/// Stream `points` over `stream` and hand every chunk's samples to
/// `on_samples` in order.
///
/// The stream must already be synchronized in a mode matching the points,
/// with `options.output` as its output mode. On return the device has been
/// sent a `Flush` (and a `Blank` when aborted or `blank_on_finish` is set).
pub fn stream_points<P, I, F>(
    stream: &mut dyn Stream,
    points: I,
    options: &ScanOptions,
    abort: &AbortHandle,
    mut on_samples: F,
) -> Result<StreamReport, BeamError>
where
    P: ScanPoint,
    I: IntoIterator<Item = P>,
    I::IntoIter: Send,
    F: FnMut(&[u16]) -> Result<(), BeamError>,
{
    options.validate()?;
    let points = points.into_iter();
    let shared = Shared::default();
    let (token_tx, token_rx) = bounded(options.window);
    for _ in 0..options.window {
        token_tx
            .send(())
            .map_err(|_| BeamError::Protocol("token window closed early".to_string()))?;
    }
    let (sent_tx, sent_rx) = unbounded();
    let (sink, source) = stream.split();

    let (produced, consumed) = thread::scope(|scope| {
        let shared = &shared;
        let producer = scope.spawn(move || {
            let result = produce(sink, points, options, abort, shared, token_rx, sent_tx);
            if result.is_err() {
                shared.stop.store(true, Ordering::SeqCst);
            }
            result
        });
        let consumed = consume(
            source,
            options.output,
            shared,
            token_tx,
            sent_rx,
            &mut on_samples,
        );
        if consumed.is_err() {
            shared.stop.store(true, Ordering::SeqCst);
        }
        let produced = producer
            .join()
            .unwrap_or_else(|_| Err(BeamError::Protocol("stream producer panicked".to_string())));
        (produced, consumed)
    });

    let (produced, consumed) = match (produced, consumed) {
        (Ok(produced), Ok(consumed)) => (produced, consumed),
        (Err(e), _) | (Ok(_), Err(e)) => return Err(e),
    };
    let report = StreamReport {
        chunks_sent: produced.chunks_sent,
        chunks_received: consumed.chunks_received,
        samples: consumed.samples,
        max_in_flight: shared.max_in_flight.load(Ordering::SeqCst),
        aborted: produced.aborted,
    };
    debug!("Stream finished: {report:?}");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, encode_samples, sync_sentinel};
    use crate::transport::{MockDevice, MockOptions, ScriptedStream};
    use crate::types::DacCodeRange;
    use std::time::{Duration, Instant};

    fn dwells(values: &[u16]) -> Vec<DwellTime> {
        values.iter().copied().map(DwellTime).collect()
    }

    fn chunk_sizes<P: ScanPoint>(points: Vec<P>, latency: u32) -> Vec<usize> {
        Chunker::new(points.into_iter(), latency)
            .unwrap()
            .map(|chunk| chunk.unwrap().len())
            .collect()
    }

    #[test]
    fn test_chunks_close_at_budget() {
        assert_eq!(chunk_sizes(dwells(&[2, 2, 2, 2, 2]), 4), vec![2, 2, 1]);
        // 3 + 2 would overflow, so the 2 opens the next chunk
        assert_eq!(chunk_sizes(dwells(&[3, 2, 2, 1]), 4), vec![1, 2, 1]);
    }

    #[test]
    fn test_chunk_dwell_never_exceeds_budget() {
        let values: Vec<u16> = (0..500u16).map(|i| (i * 37) % 101).collect();
        let latency = 256;
        for chunk in Chunker::new(dwells(&values).into_iter(), latency).unwrap() {
            let chunk = chunk.unwrap();
            let total: u32 = chunk.iter().map(|p| p.0 as u32).sum();
            assert!(total <= latency);
            assert!(chunk.len() <= MAX_ARRAY_LEN);
        }
    }

    #[test]
    fn test_chunk_count_ceiling() {
        let points = vec![DwellTime(0); MAX_ARRAY_LEN + 10];
        assert_eq!(chunk_sizes(points, 100), vec![MAX_ARRAY_LEN, 10]);
    }

    #[test]
    fn test_oversized_point_fails_fast() {
        let mut chunker = Chunker::new(dwells(&[1, 9, 1]).into_iter(), 4).unwrap();
        assert!(matches!(chunker.next(), Some(Err(BeamError::Schema(_)))));
        assert!(chunker.next().is_none());
        assert!(matches!(
            Chunker::new(dwells(&[1]).into_iter(), 0),
            Err(BeamError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_raster_chunk_encoding() {
        let mut out = Vec::new();
        let n = DwellTime::encode_chunk(&dwells(&[5, 5, 5]), OutputEnable::Enabled, &mut out)
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            crate::protocol::decode_all(&out).unwrap(),
            vec![Command::RasterPixelRun {
                length: 2,
                dwell: 5,
                output: OutputEnable::Enabled
            }]
        );

        out.clear();
        DwellTime::encode_chunk(&dwells(&[1, 2]), OutputEnable::Enabled, &mut out).unwrap();
        assert_eq!(
            crate::protocol::decode_all(&out).unwrap(),
            vec![Command::Array(ArrayItems::RasterPixel(vec![1, 2]))]
        );

        out.clear();
        let n = DwellTime::encode_chunk(&dwells(&[1, 2]), OutputEnable::Disabled, &mut out)
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(crate::protocol::decode_all(&out).unwrap().len(), 2);
    }

    #[test]
    fn test_vector_chunk_encoding() {
        let mut out = Vec::new();
        VectorPoint::encode_chunk(&[VectorPoint::new(1, 2, 3)], OutputEnable::Enabled, &mut out)
            .unwrap();
        assert_eq!(out.len(), 7);
        out.clear();
        let points = [VectorPoint::new(1, 2, 3), VectorPoint::new(4, 5, 6)];
        VectorPoint::encode_chunk(&points, OutputEnable::Enabled, &mut out).unwrap();
        assert_eq!(
            crate::protocol::decode_all(&out).unwrap(),
            vec![Command::Array(ArrayItems::VectorPixel(points.to_vec()))]
        );
    }

    #[test]
    fn test_oversized_point_after_chunks_in_flight_fails_fast() {
        let options = MockOptions {
            read_timeout: Duration::from_secs(5),
            ..MockOptions::default()
        };
        let (device, mut stream) = synced_device(options);
        let scan = ScanOptions {
            latency: 4,
            ..ScanOptions::default()
        };
        let mut received = Vec::new();
        let started = Instant::now();
        let result = stream_points(
            &mut stream,
            dwells(&[1, 1, 1, 1, 9]),
            &scan,
            &AbortHandle::new(),
            |samples| {
                received.extend_from_slice(samples);
                Ok(())
            },
        );
        assert!(matches!(result, Err(BeamError::Schema(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        // the chunk already sent was still answered
        assert_eq!(received, vec![0, 1, 2, 3]);

        let log = device.log().clone();
        drop(stream);
        device.join();
        assert_eq!(
            log.commands().last(),
            Some(&Command::Flush)
        );
        assert_eq!(
            log.count(|c| matches!(c, Command::Blank { enable: true, inline: false })),
            1
        );
    }

    fn synced_device(options: MockOptions) -> (MockDevice, crate::transport::mock::MockStream) {
        let (device, mut stream) = MockDevice::spawn(options).unwrap();
        let x = DacCodeRange::new(0, 64, 256).unwrap();
        let y = DacCodeRange::new(0, 64, 256).unwrap();
        let mut bytes = Vec::new();
        Command::Synchronize {
            cookie: 2,
            raster: true,
            output: OutputMode::SixteenBit,
        }
        .encode_into(&mut bytes)
        .unwrap();
        Command::RasterRegion { x, y }.encode_into(&mut bytes).unwrap();
        Command::Flush.encode_into(&mut bytes).unwrap();
        stream.write(&bytes).unwrap();
        stream.flush().unwrap();
        stream.read_until(&sync_sentinel(2)).unwrap();
        (device, stream)
    }

    #[test]
    fn test_pipeline_preserves_order_under_jitter() {
        let options = MockOptions {
            jitter: Some(Duration::from_micros(300)),
            ..MockOptions::default()
        };
        let (_device, mut stream) = synced_device(options);
        let points: Vec<DwellTime> = (0..4096u32).map(|i| DwellTime((i % 7) as u16)).collect();
        let scan = ScanOptions {
            latency: 40,
            window: 4,
            ..ScanOptions::default()
        };
        let mut received = Vec::new();
        let report = stream_points(&mut stream, points, &scan, &AbortHandle::new(), |samples| {
            received.extend_from_slice(samples);
            Ok(())
        })
        .unwrap();

        assert_eq!(received, (0..4096u32).map(|i| i as u16).collect::<Vec<_>>());
        assert_eq!(report.samples, 4096);
        assert_eq!(report.chunks_sent, report.chunks_received);
        assert!(report.max_in_flight >= 1);
        assert!(report.max_in_flight <= 4);
        assert!(!report.aborted);
    }

    #[test]
    fn test_abort_blanks_and_drains() {
        let (device, mut stream) = synced_device(MockOptions::default());
        let abort = AbortHandle::new();
        let scan = ScanOptions {
            latency: 64,
            window: 2,
            blank_on_finish: false,
            ..ScanOptions::default()
        };
        let points = std::iter::repeat(DwellTime(1));
        let mut chunks = 0;
        let report = stream_points(&mut stream, points, &scan, &abort, |_| {
            chunks += 1;
            if chunks == 5 {
                abort.abort();
            }
            Ok(())
        })
        .unwrap();

        assert!(report.aborted);
        assert_eq!(report.chunks_sent, report.chunks_received);
        assert!(report.chunks_sent >= 5);
        assert_eq!(report.samples, report.chunks_received * 64);

        let log = device.log().clone();
        drop(stream);
        device.join();
        let commands = log.commands();
        assert_eq!(
            commands[commands.len() - 2..],
            [
                Command::Blank {
                    enable: true,
                    inline: false
                },
                Command::Flush
            ]
        );
    }

    #[test]
    fn test_consumer_failure_stops_producer() {
        let (_device, mut stream) = synced_device(MockOptions::default());
        let scan = ScanOptions {
            latency: 16,
            window: 2,
            ..ScanOptions::default()
        };
        let result = stream_points(
            &mut stream,
            std::iter::repeat(DwellTime(1)),
            &scan,
            &AbortHandle::new(),
            |_| Err(BeamError::ShapeMismatch("test".to_string())),
        );
        assert!(matches!(result, Err(BeamError::ShapeMismatch(_))));
    }

    #[test]
    fn test_short_reply_is_transport_error() {
        // one chunk of two samples, but the stream closes after one
        let mut stream = ScriptedStream::new(&encode_samples(&[7], OutputMode::SixteenBit), 1);
        let result = stream_points(
            &mut stream,
            dwells(&[1, 1]),
            &ScanOptions::default(),
            &AbortHandle::new(),
            |_| Ok(()),
        );
        assert!(matches!(
            result,
            Err(BeamError::IncompleteTransfer { .. })
        ));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut stream = ScriptedStream::new(&[], 1);
        let scan = ScanOptions {
            window: 0,
            ..ScanOptions::default()
        };
        assert!(matches!(
            stream_points(&mut stream, dwells(&[1]), &scan, &AbortHandle::new(), |_| Ok(())),
            Err(BeamError::InvalidParameter(_))
        ));
    }
}
