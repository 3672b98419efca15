//! Byte-stream abstraction between the host and the scan engine.
//!
//! A [`Stream`] splits into a [`ByteSink`] and a [`ByteSource`] so the
//! streaming engine can write commands on one thread while reading samples
//! on another.

use std::io::{self, Read, Write};

use log::{trace, warn};

use crate::error::BeamError;
use crate::logging::dump_hex;

pub mod mock;
pub mod tcp;

pub use mock::{
    DeviceLog, MockConnector, MockDevice, MockOptions, MockStream, SamplePattern, ScriptedStream,
};
pub use tcp::{ConnectionConfig, TcpConnector, TcpConnectorBuilder};

/// Default bound on bytes held while searching for a pattern
pub const DEFAULT_READ_BUFFER: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Write half of a stream
pub trait ByteSink: Send {
    /// Queue bytes for sending. They may sit in a buffer until [`flush`](Self::flush).
    fn write(&mut self, data: &[u8]) -> Result<(), BeamError>;

    /// Push everything written so far to the device.
    fn flush(&mut self) -> Result<(), BeamError>;
}

/// Read half of a stream
pub trait ByteSource: Send {
    /// Read exactly `len` bytes, failing with `IncompleteTransfer` if the
    /// stream closes first.
    fn read(&mut self, len: usize) -> Result<Vec<u8>, BeamError>;

    /// Read up to and including the first occurrence of `pattern`.
    fn read_until(&mut self, pattern: &[u8]) -> Result<Vec<u8>, BeamError>;
}

/// A bidirectional byte stream to the device
pub trait Stream: Send {
    /// Borrow both halves at once.
    fn split(&mut self) -> (&mut dyn ByteSink, &mut dyn ByteSource);

    fn write(&mut self, data: &[u8]) -> Result<(), BeamError> {
        self.split().0.write(data)
    }

    fn flush(&mut self) -> Result<(), BeamError> {
        self.split().0.flush()
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, BeamError> {
        self.split().1.read(len)
    }

    fn read_until(&mut self, pattern: &[u8]) -> Result<Vec<u8>, BeamError> {
        self.split().1.read_until(pattern)
    }
}

/// Opens streams; held by a `Connection` so it can reconnect.
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Box<dyn Stream>, BeamError>;

    /// Human readable peer description for logs
    fn describe(&self) -> String;
}

/// [`ByteSink`] over any writer.
pub struct WriterSink<W> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}

impl<W: Write + Send> ByteSink for WriterSink<W> {
    fn write(&mut self, data: &[u8]) -> Result<(), BeamError> {
        trace!("tx {} bytes: {}", data.len(), dump_hex(data, 32));
        self.writer
            .write_all(data)
            .map_err(|e| BeamError::io(e, "writing to device"))
    }

    fn flush(&mut self) -> Result<(), BeamError> {
        self.writer
            .flush()
            .map_err(|e| BeamError::io(e, "flushing to device"))
    }
}

/// [`ByteSource`] over any reader, with a bounded search buffer.
///
/// `read` may grow the buffer as far as the request needs. `read_until`
/// holds at most `capacity` bytes; on overrun it drops everything except
/// the last `pattern.len() - 1` bytes, which could still begin a match.
pub struct BufferedSource<R> {
    reader: R,
    buffer: Vec<u8>,
    capacity: usize,
}

impl<R: Read + Send> BufferedSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_capacity(reader, DEFAULT_READ_BUFFER)
    }

    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(capacity.min(DEFAULT_READ_BUFFER)),
            capacity,
        }
    }

    /// Bytes received but not yet returned to a caller
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Pull one chunk from the reader. Returns the number of bytes added,
    /// zero at end of stream.
    fn fill(&mut self) -> Result<usize, BeamError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(BeamError::io(e, "reading from device")),
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl<R: Read + Send> ByteSource for BufferedSource<R> {
    fn read(&mut self, len: usize) -> Result<Vec<u8>, BeamError> {
        while self.buffer.len() < len {
            if self.fill()? == 0 {
                return Err(BeamError::IncompleteTransfer {
                    expected: len,
                    received: self.buffer.len(),
                });
            }
        }
        let rest = self.buffer.split_off(len);
        Ok(std::mem::replace(&mut self.buffer, rest))
    }

    fn read_until(&mut self, pattern: &[u8]) -> Result<Vec<u8>, BeamError> {
        if pattern.is_empty() {
            return Err(BeamError::InvalidParameter(
                "read_until needs a non-empty pattern".to_string(),
            ));
        }
        if self.capacity < pattern.len() {
            return Err(BeamError::InvalidParameter(format!(
                "pattern of {} bytes exceeds read buffer of {}",
                pattern.len(),
                self.capacity
            )));
        }
        let keep = pattern.len() - 1;
        // match starts before `searched` are already ruled out
        let mut searched = 0;
        let mut received = 0;
        loop {
            if let Some(pos) = find(&self.buffer[searched..], pattern) {
                let end = searched + pos + pattern.len();
                let rest = self.buffer.split_off(end);
                return Ok(std::mem::replace(&mut self.buffer, rest));
            }
            searched = self.buffer.len().saturating_sub(keep);

            if self.buffer.len() >= self.capacity {
                let dropped = self.buffer.len() - keep;
                warn!(
                    "Read buffer overrun while searching for {}; discarding {dropped} bytes",
                    dump_hex(pattern, pattern.len())
                );
                self.buffer.drain(..dropped);
                searched = 0;
            }

            let n = self.fill()?;
            if n == 0 {
                return Err(BeamError::IncompleteTransfer {
                    expected: received + pattern.len(),
                    received,
                });
            }
            received += n;
        }
    }
}

/// A [`Stream`] made of any writer and reader pair.
pub struct IoStream<W, R> {
    sink: WriterSink<W>,
    source: BufferedSource<R>,
}

impl<W: Write + Send, R: Read + Send> IoStream<W, R> {
    pub fn new(writer: W, reader: R, read_buffer: usize) -> Self {
        Self {
            sink: WriterSink::new(writer),
            source: BufferedSource::with_capacity(reader, read_buffer),
        }
    }
}

impl<W: Write + Send, R: Read + Send> Stream for IoStream<W, R> {
    fn split(&mut self) -> (&mut dyn ByteSink, &mut dyn ByteSource) {
        (&mut self.sink, &mut self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out its data a few bytes at a time
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Trickle {
        fn new(data: &[u8], step: usize) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
                step,
            }
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_exact_across_chunks() {
        let mut source = BufferedSource::new(Trickle::new(&[1, 2, 3, 4, 5, 6, 7], 3));
        assert_eq!(source.read(5).unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(source.read(2).unwrap(), vec![6, 7]);
    }

    #[test]
    fn test_read_reports_incomplete_transfer() {
        let mut source = BufferedSource::new(Trickle::new(&[1, 2, 3], 2));
        match source.read(5) {
            Err(BeamError::IncompleteTransfer { expected, received }) => {
                assert_eq!(expected, 5);
                assert_eq!(received, 3);
            }
            other => panic!("expected IncompleteTransfer, got {other:?}"),
        }
    }

    #[test]
    fn test_read_until_match_straddles_reads() {
        let data = [9, 9, 9, 0xff, 0xff, 0x12, 0x34, 7, 8];
        // every split point of the pattern across two reads
        for step in 1..=4 {
            let mut source = BufferedSource::new(Trickle::new(&data, step));
            let prefix = source.read_until(&[0xff, 0xff, 0x12, 0x34]).unwrap();
            assert_eq!(prefix, data[..7].to_vec(), "step {step}");
            assert_eq!(source.read(2).unwrap(), vec![7, 8]);
        }
    }

    #[test]
    fn test_read_until_overrun_keeps_partial_match() {
        let mut data = vec![0u8; 30];
        data.extend_from_slice(&[0xff, 0xff, 0x00, 0x02, 5]);
        let mut source = BufferedSource::with_capacity(Trickle::new(&data, 3), 8);
        let prefix = source.read_until(&[0xff, 0xff, 0x00, 0x02]).unwrap();
        assert!(prefix.ends_with(&[0xff, 0xff, 0x00, 0x02]));
        assert!(prefix.len() <= 8 + 3);
        assert_eq!(source.read(1).unwrap(), vec![5]);
    }

    #[test]
    fn test_read_until_eof() {
        let mut source = BufferedSource::new(Trickle::new(&[1, 2, 3], 2));
        assert!(matches!(
            source.read_until(&[0xff, 0xff]),
            Err(BeamError::IncompleteTransfer { .. })
        ));
        assert!(source.read_until(&[]).is_err());
    }

    #[test]
    fn test_writer_sink_collects_bytes() {
        let mut stream = IoStream::new(Vec::new(), Trickle::new(&[], 1), 16);
        stream.write(&[1, 2]).unwrap();
        stream.write(&[3]).unwrap();
        stream.flush().unwrap();
        assert_eq!(stream.sink.get_ref(), &vec![1, 2, 3]);
    }
}
