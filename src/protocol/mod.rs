//! Command encoding and the device's reply format.

pub mod command;
pub mod schema;

pub use command::{ArrayItems, Command, MAX_ARRAY_LEN, decode_all, decode_one};
pub use schema::{CmdType, CommandLayout, SCHEMA};

use byteorder::{BigEndian, ByteOrder};

use crate::error::BeamError;
use crate::types::OutputMode;

/// Marker preceding the cookie in a synchronization reply
pub const SENTINEL_MARKER: u16 = 0xFFFF;

/// The four bytes the device answers a `Synchronize` with.
pub fn sync_sentinel(cookie: u16) -> [u8; 4] {
    let mut bytes = [0u8; 4];
    BigEndian::write_u16(&mut bytes[..2], SENTINEL_MARKER);
    BigEndian::write_u16(&mut bytes[2..], cookie);
    bytes
}

/// Convert raw reply bytes into samples.
///
/// Sixteen-bit samples are big-endian; eight-bit samples widen to `u16`.
pub fn decode_samples(bytes: &[u8], mode: OutputMode) -> Result<Vec<u16>, BeamError> {
    match mode {
        OutputMode::SixteenBit => {
            if bytes.len() % 2 != 0 {
                return Err(BeamError::Protocol(format!(
                    "odd byte count {} for 16-bit samples",
                    bytes.len()
                )));
            }
            let mut samples = vec![0u16; bytes.len() / 2];
            BigEndian::read_u16_into(bytes, &mut samples);
            Ok(samples)
        }
        OutputMode::EightBit => Ok(bytes.iter().map(|b| *b as u16).collect()),
        OutputMode::NoOutput => {
            if bytes.is_empty() {
                Ok(Vec::new())
            } else {
                Err(BeamError::Protocol(format!(
                    "{} unexpected bytes with output disabled",
                    bytes.len()
                )))
            }
        }
    }
}

/// Inverse of [`decode_samples`], used by device emulation.
/// Eight-bit mode keeps the low byte of each sample.
pub fn encode_samples(samples: &[u16], mode: OutputMode) -> Vec<u8> {
    match mode {
        OutputMode::SixteenBit => {
            let mut bytes = vec![0u8; samples.len() * 2];
            BigEndian::write_u16_into(samples, &mut bytes);
            bytes
        }
        OutputMode::EightBit => samples.iter().map(|s| *s as u8).collect(),
        OutputMode::NoOutput => Vec::new(),
    }
}
