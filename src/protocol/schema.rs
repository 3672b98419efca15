//! Declarative wire layout of every command.
//!
//! Each command is one header byte (`type << 4 | flags`) followed by
//! fixed-width big-endian payload fields. The table below is the single
//! source of truth for both the encoder and the reference decoder; its
//! invariants are checked at compile time.

use byteorder::{BigEndian, ByteOrder};

use crate::error::BeamError;

/// Bits available for flags in the low nibble of the header byte
pub const HEADER_FLAG_BITS: u8 = 4;
/// Largest number of flag fields any layout may declare
pub const MAX_FLAGS: usize = 4;
/// Largest number of payload fields any layout may declare
pub const MAX_FIELDS: usize = 6;

/// Four-bit command discriminant carried in the high nibble of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdType {
    Synchronize = 0x0,
    Abort = 0x1,
    Flush = 0x2,
    ExternalCtrl = 0x3,
    BeamSelect = 0x4,
    Blank = 0x5,
    Delay = 0x6,
    Array = 0x8,
    RasterPixelFill = 0x9,
    RasterRegion = 0xa,
    RasterPixel = 0xb,
    RasterPixelRun = 0xc,
    RasterPixelFreeRun = 0xd,
    VectorPixel = 0xe,
    VectorPixelMinDwell = 0xf,
}

impl CmdType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Wire layout for this command type.
    pub fn layout(self) -> &'static CommandLayout {
        // every variant has exactly one entry; enforced by test_schema_covers_all_types
        SCHEMA
            .iter()
            .find(|layout| layout.cmd_type == self)
            .unwrap_or(&SCHEMA[0])
    }
}

impl From<CmdType> for u16 {
    fn from(cmd: CmdType) -> Self {
        cmd as u16
    }
}

impl TryFrom<u8> for CmdType {
    type Error = BeamError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(CmdType::Synchronize),
            0x1 => Ok(CmdType::Abort),
            0x2 => Ok(CmdType::Flush),
            0x3 => Ok(CmdType::ExternalCtrl),
            0x4 => Ok(CmdType::BeamSelect),
            0x5 => Ok(CmdType::Blank),
            0x6 => Ok(CmdType::Delay),
            0x8 => Ok(CmdType::Array),
            0x9 => Ok(CmdType::RasterPixelFill),
            0xa => Ok(CmdType::RasterRegion),
            0xb => Ok(CmdType::RasterPixel),
            0xc => Ok(CmdType::RasterPixelRun),
            0xd => Ok(CmdType::RasterPixelFreeRun),
            0xe => Ok(CmdType::VectorPixel),
            0xf => Ok(CmdType::VectorPixelMinDwell),
            _ => Err(BeamError::Protocol(format!(
                "Unassigned command type {value:#x}"
            ))),
        }
    }
}

/// A flag packed into the header byte, `width` bits wide
#[derive(Debug, Clone, Copy)]
pub struct BitField {
    pub name: &'static str,
    pub width: u8,
}

/// A payload field following the header, `width` bytes wide
#[derive(Debug, Clone, Copy)]
pub struct ByteField {
    pub name: &'static str,
    pub width: u8,
}

const fn bits(name: &'static str, width: u8) -> BitField {
    BitField { name, width }
}

const fn bytes(name: &'static str, width: u8) -> ByteField {
    ByteField { name, width }
}

#[derive(Debug)]
pub struct CommandLayout {
    pub cmd_type: CmdType,
    pub flags: &'static [BitField],
    pub fields: &'static [ByteField],
}

impl CommandLayout {
    /// Total header bits used by flags
    pub const fn flag_width(&self) -> u8 {
        let mut total = 0;
        let mut i = 0;
        while i < self.flags.len() {
            total += self.flags[i].width;
            i += 1;
        }
        total
    }

    /// Bytes following the header byte
    pub const fn payload_len(&self) -> usize {
        let mut total = 0;
        let mut i = 0;
        while i < self.fields.len() {
            total += self.fields[i].width as usize;
            i += 1;
        }
        total
    }

    /// Header plus payload
    pub const fn encoded_len(&self) -> usize {
        1 + self.payload_len()
    }

    /// Runtime form of the compile-time schema check.
    pub fn validate(&self) -> Result<(), BeamError> {
        if self.flag_width() > HEADER_FLAG_BITS {
            return Err(BeamError::Schema(format!(
                "{:?}: {} flag bits can't fit in {} bits",
                self.cmd_type,
                self.flag_width(),
                HEADER_FLAG_BITS
            )));
        }
        if self.flags.len() > MAX_FLAGS || self.fields.len() > MAX_FIELDS {
            return Err(BeamError::Schema(format!(
                "{:?}: too many fields",
                self.cmd_type
            )));
        }
        if let Some(field) = self.fields.iter().find(|f| f.width != 1 && f.width != 2) {
            return Err(BeamError::Schema(format!(
                "{:?}.{}: unsupported width {}",
                self.cmd_type, field.name, field.width
            )));
        }
        Ok(())
    }

    /// Header byte for the given flag values. Values are masked to their
    /// declared widths, so reserved bits always stay zero.
    pub fn pack_header(&self, flags: &[u16]) -> u8 {
        let mut header = self.cmd_type.tag() << HEADER_FLAG_BITS;
        let mut offset = 0;
        for (field, value) in self.flags.iter().zip(flags) {
            let mask = (1u16 << field.width) - 1;
            header |= ((value & mask) << offset) as u8;
            offset += field.width;
        }
        header
    }

    /// Payload fields only, as they appear after a header (or inside an array).
    pub fn pack_body(&self, fields: &[u16], out: &mut Vec<u8>) {
        for (field, value) in self.fields.iter().zip(fields) {
            match field.width {
                1 => out.push(*value as u8),
                _ => {
                    let mut word = [0u8; 2];
                    BigEndian::write_u16(&mut word, *value);
                    out.extend_from_slice(&word);
                }
            }
        }
    }

    pub fn pack(&self, flags: &[u16], fields: &[u16], out: &mut Vec<u8>) {
        out.push(self.pack_header(flags));
        self.pack_body(fields, out);
    }

    /// Split a header byte back into flag values; fails if a reserved bit is set.
    pub fn unpack_header(&self, header: u8) -> Result<[u16; MAX_FLAGS], BeamError> {
        let used = self.flag_width();
        let reserved = (header & 0x0f) >> used;
        if reserved != 0 {
            return Err(BeamError::Protocol(format!(
                "{:?}: reserved header bits set in {header:#04x}",
                self.cmd_type
            )));
        }
        let mut values = [0u16; MAX_FLAGS];
        let mut offset = 0;
        for (slot, field) in values.iter_mut().zip(self.flags) {
            let mask = (1u16 << field.width) - 1;
            *slot = ((header as u16) >> offset) & mask;
            offset += field.width;
        }
        Ok(values)
    }

    /// Parse payload fields from exactly `payload_len()` bytes.
    pub fn unpack_body(&self, body: &[u8]) -> Result<[u16; MAX_FIELDS], BeamError> {
        if body.len() < self.payload_len() {
            return Err(BeamError::Protocol(format!(
                "{:?}: payload truncated ({} of {} bytes)",
                self.cmd_type,
                body.len(),
                self.payload_len()
            )));
        }
        let mut values = [0u16; MAX_FIELDS];
        let mut cursor = 0;
        for (slot, field) in values.iter_mut().zip(self.fields) {
            *slot = match field.width {
                1 => body[cursor] as u16,
                _ => BigEndian::read_u16(&body[cursor..cursor + 2]),
            };
            cursor += field.width as usize;
        }
        Ok(values)
    }
}

const LAYOUTS: [CommandLayout; 15] = [
    CommandLayout {
        cmd_type: CmdType::Synchronize,
        flags: &[bits("raster", 1), bits("output", 2)],
        fields: &[bytes("cookie", 2)],
    },
    CommandLayout {
        cmd_type: CmdType::Abort,
        flags: &[],
        fields: &[],
    },
    CommandLayout {
        cmd_type: CmdType::Flush,
        flags: &[],
        fields: &[],
    },
    CommandLayout {
        cmd_type: CmdType::ExternalCtrl,
        flags: &[bits("enable", 1)],
        fields: &[],
    },
    CommandLayout {
        cmd_type: CmdType::BeamSelect,
        flags: &[bits("beam_type", 2)],
        fields: &[],
    },
    CommandLayout {
        cmd_type: CmdType::Blank,
        flags: &[bits("enable", 1), bits("inline", 1)],
        fields: &[],
    },
    CommandLayout {
        cmd_type: CmdType::Delay,
        flags: &[],
        fields: &[bytes("delay", 2)],
    },
    CommandLayout {
        cmd_type: CmdType::Array,
        flags: &[bits("cmd_type", 4)],
        fields: &[bytes("array_length", 2)],
    },
    CommandLayout {
        cmd_type: CmdType::RasterPixelFill,
        flags: &[],
        fields: &[bytes("dwell_time", 2)],
    },
    CommandLayout {
        cmd_type: CmdType::RasterRegion,
        flags: &[],
        fields: &[
            bytes("x_start", 2),
            bytes("x_count", 2),
            bytes("x_step", 2),
            bytes("y_start", 2),
            bytes("y_count", 2),
            bytes("y_step", 2),
        ],
    },
    CommandLayout {
        cmd_type: CmdType::RasterPixel,
        flags: &[bits("output_en", 1)],
        fields: &[bytes("dwell_time", 2)],
    },
    CommandLayout {
        cmd_type: CmdType::RasterPixelRun,
        flags: &[bits("output_en", 1)],
        fields: &[bytes("length", 2), bytes("dwell_time", 2)],
    },
    CommandLayout {
        cmd_type: CmdType::RasterPixelFreeRun,
        flags: &[],
        fields: &[bytes("dwell_time", 2)],
    },
    CommandLayout {
        cmd_type: CmdType::VectorPixel,
        flags: &[bits("output_en", 1)],
        fields: &[bytes("x_coord", 2), bytes("y_coord", 2), bytes("dwell_time", 2)],
    },
    CommandLayout {
        cmd_type: CmdType::VectorPixelMinDwell,
        flags: &[bits("output_en", 1)],
        fields: &[bytes("x_coord", 2), bytes("y_coord", 2)],
    },
];

const fn check_schema(layouts: &[CommandLayout]) {
    let mut i = 0;
    while i < layouts.len() {
        let layout = &layouts[i];
        assert!(
            layout.flag_width() <= HEADER_FLAG_BITS,
            "command flags exceed the header nibble"
        );
        assert!(layout.flags.len() <= MAX_FLAGS, "too many flag fields");
        assert!(layout.fields.len() <= MAX_FIELDS, "too many payload fields");
        let mut j = 0;
        while j < layout.fields.len() {
            let width = layout.fields[j].width;
            assert!(width == 1 || width == 2, "payload fields are 1 or 2 bytes");
            j += 1;
        }
        i += 1;
    }
}

const _: () = check_schema(&LAYOUTS);

/// Layout of every assigned command type
pub static SCHEMA: [CommandLayout; 15] = LAYOUTS;
