use log::trace;

use super::schema::{CmdType, CommandLayout, MAX_FIELDS, MAX_FLAGS};
use crate::error::BeamError;
use crate::types::{BeamType, DacCodeRange, OutputEnable, OutputMode, VectorPoint};

/// Most elements a single array (or run) command can describe
pub const MAX_ARRAY_LEN: usize = 65536;

/// A command understood by the scan engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Drain the queue up to here and answer with `FFFF ++ cookie`
    Synchronize {
        cookie: u16,
        raster: bool,
        output: OutputMode,
    },
    /// End the current raster region or free run
    Abort,
    /// Push buffered samples to the host regardless of FIFO level
    Flush,
    ExternalCtrl {
        enable: bool,
    },
    BeamSelect {
        beam: BeamType,
    },
    /// `inline` blanks in sync with the next pixel instead of immediately
    Blank {
        enable: bool,
        inline: bool,
    },
    /// Pause execution for `delay` clock cycles
    Delay {
        delay: u16,
    },
    Array(ArrayItems),
    RasterPixelFill {
        dwell: u16,
    },
    RasterRegion {
        x: DacCodeRange,
        y: DacCodeRange,
    },
    RasterPixel {
        dwell: u16,
        output: OutputEnable,
    },
    /// `length` is the number of pixels minus one
    RasterPixelRun {
        length: u16,
        dwell: u16,
        output: OutputEnable,
    },
    RasterPixelFreeRun {
        dwell: u16,
    },
    /// Dwells of 0 or 1 go out in the shorter minimum-dwell form
    VectorPixel {
        x: u16,
        y: u16,
        dwell: u16,
        output: OutputEnable,
    },
}

/// Header-less bodies repeated under one `Array` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayItems {
    RasterPixel(Vec<u16>),
    RasterPixelFill(Vec<u16>),
    VectorPixel(Vec<VectorPoint>),
}

impl ArrayItems {
    pub fn wrapped_type(&self) -> CmdType {
        match self {
            ArrayItems::RasterPixel(_) => CmdType::RasterPixel,
            ArrayItems::RasterPixelFill(_) => CmdType::RasterPixelFill,
            ArrayItems::VectorPixel(_) => CmdType::VectorPixel,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayItems::RasterPixel(dwells) | ArrayItems::RasterPixelFill(dwells) => dwells.len(),
            ArrayItems::VectorPixel(points) => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn encode_bodies(&self, out: &mut Vec<u8>) {
        let layout = self.wrapped_type().layout();
        match self {
            ArrayItems::RasterPixel(dwells) | ArrayItems::RasterPixelFill(dwells) => {
                for dwell in dwells {
                    layout.pack_body(&[*dwell], out);
                }
            }
            ArrayItems::VectorPixel(points) => {
                for point in points {
                    layout.pack_body(&[point.x, point.y, point.dwell], out);
                }
            }
        }
    }

    fn decode_bodies(wrapped: CmdType, count: usize, body: &[u8]) -> Result<Self, BeamError> {
        let layout = wrapped.layout();
        let bodies = body.chunks_exact(layout.payload_len()).take(count);
        match wrapped {
            CmdType::RasterPixel | CmdType::RasterPixelFill => {
                let dwells = bodies
                    .map(|chunk| layout.unpack_body(chunk).map(|fields| fields[0]))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if wrapped == CmdType::RasterPixel {
                    ArrayItems::RasterPixel(dwells)
                } else {
                    ArrayItems::RasterPixelFill(dwells)
                })
            }
            CmdType::VectorPixel => {
                let points = bodies
                    .map(|chunk| {
                        layout
                            .unpack_body(chunk)
                            .map(|f| VectorPoint::new(f[0], f[1], f[2]))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ArrayItems::VectorPixel(points))
            }
            other => Err(BeamError::Protocol(format!(
                "{other:?} cannot be repeated in an array"
            ))),
        }
    }
}

type WireValues = (CmdType, [u16; MAX_FLAGS], [u16; MAX_FIELDS]);

fn wire(cmd_type: CmdType, flags: &[u16], fields: &[u16]) -> WireValues {
    let mut flag_values = [0u16; MAX_FLAGS];
    let mut field_values = [0u16; MAX_FIELDS];
    flag_values[..flags.len()].copy_from_slice(flags);
    field_values[..fields.len()].copy_from_slice(fields);
    (cmd_type, flag_values, field_values)
}

impl Command {
    /// Header and payload values as they go on the wire.
    ///
    /// This is the only place that knows which variant maps to which layout;
    /// the packing itself is generic over the schema table.
    fn wire_values(&self) -> Result<WireValues, BeamError> {
        Ok(match self {
            Command::Synchronize {
                cookie,
                raster,
                output,
            } => wire(
                CmdType::Synchronize,
                &[*raster as u16, u16::from(*output)],
                &[*cookie],
            ),
            Command::Abort => wire(CmdType::Abort, &[], &[]),
            Command::Flush => wire(CmdType::Flush, &[], &[]),
            Command::ExternalCtrl { enable } => wire(CmdType::ExternalCtrl, &[*enable as u16], &[]),
            Command::BeamSelect { beam } => wire(CmdType::BeamSelect, &[u16::from(*beam)], &[]),
            Command::Blank { enable, inline } => {
                wire(CmdType::Blank, &[*enable as u16, *inline as u16], &[])
            }
            Command::Delay { delay } => wire(CmdType::Delay, &[], &[*delay]),
            Command::Array(items) => {
                if items.is_empty() || items.len() > MAX_ARRAY_LEN {
                    return Err(BeamError::Schema(format!(
                        "array of {} elements outside 1..={MAX_ARRAY_LEN}",
                        items.len()
                    )));
                }
                wire(
                    CmdType::Array,
                    &[u16::from(items.wrapped_type())],
                    &[(items.len() - 1) as u16],
                )
            }
            Command::RasterPixelFill { dwell } => wire(CmdType::RasterPixelFill, &[], &[*dwell]),
            Command::RasterRegion { x, y } => wire(
                CmdType::RasterRegion,
                &[],
                &[x.start, x.count, x.step, y.start, y.count, y.step],
            ),
            Command::RasterPixel { dwell, output } => {
                wire(CmdType::RasterPixel, &[u16::from(*output)], &[*dwell])
            }
            Command::RasterPixelRun {
                length,
                dwell,
                output,
            } => wire(
                CmdType::RasterPixelRun,
                &[u16::from(*output)],
                &[*length, *dwell],
            ),
            Command::RasterPixelFreeRun { dwell } => {
                wire(CmdType::RasterPixelFreeRun, &[], &[*dwell])
            }
            Command::VectorPixel {
                x,
                y,
                dwell,
                output,
            } => {
                if *dwell <= 1 {
                    wire(CmdType::VectorPixelMinDwell, &[u16::from(*output)], &[*x, *y])
                } else {
                    wire(CmdType::VectorPixel, &[u16::from(*output)], &[*x, *y, *dwell])
                }
            }
        })
    }

    /// The layout this command is written with (after the minimum-dwell rule).
    pub fn wire_type(&self) -> Result<CmdType, BeamError> {
        self.wire_values().map(|(cmd_type, _, _)| cmd_type)
    }

    /// Append the wire form of this command to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), BeamError> {
        let (cmd_type, flags, fields) = self.wire_values()?;
        let layout = cmd_type.layout();
        layout.pack(&flags, &fields, out);
        if let Command::Array(items) = self {
            items.encode_bodies(out);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, BeamError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Length of the wire form, without encoding.
    pub fn encoded_len(&self) -> usize {
        let cmd_type = match self {
            Command::VectorPixel { dwell, .. } if *dwell <= 1 => CmdType::VectorPixelMinDwell,
            Command::VectorPixel { .. } => CmdType::VectorPixel,
            other => other.cmd_type(),
        };
        let mut len = cmd_type.layout().encoded_len();
        if let Command::Array(items) = self {
            len += items.len() * items.wrapped_type().layout().payload_len();
        }
        len
    }

    /// Logical command type, before the minimum-dwell rule is applied
    pub fn cmd_type(&self) -> CmdType {
        match self {
            Command::Synchronize { .. } => CmdType::Synchronize,
            Command::Abort => CmdType::Abort,
            Command::Flush => CmdType::Flush,
            Command::ExternalCtrl { .. } => CmdType::ExternalCtrl,
            Command::BeamSelect { .. } => CmdType::BeamSelect,
            Command::Blank { .. } => CmdType::Blank,
            Command::Delay { .. } => CmdType::Delay,
            Command::Array(_) => CmdType::Array,
            Command::RasterPixelFill { .. } => CmdType::RasterPixelFill,
            Command::RasterRegion { .. } => CmdType::RasterRegion,
            Command::RasterPixel { .. } => CmdType::RasterPixel,
            Command::RasterPixelRun { .. } => CmdType::RasterPixelRun,
            Command::RasterPixelFreeRun { .. } => CmdType::RasterPixelFreeRun,
            Command::VectorPixel { .. } => CmdType::VectorPixel,
        }
    }

    /// Samples the device returns for this command when output is on.
    ///
    /// Fills and free runs depend on the device's raster position and
    /// report zero here.
    pub fn output_points(&self) -> usize {
        match self {
            Command::RasterPixel { output, .. } | Command::VectorPixel { output, .. } => {
                output.is_enabled() as usize
            }
            Command::RasterPixelRun { length, output, .. } => {
                if output.is_enabled() {
                    *length as usize + 1
                } else {
                    0
                }
            }
            Command::Array(ArrayItems::RasterPixelFill(_)) => 0,
            Command::Array(items) => items.len(),
            _ => 0,
        }
    }

    fn from_wire(
        cmd_type: CmdType,
        flags: [u16; MAX_FLAGS],
        fields: [u16; MAX_FIELDS],
    ) -> Result<Self, BeamError> {
        Ok(match cmd_type {
            CmdType::Synchronize => Command::Synchronize {
                cookie: fields[0],
                raster: flags[0] != 0,
                output: OutputMode::try_from(flags[1])?,
            },
            CmdType::Abort => Command::Abort,
            CmdType::Flush => Command::Flush,
            CmdType::ExternalCtrl => Command::ExternalCtrl {
                enable: flags[0] != 0,
            },
            CmdType::BeamSelect => Command::BeamSelect {
                beam: BeamType::try_from(flags[0])?,
            },
            CmdType::Blank => Command::Blank {
                enable: flags[0] != 0,
                inline: flags[1] != 0,
            },
            CmdType::Delay => Command::Delay { delay: fields[0] },
            CmdType::RasterPixelFill => Command::RasterPixelFill { dwell: fields[0] },
            CmdType::RasterRegion => Command::RasterRegion {
                x: DacCodeRange {
                    start: fields[0],
                    count: fields[1],
                    step: fields[2],
                },
                y: DacCodeRange {
                    start: fields[3],
                    count: fields[4],
                    step: fields[5],
                },
            },
            CmdType::RasterPixel => Command::RasterPixel {
                dwell: fields[0],
                output: OutputEnable::from(flags[0]),
            },
            CmdType::RasterPixelRun => Command::RasterPixelRun {
                length: fields[0],
                dwell: fields[1],
                output: OutputEnable::from(flags[0]),
            },
            CmdType::RasterPixelFreeRun => Command::RasterPixelFreeRun { dwell: fields[0] },
            CmdType::VectorPixel => Command::VectorPixel {
                x: fields[0],
                y: fields[1],
                dwell: fields[2],
                output: OutputEnable::from(flags[0]),
            },
            CmdType::VectorPixelMinDwell => Command::VectorPixel {
                x: fields[0],
                y: fields[1],
                dwell: 1,
                output: OutputEnable::from(flags[0]),
            },
            CmdType::Array => {
                return Err(BeamError::Protocol(
                    "array header decoded without its bodies".to_string(),
                ));
            }
        })
    }
}

/// Decode the first command in `bytes`.
///
/// Returns `Ok(None)` while the buffer does not yet hold a complete command,
/// otherwise the command and the number of bytes it occupied.
pub fn decode_one(bytes: &[u8]) -> Result<Option<(Command, usize)>, BeamError> {
    let Some(&header) = bytes.first() else {
        return Ok(None);
    };
    let cmd_type = CmdType::try_from(header >> 4)?;
    let layout: &CommandLayout = cmd_type.layout();
    let head_len = layout.encoded_len();
    if bytes.len() < head_len {
        return Ok(None);
    }
    let flags = layout.unpack_header(header)?;
    let fields = layout.unpack_body(&bytes[1..head_len])?;

    if cmd_type != CmdType::Array {
        return Ok(Some((Command::from_wire(cmd_type, flags, fields)?, head_len)));
    }

    let wrapped = CmdType::try_from(flags[0] as u8)?;
    if !matches!(
        wrapped,
        CmdType::RasterPixel | CmdType::RasterPixelFill | CmdType::VectorPixel
    ) {
        return Err(BeamError::Protocol(format!(
            "{wrapped:?} cannot be repeated in an array"
        )));
    }
    let count = fields[0] as usize + 1;
    let total = head_len + count * wrapped.layout().payload_len();
    if bytes.len() < total {
        return Ok(None);
    }
    let items = ArrayItems::decode_bodies(wrapped, count, &bytes[head_len..total])?;
    trace!("decoded array of {count} {wrapped:?}");
    Ok(Some((Command::Array(items), total)))
}

/// Decode a complete command sequence; trailing partial commands are an error.
pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<Command>, BeamError> {
    let mut commands = Vec::new();
    while !bytes.is_empty() {
        match decode_one(bytes)? {
            Some((command, used)) => {
                commands.push(command);
                bytes = &bytes[used..];
            }
            None => {
                return Err(BeamError::Protocol(format!(
                    "{} trailing bytes do not form a command",
                    bytes.len()
                )));
            }
        }
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_variant() -> Vec<Command> {
        let x = DacCodeRange::from_resolution(512).unwrap();
        let y = DacCodeRange::from_roi(1024, 100, 200).unwrap();
        vec![
            Command::Synchronize {
                cookie: 0x1234,
                raster: false,
                output: OutputMode::NoOutput,
            },
            Command::Abort,
            Command::Flush,
            Command::ExternalCtrl { enable: true },
            Command::BeamSelect {
                beam: BeamType::Ion,
            },
            Command::Blank {
                enable: true,
                inline: true,
            },
            Command::Delay { delay: 480 },
            Command::Array(ArrayItems::RasterPixel(vec![1, 2, 3])),
            Command::Array(ArrayItems::RasterPixelFill(vec![9])),
            Command::Array(ArrayItems::VectorPixel(vec![
                VectorPoint::new(1, 2, 0),
                VectorPoint::new(0x3fff, 0, 700),
            ])),
            Command::RasterPixelFill { dwell: 5 },
            Command::RasterRegion { x, y },
            Command::RasterPixel {
                dwell: 7,
                output: OutputEnable::Disabled,
            },
            Command::RasterPixelRun {
                length: 65535,
                dwell: 2,
                output: OutputEnable::Enabled,
            },
            Command::RasterPixelFreeRun { dwell: 3 },
            Command::VectorPixel {
                x: 10,
                y: 20,
                dwell: 30,
                output: OutputEnable::Enabled,
            },
            Command::VectorPixel {
                x: 10,
                y: 20,
                dwell: 1,
                output: OutputEnable::Disabled,
            },
        ]
    }

    #[test]
    fn test_round_trip_every_variant() {
        for command in every_variant() {
            let bytes = command.encode().unwrap();
            assert_eq!(bytes.len(), command.encoded_len(), "{command:?}");
            let (decoded, used) = decode_one(&bytes).unwrap().unwrap();
            assert_eq!(used, bytes.len());
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn test_sequence_round_trip() {
        let commands = every_variant();
        let mut bytes = Vec::new();
        for command in &commands {
            command.encode_into(&mut bytes).unwrap();
        }
        assert_eq!(decode_all(&bytes).unwrap(), commands);
    }

    #[test]
    fn test_synchronize_wire_form() {
        let command = Command::Synchronize {
            cookie: 0x1f2a,
            raster: true,
            output: OutputMode::SixteenBit,
        };
        assert_eq!(command.encode().unwrap(), vec![0x01, 0x1f, 0x2a]);

        let command = Command::Synchronize {
            cookie: 0x0002,
            raster: false,
            output: OutputMode::EightBit,
        };
        assert_eq!(command.encode().unwrap(), vec![0x02, 0x00, 0x02]);
    }

    #[test]
    fn test_header_type_nibble() {
        for command in every_variant() {
            let bytes = command.encode().unwrap();
            let wire_type = command.wire_type().unwrap();
            assert_eq!(bytes[0] >> 4, wire_type.tag());
            let used = wire_type.layout().flag_width();
            assert_eq!((bytes[0] & 0x0f) >> used, 0, "reserved bits set: {command:?}");
        }
    }

    #[test]
    fn test_vector_pixel_min_dwell() {
        let short = Command::VectorPixel {
            x: 100,
            y: 200,
            dwell: 1,
            output: OutputEnable::Enabled,
        }
        .encode()
        .unwrap();
        let long = Command::VectorPixel {
            x: 100,
            y: 200,
            dwell: 2,
            output: OutputEnable::Enabled,
        }
        .encode()
        .unwrap();
        assert_eq!(short[0] >> 4, CmdType::VectorPixelMinDwell.tag());
        assert_eq!(long[0] >> 4, CmdType::VectorPixel.tag());
        assert_eq!(short.len() + 2, long.len());
        assert_eq!(short, vec![0xf0, 0x00, 0x64, 0x00, 0xc8]);
    }

    #[test]
    fn test_array_layout() {
        let command = Command::Array(ArrayItems::VectorPixel(vec![
            VectorPoint::new(1, 2, 3),
            VectorPoint::new(4, 5, 6),
        ]));
        assert_eq!(
            command.encode().unwrap(),
            vec![
                0x8e, 0x00, 0x01, // header, count - 1
                0x00, 0x01, 0x00, 0x02, 0x00, 0x03, //
                0x00, 0x04, 0x00, 0x05, 0x00, 0x06,
            ]
        );
    }

    #[test]
    fn test_array_limits() {
        assert!(matches!(
            Command::Array(ArrayItems::RasterPixel(vec![])).encode(),
            Err(BeamError::Schema(_))
        ));
        let full = Command::Array(ArrayItems::RasterPixel(vec![0; MAX_ARRAY_LEN]));
        let bytes = full.encode().unwrap();
        assert_eq!(&bytes[..3], &[0x8b, 0xff, 0xff]);
        let over = Command::Array(ArrayItems::RasterPixel(vec![0; MAX_ARRAY_LEN + 1]));
        assert!(matches!(over.encode(), Err(BeamError::Schema(_))));
    }

    #[test]
    fn test_decode_incomplete() {
        let bytes = Command::RasterPixelRun {
            length: 3,
            dwell: 4,
            output: OutputEnable::Enabled,
        }
        .encode()
        .unwrap();
        for end in 0..bytes.len() {
            assert!(decode_one(&bytes[..end]).unwrap().is_none());
        }
        assert!(decode_all(&bytes[..3]).is_err());
    }

    #[test]
    fn test_decode_rejects_unassigned_type() {
        assert!(decode_one(&[0x70]).is_err());
    }

    #[test]
    fn test_decode_rejects_arrays_of_bodyless_commands() {
        // Abort, Flush and Blank have no payload to repeat
        for wrapped in [0x81u8, 0x82, 0x85] {
            assert!(matches!(
                decode_one(&[wrapped, 0x00, 0x00]),
                Err(BeamError::Protocol(_))
            ));
        }
        // a wrapped Synchronize has a body but is not repeatable either
        assert!(matches!(
            decode_one(&[0x80, 0x00, 0x00, 0x00, 0x02]),
            Err(BeamError::Protocol(_))
        ));
    }

    #[test]
    fn test_output_points() {
        let run = Command::RasterPixelRun {
            length: 99,
            dwell: 1,
            output: OutputEnable::Enabled,
        };
        assert_eq!(run.output_points(), 100);
        assert_eq!(Command::Flush.output_points(), 0);
    }
}
