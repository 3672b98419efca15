use serde::{Deserialize, Serialize};

use crate::error::BeamError;

/// Highest code accepted by the 14-bit DACs.
pub const DAC_MAX_CODE: u16 = 0x3FFF;
/// Number of distinct DAC codes per axis.
pub const DAC_RESOLUTION: u32 = 16384;

/// How many bytes the device returns per output-enabled point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    SixteenBit = 0,
    EightBit = 1,
    NoOutput = 2,
}

impl OutputMode {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            OutputMode::SixteenBit => 2,
            OutputMode::EightBit => 1,
            OutputMode::NoOutput => 0,
        }
    }
}

impl From<OutputMode> for u16 {
    fn from(mode: OutputMode) -> Self {
        mode as u16
    }
}

impl TryFrom<u16> for OutputMode {
    type Error = BeamError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OutputMode::SixteenBit),
            1 => Ok(OutputMode::EightBit),
            2 => Ok(OutputMode::NoOutput),
            _ => Err(BeamError::Protocol(format!("Invalid output mode: {value}"))),
        }
    }
}

/// Per-point output flag. Zero on the wire means enabled, so array
/// elements (which carry no flags) always produce a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputEnable {
    #[default]
    Enabled = 0,
    Disabled = 1,
}

impl OutputEnable {
    pub fn is_enabled(self) -> bool {
        self == OutputEnable::Enabled
    }
}

impl From<OutputEnable> for u16 {
    fn from(enable: OutputEnable) -> Self {
        enable as u16
    }
}

impl From<u16> for OutputEnable {
    fn from(value: u16) -> Self {
        if value & 1 == 0 {
            OutputEnable::Enabled
        } else {
            OutputEnable::Disabled
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeamType {
    NoBeam = 0,
    Electron = 1,
    Ion = 2,
}

impl From<BeamType> for u16 {
    fn from(beam: BeamType) -> Self {
        beam as u16
    }
}

impl TryFrom<u16> for BeamType {
    type Error = BeamError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BeamType::NoBeam),
            1 => Ok(BeamType::Electron),
            2 => Ok(BeamType::Ion),
            _ => Err(BeamError::Protocol(format!("Invalid beam type: {value}"))),
        }
    }
}

/// Raster or vector addressing plus the sample width the device should
/// answer with. Requested by every `Synchronize` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMode {
    pub raster: bool,
    pub output: OutputMode,
}

impl SyncMode {
    pub fn raster(output: OutputMode) -> Self {
        Self {
            raster: true,
            output,
        }
    }

    pub fn vector(output: OutputMode) -> Self {
        Self {
            raster: false,
            output,
        }
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        Self::raster(OutputMode::SixteenBit)
    }
}

/// Dwell of one raster pixel, in hardware sample cycles minus one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DwellTime(pub u16);

impl DwellTime {
    pub fn get(&self) -> u16 {
        self.0
    }
}

impl From<u16> for DwellTime {
    fn from(dwell: u16) -> Self {
        DwellTime(dwell)
    }
}

impl From<DwellTime> for u16 {
    fn from(dwell: DwellTime) -> Self {
        dwell.0
    }
}

/// One explicitly addressed beam position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorPoint {
    pub x: u16,
    pub y: u16,
    pub dwell: u16,
}

impl VectorPoint {
    pub fn new(x: u16, y: u16, dwell: u16) -> Self {
        Self { x, y, dwell }
    }
}

/// A range of DAC codes along one axis of a rectangular scan.
///
/// `start` and `count` are plain 14-bit codes; `step` is an unsigned 8.8
/// fixed point increment applied once per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacCodeRange {
    pub start: u16,
    pub count: u16,
    pub step: u16,
}

impl DacCodeRange {
    /// Build a range, rejecting values that do not fit the hardware.
    ///
    /// `count` is the number of pixels (1..=16384); it is stored as given
    /// and written to the wire verbatim.
    pub fn new(start: u16, count: u32, step: u32) -> Result<Self, BeamError> {
        if start > DAC_MAX_CODE {
            return Err(BeamError::InvalidParameter(format!(
                "DAC start code {start} exceeds {DAC_MAX_CODE}"
            )));
        }
        if count == 0 || count > DAC_RESOLUTION {
            return Err(BeamError::InvalidParameter(format!(
                "DAC count {count} outside 1..={DAC_RESOLUTION}"
            )));
        }
        let step = u16::try_from(step).map_err(|_| {
            BeamError::InvalidParameter(format!("DAC step {step} does not fit 8.8 fixed point"))
        })?;
        Ok(Self {
            start,
            count: count as u16,
            step,
        })
    }

    /// Cover the whole DAC range with `resolution` pixels.
    pub fn from_resolution(resolution: u32) -> Result<Self, BeamError> {
        Self::new(0, resolution, Self::step_for(resolution)?)
    }

    /// A sub-range of a `resolution`-pixel axis starting at pixel `start`.
    pub fn from_roi(resolution: u32, start: u32, count: u32) -> Result<Self, BeamError> {
        if start.checked_add(count).is_none_or(|end| end > resolution) {
            return Err(BeamError::InvalidParameter(format!(
                "ROI {start}+{count} exceeds resolution {resolution}"
            )));
        }
        let step = Self::step_for(resolution)?;
        let start_code = (start as u64 * step as u64) >> 8;
        let start_code = u16::try_from(start_code)
            .ok()
            .filter(|code| *code <= DAC_MAX_CODE)
            .ok_or_else(|| {
                BeamError::InvalidParameter(format!("ROI start {start} maps outside DAC range"))
            })?;
        Self::new(start_code, count, step)
    }

    fn step_for(resolution: u32) -> Result<u32, BeamError> {
        if resolution == 0 || resolution > DAC_RESOLUTION {
            return Err(BeamError::InvalidParameter(format!(
                "Resolution {resolution} outside 1..={DAC_RESOLUTION}"
            )));
        }
        Ok((DAC_RESOLUTION * 256) / resolution)
    }

    /// Number of pixels along this axis
    pub fn pixels(&self) -> usize {
        self.count as usize
    }

    /// DAC code of the `index`-th pixel
    pub fn code_at(&self, index: u32) -> u16 {
        let code = self.start as u32 + ((index * self.step as u32) >> 8);
        code.min(DAC_MAX_CODE as u32) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_resolution_steps() {
        let range = DacCodeRange::from_resolution(1024).unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.count, 1024);
        assert_eq!(range.step, 16 * 256);
        assert_eq!(range.code_at(1), 16);
    }

    #[test]
    fn test_full_resolution_step_overflows_fixed_point() {
        // one pixel per code needs step 1.0 = 256, while one pixel total
        // would need 16384.0 which cannot be expressed in 8.8
        assert!(DacCodeRange::from_resolution(16384).is_ok());
        assert!(DacCodeRange::from_resolution(1).is_err());
    }

    #[test]
    fn test_roi_start_code() {
        let range = DacCodeRange::from_roi(512, 128, 64).unwrap();
        assert_eq!(range.start, 128 * 32);
        assert_eq!(range.count, 64);
        assert!(DacCodeRange::from_roi(512, 500, 64).is_err());
        assert!(matches!(
            DacCodeRange::from_roi(512, u32::MAX, 2),
            Err(BeamError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_range_validation() {
        assert!(DacCodeRange::new(16384, 1, 256).is_err());
        assert!(DacCodeRange::new(0, 0, 256).is_err());
        assert!(DacCodeRange::new(0, 16385, 256).is_err());
        assert!(DacCodeRange::new(0, 16, 70000).is_err());
    }

    #[test]
    fn test_output_mode_widths() {
        assert_eq!(OutputMode::SixteenBit.bytes_per_sample(), 2);
        assert_eq!(OutputMode::EightBit.bytes_per_sample(), 1);
        assert_eq!(OutputMode::NoOutput.bytes_per_sample(), 0);
        assert!(OutputMode::try_from(3).is_err());
    }
}
