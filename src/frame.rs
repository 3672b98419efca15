//! Two-dimensional image assembly from a flat sample stream.

use log::{debug, trace};
use ndarray::{Array2, ArrayView1, ArrayView2, s};

use crate::error::BeamError;

/// An image canvas filled row by row from raster samples.
///
/// The fill pointer names the next row to write. It may rest at `y_count`
/// after a fill that exactly reaches the bottom; the next row written then
/// wraps to the top.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    canvas: Array2<u16>,
    y_ptr: usize,
}

impl Frame {
    pub fn new(x_count: usize, y_count: usize) -> Result<Self, BeamError> {
        if x_count == 0 || y_count == 0 {
            return Err(BeamError::InvalidParameter(format!(
                "frame {x_count}x{y_count} has no pixels"
            )));
        }
        Ok(Self {
            canvas: Array2::zeros((y_count, x_count)),
            y_ptr: 0,
        })
    }

    pub fn x_count(&self) -> usize {
        self.canvas.ncols()
    }

    pub fn y_count(&self) -> usize {
        self.canvas.nrows()
    }

    pub fn pixels(&self) -> usize {
        self.canvas.len()
    }

    pub fn y_ptr(&self) -> usize {
        self.y_ptr
    }

    /// Move the fill pointer back to the top row.
    pub fn rewind(&mut self) {
        self.y_ptr = 0;
    }

    /// Raw samples, indexed `[y, x]`
    pub fn canvas(&self) -> &Array2<u16> {
        &self.canvas
    }

    pub fn canvas_mut(&mut self) -> &mut Array2<u16> {
        &mut self.canvas
    }

    /// Replace the whole canvas. Needs exactly `x * y` samples.
    pub fn fill(&mut self, samples: &[u16]) -> Result<(), BeamError> {
        let shape = (self.y_count(), self.x_count());
        let mismatch = || {
            BeamError::ShapeMismatch(format!(
                "{} samples for a {}x{} frame",
                samples.len(),
                shape.1,
                shape.0
            ))
        };
        if samples.len() != self.pixels() {
            return Err(mismatch());
        }
        let view = ArrayView2::from_shape(shape, samples).map_err(|_| mismatch())?;
        self.canvas.assign(&view);
        self.y_ptr = self.y_count();
        Ok(())
    }

    /// Write whole rows starting at the fill pointer, wrapping to the top
    /// when the bottom is passed. The sample count must be a multiple of
    /// the row width; nothing is written otherwise.
    pub fn fill_lines(&mut self, samples: &[u16]) -> Result<(), BeamError> {
        let x_count = self.x_count();
        if samples.len() % x_count != 0 {
            return Err(BeamError::ShapeMismatch(format!(
                "{} samples is not a whole number of {x_count}-pixel rows",
                samples.len()
            )));
        }
        let start = self.y_ptr;
        for row in samples.chunks_exact(x_count) {
            if self.y_ptr == self.y_count() {
                trace!("fill_lines: roll over to top of frame");
                self.y_ptr = 0;
            }
            self.canvas
                .row_mut(self.y_ptr)
                .assign(&ArrayView1::from(row));
            self.y_ptr += 1;
        }
        trace!(
            "fill_lines: {} rows from y={start}, now at y={}",
            samples.len() / x_count,
            self.y_ptr
        );
        Ok(())
    }

    /// Samples widened to the full 16-bit range.
    pub fn as_u16(&self) -> Array2<u16> {
        self.canvas.mapv(|v| v << 2)
    }

    /// Samples narrowed to 8 bits, saturating.
    pub fn as_u8(&self) -> Array2<u8> {
        self.canvas.mapv(|v| (v >> 6).min(u8::MAX as u16) as u8)
    }
}

/// Pixels to accumulate between display updates so that repaints happen at
/// roughly `fps` for a scan with `dwell_ns` per pixel. Always whole rows,
/// at least one, at most the whole frame.
pub fn display_chunk_pixels(x_count: usize, y_count: usize, fps: f64, dwell_ns: f64) -> usize {
    let frame_pixels = x_count * y_count;
    if fps <= 0.0 || dwell_ns <= 0.0 {
        return frame_pixels;
    }
    let dwells_per_update = 1e9 / (fps * dwell_ns);
    if dwells_per_update >= frame_pixels as f64 {
        return frame_pixels;
    }
    let lines = ((dwells_per_update as usize) / x_count).max(1);
    x_count * lines
}

/// Turns arbitrarily sized sample batches into whole-row frame updates.
#[derive(Debug, Clone)]
pub struct LineAssembler {
    pending: Vec<u16>,
    update_pixels: usize,
}

impl LineAssembler {
    /// `update_pixels` is the least number of buffered samples that triggers
    /// a write into the frame.
    pub fn new(update_pixels: usize) -> Self {
        Self {
            pending: Vec::new(),
            update_pixels: update_pixels.max(1),
        }
    }

    /// Samples received but not yet written
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Folds sample batches into a frame.
pub trait Assembler {
    /// Buffer `samples` and write whatever is ready. Returns whether the
    /// frame changed.
    fn push(&mut self, frame: &mut Frame, samples: &[u16]) -> Result<bool, BeamError>;

    /// Write every buffered whole row, keeping a trailing partial row.
    fn flush(&mut self, frame: &mut Frame) -> Result<bool, BeamError>;

    /// End of scan: like [`flush`](Self::flush), but a trailing partial row
    /// is an error.
    fn finish(&mut self, frame: &mut Frame) -> Result<bool, BeamError>;
}

impl Assembler for LineAssembler {
    fn push(&mut self, frame: &mut Frame, samples: &[u16]) -> Result<bool, BeamError> {
        self.pending.extend_from_slice(samples);
        if self.pending.len() < self.update_pixels {
            return Ok(false);
        }
        self.flush(frame)
    }

    fn flush(&mut self, frame: &mut Frame) -> Result<bool, BeamError> {
        let whole = self.pending.len() / frame.x_count() * frame.x_count();
        if whole == 0 {
            return Ok(false);
        }
        frame.fill_lines(&self.pending[..whole])?;
        self.pending.drain(..whole);
        Ok(true)
    }

    fn finish(&mut self, frame: &mut Frame) -> Result<bool, BeamError> {
        let updated = self.flush(frame)?;
        if !self.pending.is_empty() {
            let partial = self.pending.len();
            self.pending.clear();
            return Err(BeamError::ShapeMismatch(format!(
                "scan ended with {partial} samples of an unfinished row"
            )));
        }
        Ok(updated)
    }
}

/// Composites a region-of-interest scan into a larger frame.
///
/// A scratch frame is seeded from the ROI of the full canvas so rows not
/// yet rescanned keep their previous content. After each batch the scratch
/// frame is copied back; pixels outside the ROI are never written.
#[derive(Debug, Clone)]
pub struct RoiAssembler {
    x_start: usize,
    y_start: usize,
    scratch: Frame,
    lines: LineAssembler,
}

impl RoiAssembler {
    pub fn new(
        full: &Frame,
        x_start: usize,
        y_start: usize,
        x_count: usize,
        y_count: usize,
        update_pixels: usize,
    ) -> Result<Self, BeamError> {
        if x_start + x_count > full.x_count() || y_start + y_count > full.y_count() {
            return Err(BeamError::InvalidParameter(format!(
                "ROI {x_count}x{y_count} at ({x_start}, {y_start}) outside {}x{} frame",
                full.x_count(),
                full.y_count()
            )));
        }
        let mut scratch = Frame::new(x_count, y_count)?;
        scratch.canvas.assign(&full.canvas.slice(s![
            y_start..y_start + y_count,
            x_start..x_start + x_count
        ]));
        debug!("ROI {x_count}x{y_count} at ({x_start}, {y_start})");
        Ok(Self {
            x_start,
            y_start,
            scratch,
            lines: LineAssembler::new(update_pixels),
        })
    }

    pub fn scratch(&self) -> &Frame {
        &self.scratch
    }

    fn write_back(&self, full: &mut Frame) {
        let (h, w) = self.scratch.canvas.dim();
        full.canvas
            .slice_mut(s![self.y_start..self.y_start + h, self.x_start..self.x_start + w])
            .assign(&self.scratch.canvas);
    }
}

impl Assembler for RoiAssembler {
    /// `full` is the whole frame; only the ROI is written.
    fn push(&mut self, full: &mut Frame, samples: &[u16]) -> Result<bool, BeamError> {
        let updated = self.lines.push(&mut self.scratch, samples)?;
        self.write_back(full);
        Ok(updated)
    }

    fn flush(&mut self, full: &mut Frame) -> Result<bool, BeamError> {
        let updated = self.lines.flush(&mut self.scratch)?;
        self.write_back(full);
        Ok(updated)
    }

    fn finish(&mut self, full: &mut Frame) -> Result<bool, BeamError> {
        let updated = self.lines.finish(&mut self.scratch);
        self.write_back(full);
        updated
    }
}
