//! Frame capture on top of a [`Connection`].

use std::iter;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::BeamError;
use crate::frame::{Assembler, Frame, LineAssembler, RoiAssembler, display_chunk_pixels};
use crate::protocol::Command;
use crate::streaming::{AbortHandle, ScanOptions, StreamReport};
use crate::types::{DacCodeRange, DwellTime, SyncMode};

/// Repaint pacing for progressive captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Target repaint rate
    pub fps: f64,
    /// Duration of one dwell unit in nanoseconds
    pub dwell_ns: f64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            fps: 60.0,
            dwell_ns: 125.0,
        }
    }
}

impl DisplayConfig {
    fn update_pixels(&self, x_count: usize, y_count: usize, dwell: u16) -> usize {
        display_chunk_pixels(
            x_count,
            y_count,
            self.fps,
            self.dwell_ns * f64::from(dwell.max(1)),
        )
    }
}

/// Captures images into a persistent frame.
///
/// The last captured frame is kept and reused as long as the resolution
/// does not change, so ROI scans composite onto the previous full image.
pub struct FrameBuffer {
    conn: Connection,
    current: Option<Frame>,
    abort: AbortHandle,
    options: ScanOptions,
    display: DisplayConfig,
}

impl FrameBuffer {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            current: None,
            abort: AbortHandle::new(),
            options: ScanOptions::default(),
            display: DisplayConfig::default(),
        }
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_display(mut self, display: DisplayConfig) -> Self {
        self.display = display;
        self
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Handle for stopping a capture from another thread
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.current.as_ref()
    }

    /// Make the current frame `x_res` by `y_res`, reusing and rewinding the
    /// existing one when the size matches.
    pub fn set_current_frame(&mut self, x_res: usize, y_res: usize) -> Result<&mut Frame, BeamError> {
        match self.current.take() {
            Some(mut frame) if frame.x_count() == x_res && frame.y_count() == y_res => {
                frame.rewind();
                Ok(self.current.insert(frame))
            }
            _ => {
                debug!("allocating {x_res}x{y_res} frame");
                Ok(self.current.insert(Frame::new(x_res, y_res)?))
            }
        }
    }

    /// Capture one complete frame over an arbitrary region and return it.
    pub fn capture_frame(
        &mut self,
        x: DacCodeRange,
        y: DacCodeRange,
        dwell: u16,
    ) -> Result<&Frame, BeamError> {
        let (x_count, y_count) = (x.pixels(), y.pixels());
        let pixels = x_count * y_count;
        self.set_current_frame(x_count, y_count)?;
        let mut options = self.options.clone();
        let frame_dwell = pixels as u64 * u64::from(dwell.max(1));
        options.latency = u32::try_from(frame_dwell).unwrap_or(u32::MAX);

        let dwells = iter::repeat_n(DwellTime(dwell), pixels);
        let report = self.run(
            x,
            y,
            dwells,
            &options,
            LineAssembler::new(pixels),
            &mut |_: &Frame| {},
        )?;
        if report.aborted {
            return Err(BeamError::Protocol("frame capture aborted".to_string()));
        }
        self.current
            .as_ref()
            .ok_or_else(|| BeamError::ShapeMismatch("no frame captured".to_string()))
    }

    /// Capture a full-field frame, calling `on_update` as rows arrive.
    pub fn capture_full_frame<F>(
        &mut self,
        x_res: u32,
        y_res: u32,
        dwell: u16,
        mut on_update: F,
    ) -> Result<StreamReport, BeamError>
    where
        F: FnMut(&Frame),
    {
        let x = DacCodeRange::from_resolution(x_res)?;
        let y = DacCodeRange::from_resolution(y_res)?;
        let (x_count, y_count) = (x.pixels(), y.pixels());
        self.set_current_frame(x_count, y_count)?;
        let update = self.display.update_pixels(x_count, y_count, dwell);
        info!("capturing {x_count}x{y_count} frame, repaint every {update} pixels");

        let options = self.options.clone();
        let dwells = iter::repeat_n(DwellTime(dwell), x_count * y_count);
        self.run(x, y, dwells, &options, LineAssembler::new(update), &mut on_update)
    }

    /// Rescan a rectangle of a `x_res` by `y_res` field, compositing it
    /// onto the current frame.
    #[allow(clippy::too_many_arguments)]
    pub fn capture_roi<F>(
        &mut self,
        x_res: u32,
        y_res: u32,
        x_start: u32,
        x_count: u32,
        y_start: u32,
        y_count: u32,
        dwell: u16,
        mut on_update: F,
    ) -> Result<StreamReport, BeamError>
    where
        F: FnMut(&Frame),
    {
        let x = DacCodeRange::from_roi(x_res, x_start, x_count)?;
        let y = DacCodeRange::from_roi(y_res, y_start, y_count)?;
        let update = self
            .display
            .update_pixels(x_count as usize, y_count as usize, dwell);
        let full = self.set_current_frame(x_res as usize, y_res as usize)?;
        let roi = RoiAssembler::new(
            full,
            x_start as usize,
            y_start as usize,
            x_count as usize,
            y_count as usize,
            update,
        )?;
        info!("capturing {x_count}x{y_count} ROI at ({x_start}, {y_start})");

        let options = self.options.clone();
        let dwells = iter::repeat_n(DwellTime(dwell), x.pixels() * y.pixels());
        self.run(x, y, dwells, &options, roi, &mut on_update)
    }

    /// Scan the full field repeatedly until aborted through
    /// [`abort_handle`](Self::abort_handle).
    pub fn capture_free_run<F>(
        &mut self,
        x_res: u32,
        y_res: u32,
        dwell: u16,
        mut on_update: F,
    ) -> Result<StreamReport, BeamError>
    where
        F: FnMut(&Frame),
    {
        let x = DacCodeRange::from_resolution(x_res)?;
        let y = DacCodeRange::from_resolution(y_res)?;
        let (x_count, y_count) = (x.pixels(), y.pixels());
        self.set_current_frame(x_count, y_count)?;
        let update = self.display.update_pixels(x_count, y_count, dwell);
        info!("free running {x_count}x{y_count}");

        let options = self.options.clone();
        self.run(
            x,
            y,
            iter::repeat(DwellTime(dwell)),
            &options,
            LineAssembler::new(update),
            &mut on_update,
        )
    }

    /// Unblank, stream `dwells` over the region, and fold the samples into
    /// the current frame. The frame is kept even when the scan fails.
    fn run<I, A>(
        &mut self,
        x: DacCodeRange,
        y: DacCodeRange,
        dwells: I,
        options: &ScanOptions,
        mut assembler: A,
        on_update: &mut dyn FnMut(&Frame),
    ) -> Result<StreamReport, BeamError>
    where
        I: IntoIterator<Item = DwellTime>,
        I::IntoIter: Send,
        A: Assembler,
    {
        let mut frame = self
            .current
            .take()
            .ok_or_else(|| BeamError::ShapeMismatch("no current frame".to_string()))?;

        let outcome = self.scan_into(&mut frame, x, y, dwells, options, &mut assembler, on_update);
        self.current = Some(frame);
        if self.abort.is_aborted() {
            info!("capture aborted");
            self.abort.reset();
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_into<I, A>(
        &mut self,
        frame: &mut Frame,
        x: DacCodeRange,
        y: DacCodeRange,
        dwells: I,
        options: &ScanOptions,
        assembler: &mut A,
        on_update: &mut dyn FnMut(&Frame),
    ) -> Result<StreamReport, BeamError>
    where
        I: IntoIterator<Item = DwellTime>,
        I::IntoIter: Send,
        A: Assembler,
    {
        self.conn.set_mode(SyncMode::raster(options.output));
        self.conn.transfer_raw(&Command::Blank {
            enable: false,
            inline: true,
        })?;

        let report = self
            .conn
            .raster_scan(x, y, dwells, options, &self.abort, |samples| {
                if assembler.push(frame, samples)? {
                    on_update(frame);
                }
                Ok(())
            })?;

        let updated = if report.aborted {
            assembler.flush(frame)?
        } else {
            assembler.finish(frame)?
        };
        if updated {
            on_update(frame);
        }
        debug!(
            "capture done: {} samples in {} chunks",
            report.samples, report.chunks_received
        );
        Ok(report)
    }
}
