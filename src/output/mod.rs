mod loopback;
mod recorder;

pub use loopback::V4L2Output;
pub use recorder::{FfmpegRecorder, FourCc, RecordingSpec};

use crate::error::PipelineResult;
use anyhow::Result;
use image::RgbImage;

/// Trait for the display boundary
pub trait DisplaySink {
    /// Show one composited frame together with the current frame rate
    fn publish(&mut self, frame: &RgbImage, fps: f32) -> Result<()>;
}

impl<T: DisplaySink + ?Sized> DisplaySink for Box<T> {
    fn publish(&mut self, frame: &RgbImage, fps: f32) -> Result<()> {
        (**self).publish(frame, fps)
    }
}

/// Trait for the recording boundary
pub trait RecordingSink {
    /// Append one frame, already at the recording resolution
    fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()>;

    /// Finish the file. Safe to call more than once and never fails
    fn close(&mut self);
}

/// Display that only reports the frame rate, for running without a screen.
pub struct HeadlessDisplay {
    frames: u64,
    report_every: u64,
}

impl HeadlessDisplay {
    pub fn new(report_every: u64) -> Self {
        Self {
            frames: 0,
            report_every: report_every.max(1),
        }
    }
}

impl DisplaySink for HeadlessDisplay {
    fn publish(&mut self, frame: &RgbImage, fps: f32) -> Result<()> {
        self.frames += 1;
        if self.frames % self.report_every == 0 {
            let (width, height) = frame.dimensions();
            tracing::info!("Frame {}: {}x{}, FPS: {:.1}", self.frames, width, height, fps);
        }
        Ok(())
    }
}
