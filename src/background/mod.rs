mod carousel;
mod loader;
mod video;

pub use carousel::Carousel;
pub use loader::{AssetLoader, LoadMode};
pub use video::{FfmpegVideoReader, SequentialReader};

use crate::error::{PipelineError, PipelineResult};
use image::{imageops, RgbImage};
use std::path::Path;

/// What kind of asset a background path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundKind {
    Image,
    Video,
}

/// The background currently in use.
pub enum BackgroundSource {
    Unset,
    StaticImage(RgbImage),
    LoopingVideo(Box<dyn SequentialReader>),
}

impl BackgroundSource {
    pub fn name(&self) -> &'static str {
        match self {
            BackgroundSource::Unset => "unset",
            BackgroundSource::StaticImage(_) => "image",
            BackgroundSource::LoopingVideo(_) => "video",
        }
    }
}

/// Supplies a background frame resized to whatever the current frame needs.
///
/// Owns the source exclusively. Replacing the source drops the previous one,
/// which closes any open video decoder.
pub struct BackgroundProvider {
    source: BackgroundSource,
    loader: AssetLoader,
}

impl Default for BackgroundProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundProvider {
    pub fn new() -> Self {
        Self {
            source: BackgroundSource::Unset,
            loader: AssetLoader,
        }
    }

    pub fn source(&self) -> &BackgroundSource {
        &self.source
    }

    /// Switch to the image or video at `path`.
    ///
    /// On failure the previous source is left untouched.
    pub fn set_source(&mut self, path: &Path, kind: BackgroundKind) -> PipelineResult<()> {
        match kind {
            BackgroundKind::Image => {
                let image = self
                    .loader
                    .load(path, LoadMode::Unchanged)
                    .filter(|image| image.width() > 0 && image.height() > 0)
                    .ok_or_else(|| PipelineError::BackgroundLoad {
                        path: path.to_path_buf(),
                        reason: "image could not be decoded".to_string(),
                    })?;
                // Gray and RGBA images are coerced to 3 channels once, here.
                self.set_static_image(image.to_rgb8());
            }
            BackgroundKind::Video => {
                let reader =
                    FfmpegVideoReader::open(path).map_err(|err| PipelineError::BackgroundLoad {
                        path: path.to_path_buf(),
                        reason: format!("{err:#}"),
                    })?;
                self.set_video_reader(Box::new(reader));
            }
        }

        tracing::info!("Background set to {} ({:?})", path.display(), kind);
        Ok(())
    }

    pub fn set_static_image(&mut self, image: RgbImage) {
        self.source = BackgroundSource::StaticImage(image);
    }

    pub fn set_video_reader(&mut self, reader: Box<dyn SequentialReader>) {
        // Assigning drops the previous reader and its decoder.
        self.source = BackgroundSource::LoopingVideo(reader);
    }

    /// Drop whatever source is held. Safe to call repeatedly.
    pub fn release(&mut self) {
        if !matches!(self.source, BackgroundSource::Unset) {
            tracing::info!("Releasing {} background", self.source.name());
        }
        self.source = BackgroundSource::Unset;
    }

    /// Background frame of exactly `width`x`height`, 3 channels.
    ///
    /// Never fails: an unset source or an unreadable video yields black.
    pub fn frame(&mut self, height: u32, width: u32) -> RgbImage {
        let _span = tracing::debug_span!("background").entered();

        let frame = match &mut self.source {
            BackgroundSource::Unset => None,
            BackgroundSource::StaticImage(image) => Some(resize_to(image, width, height)),
            BackgroundSource::LoopingVideo(reader) => {
                next_looping_frame(reader.as_mut()).map(|f| resize_to(&f, width, height))
            }
        };

        frame.unwrap_or_else(|| RgbImage::new(width, height))
    }
}

/// Next frame, restarting from the first frame once at end of stream.
fn next_looping_frame(reader: &mut dyn SequentialReader) -> Option<RgbImage> {
    match reader.read_frame() {
        Ok(Some(frame)) => return Some(frame),
        Ok(None) => tracing::debug!("Background video ended, restarting"),
        Err(err) => tracing::warn!("Background video read failed, restarting: {:#}", err),
    }

    if let Err(err) = reader.rewind() {
        tracing::warn!("Failed to rewind background video: {:#}", err);
        return None;
    }

    match reader.read_frame() {
        Ok(Some(frame)) => Some(frame),
        Ok(None) => {
            tracing::warn!("Background video has no readable frames");
            None
        }
        Err(err) => {
            tracing::warn!("Background video read failed after restart: {:#}", err);
            None
        }
    }
}

fn resize_to(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        image.clone()
    } else {
        imageops::resize(image, width, height, imageops::FilterType::Triangle)
    }
}
