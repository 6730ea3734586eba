use crate::error::PipelineError;
use image::DynamicImage;
use std::path::Path;
use thiserror::Error;

/// How decoded pixels are handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Keep whatever channel layout the file carries.
    #[default]
    Unchanged,
    /// Coerce to 3-channel RGB.
    Color,
}

/// Why an asset could not be loaded.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("file could not be read: {0}")]
    Missing(#[source] std::io::Error),
    #[error("file is empty")]
    Empty,
    #[error("codec could not decode the file: {0}")]
    Decode(#[source] image::ImageError),
}

/// Loads images from any filesystem path, including non-ASCII ones.
///
/// The file is read into memory as raw bytes and decoded from the buffer, so
/// nothing depends on how the platform converts the path for image codecs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssetLoader;

impl AssetLoader {
    /// Decode the image at `path`, or `None` when it cannot be loaded.
    ///
    /// The reason is logged; callers only see the empty result.
    pub fn load(&self, path: &Path, mode: LoadMode) -> Option<DynamicImage> {
        match self.try_load(path, mode) {
            Ok(image) => Some(image),
            Err(err) => {
                tracing::warn!("{}", err.into_pipeline_error(path));
                None
            }
        }
    }

    /// Like [`AssetLoader::load`] but reports which failure happened.
    pub fn try_load(&self, path: &Path, mode: LoadMode) -> Result<DynamicImage, AssetError> {
        let bytes = std::fs::read(path).map_err(AssetError::Missing)?;
        if bytes.is_empty() {
            return Err(AssetError::Empty);
        }

        let image = image::load_from_memory(&bytes).map_err(AssetError::Decode)?;
        tracing::debug!(
            "Decoded {} ({}x{}, {:?})",
            path.display(),
            image.width(),
            image.height(),
            image.color()
        );

        Ok(match mode {
            LoadMode::Unchanged => image,
            LoadMode::Color => DynamicImage::ImageRgb8(image.to_rgb8()),
        })
    }
}

impl AssetError {
    pub fn into_pipeline_error(self, path: &Path) -> PipelineError {
        PipelineError::AssetDecode {
            path: path.to_path_buf(),
            reason: self.to_string(),
        }
    }
}
